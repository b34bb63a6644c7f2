// =============================================================================
// Lake — Incremental materialization of completed hour windows
// =============================================================================

pub mod cast;
pub mod engine;
pub mod local;
pub mod materializer;
pub mod provenance;
pub mod statement;

pub use local::LocalQueryEngine;
pub use materializer::{MaterializeError, Materializer};
pub use provenance::ProvenanceLog;
pub use statement::TemplateStore;
