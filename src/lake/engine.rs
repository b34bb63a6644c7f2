// =============================================================================
// Query Engine — Seam between the materializer and statement execution
// =============================================================================
//
// The materializer submits exactly one request per run and trusts the engine
// for the heavy lifting: locking, the anti-join and the columnar write all
// live behind this trait.  The in-tree implementation is LocalQueryEngine; a
// deployment fronting a warehouse would implement the same trait over its
// query API and return the warehouse's own execution id.
// =============================================================================

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::FetchWindow;

/// One materialization submission: the window plus the rendered statement
/// describing the transformation.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub window: FetchWindow,
    pub statement: String,
}

/// Identity and outcome of one executed statement.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExecution {
    /// Engine-assigned execution id, unique per submission.
    pub query_id: String,

    /// Rows the execution actually inserted.  Zero on a re-run of an already
    /// materialized window.
    pub rows_inserted: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another materialization of the same window is in flight.
    #[error("window is locked by another materialization: {0}")]
    WindowLocked(String),

    /// Reading or decoding either side of the anti-join failed.
    #[error("window scan failed: {0}")]
    Scan(String),

    /// Writing the columnar output failed.
    #[error("columnar write failed: {0}")]
    Write(String),
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, request: MaterializeRequest) -> Result<QueryExecution, EngineError>;
}
