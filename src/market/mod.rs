pub mod client;

// Re-export the client surface for convenient access (e.g. `use crate::market::MarketClient`).
pub use client::{MarketClient, SnapshotFetcher};
