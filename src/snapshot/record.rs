// =============================================================================
// Snapshot Records — Normalized and materialized row shapes
// =============================================================================
//
// NormalizedRecord is the JSONL row written by the ingestor.  The nullable
// analytical metrics (market cap, rank, volume, percentage changes) are kept
// as the upstream JSON values verbatim: the API occasionally reports them as
// strings ("N/A") or omits them, and the single place typing is enforced is
// the tolerant cast at materialization.
//
// MaterializedRecord is the fully typed columnar row written to the
// analytical layer.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::NaturalKey;

/// One normalized asset observation, as stored in the hour-partitioned
/// JSONL layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Stable upstream asset identifier (e.g. "bitcoin").  Required.
    pub asset_id: String,

    /// Ticker symbol (e.g. "btc").
    #[serde(default)]
    pub symbol: String,

    /// Human-readable asset name.
    #[serde(default)]
    pub name: String,

    /// Spot price in the quote currency.  Required.
    pub price: f64,

    /// Market capitalization as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub market_cap: Value,

    /// Market cap rank as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub market_cap_rank: Value,

    /// 24h trade volume as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub volume_24h: Value,

    /// 1h price change percentage as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub pct_change_1h: Value,

    /// 24h price change percentage as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub pct_change_24h: Value,

    /// 7d price change percentage as reported upstream (JSON value verbatim).
    #[serde(default)]
    pub pct_change_7d: Value,

    /// Fetch instant as epoch seconds; shared by every record of one fetch.
    pub observed_at: i64,

    /// Partition keys derived from the fetch instant (UTC).
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl NormalizedRecord {
    /// Natural key identifying this observation across the lake.
    pub fn natural_key(&self) -> NaturalKey {
        (self.asset_id.clone(), self.observed_at)
    }
}

/// One fully typed row of the analytical (columnar) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedRecord {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    pub price: f64,

    /// Nullable analytical metrics; a value the tolerant cast could not
    /// convert is null here.
    pub market_cap: Option<i64>,
    pub market_cap_rank: Option<i64>,
    pub volume_24h: Option<i64>,
    pub pct_change_1h: Option<f64>,
    pub pct_change_24h: Option<f64>,
    pub pct_change_7d: Option<f64>,

    pub observed_at: i64,

    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,

    /// Epoch seconds at which this row was inserted.
    pub inserted_at: i64,

    /// RFC 3339 start of the window the row was materialized from.
    pub source_fetch_window: String,
}
