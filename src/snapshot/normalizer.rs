// =============================================================================
// Snapshot Normalizer — Raw payload to typed records
// =============================================================================
//
// Turns one verbatim snapshot payload into an ordered batch of
// NormalizedRecords.  The contract with storage:
//
//   * `asset_id` and a parseable `current_price` are required; an entry
//     violating either is skipped and counted, never fails the batch.
//   * Duplicate `asset_id`s within one payload collapse to a single record;
//     the later occurrence in document order wins.
//   * Every record observes the fetch instant (epoch seconds) and carries
//     the partition keys of the hour the fetch fell into.
//
// Only a payload whose top level is not a JSON array fails the whole batch;
// the raw body is already archived at that point, so nothing is lost.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::snapshot::record::NormalizedRecord;
use crate::types::FetchWindow;

/// Whole-payload schema failure.  Per-entry violations are counted skips,
/// not errors.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload top level is not an array (got {got})")]
    NotAnArray { got: &'static str },
}

/// Result of normalizing one payload.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    /// The hour window the fetch instant fell into.
    pub window: FetchWindow,

    /// Instant of the fetch the batch was derived from.
    pub fetched_at: DateTime<Utc>,

    /// Deduplicated records in document order.
    pub records: Vec<NormalizedRecord>,

    /// Entries dropped for schema violations (missing id, unparseable price).
    pub skipped: usize,
}

/// Normalize a verbatim snapshot body fetched at `fetched_at`.
pub fn normalize(body: &str, fetched_at: DateTime<Utc>) -> Result<NormalizedBatch, NormalizeError> {
    let root: Value = serde_json::from_str(body)?;

    let entries = match root.as_array() {
        Some(arr) => arr,
        None => {
            return Err(NormalizeError::NotAnArray {
                got: json_type_name(&root),
            })
        }
    };

    let window = FetchWindow::containing(fetched_at);
    let observed_at = fetched_at.timestamp();

    let mut records: Vec<NormalizedRecord> = Vec::with_capacity(entries.len());
    // asset_id -> position in `records`, so a duplicate replaces in place.
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;

    for entry in entries {
        let obj = match entry.as_object() {
            Some(o) => o,
            None => {
                warn!(got = json_type_name(entry), "skipping non-object snapshot entry");
                skipped += 1;
                continue;
            }
        };

        let asset_id = match obj.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                warn!("skipping snapshot entry without asset id");
                skipped += 1;
                continue;
            }
        };

        let price = match obj.get("current_price").and_then(parse_value_f64) {
            Some(p) => p,
            None => {
                warn!(asset_id = %asset_id, "skipping snapshot entry without parseable price");
                skipped += 1;
                continue;
            }
        };

        let record = NormalizedRecord {
            symbol: obj
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            name: obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            price,
            market_cap: passthrough(obj, "market_cap"),
            market_cap_rank: passthrough(obj, "market_cap_rank"),
            volume_24h: passthrough(obj, "total_volume"),
            pct_change_1h: passthrough(obj, "price_change_percentage_1h_in_currency"),
            pct_change_24h: passthrough(obj, "price_change_percentage_24h_in_currency"),
            pct_change_7d: passthrough(obj, "price_change_percentage_7d_in_currency"),
            observed_at,
            year: window.year(),
            month: window.month(),
            day: window.day(),
            hour: window.hour(),
            asset_id,
        };

        match seen.get(&record.asset_id) {
            // Later occurrence in document order wins.
            Some(&idx) => records[idx] = record,
            None => {
                seen.insert(record.asset_id.clone(), records.len());
                records.push(record);
            }
        }
    }

    debug!(
        window = %window,
        records = records.len(),
        skipped,
        "snapshot normalized"
    );

    Ok(NormalizedBatch {
        window,
        fetched_at,
        records,
        skipped,
    })
}

/// Upstream sends numeric fields sometimes as numbers, sometimes as strings.
/// Accept both; reject anything non-finite.
fn parse_value_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Carry a field through untyped (null when absent).
fn passthrough(obj: &serde_json::Map<String, Value>, key: &str) -> Value {
    obj.get(key).cloned().unwrap_or(Value::Null)
}

fn json_type_name(val: &Value) -> &'static str {
    match val {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
