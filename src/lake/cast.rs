// =============================================================================
// Tolerant Casts — Normalized JSON values to analytical column types
// =============================================================================
//
// The normalized layer carries nullable metrics exactly as the upstream API
// reported them, which is sometimes a number, sometimes a numeric string,
// and sometimes junk like "N/A".  Materialization is the single place typing
// is enforced: a value that cannot be converted degrades to null, and a cast
// never fails a run.
// =============================================================================

use chrono::Utc;
use serde_json::Value;

use crate::snapshot::record::{MaterializedRecord, NormalizedRecord};
use crate::types::FetchWindow;

/// Cast to a 64-bit integer.  Accepts JSON integers, finite floats
/// (truncated, SQL CAST style) and strings containing either; anything else
/// is null.
pub fn cast_i64(val: &Value) -> Option<i64> {
    match val {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let t = s.trim();
            t.parse::<i64>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

/// Cast to a finite 64-bit float.  Accepts JSON numbers and numeric strings;
/// anything else is null.
pub fn cast_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Cast one normalized record into its analytical row for `window`.
pub fn to_materialized(
    record: &NormalizedRecord,
    window: &FetchWindow,
    inserted_at: i64,
) -> MaterializedRecord {
    MaterializedRecord {
        asset_id: record.asset_id.clone(),
        symbol: record.symbol.clone(),
        name: record.name.clone(),
        price: record.price,
        market_cap: cast_i64(&record.market_cap),
        market_cap_rank: cast_i64(&record.market_cap_rank),
        volume_24h: cast_i64(&record.volume_24h),
        pct_change_1h: cast_f64(&record.pct_change_1h),
        pct_change_24h: cast_f64(&record.pct_change_24h),
        pct_change_7d: cast_f64(&record.pct_change_7d),
        observed_at: record.observed_at,
        year: window.year(),
        month: window.month(),
        day: window.day(),
        hour: window.hour(),
        inserted_at,
        source_fetch_window: window.label(),
    }
}

/// Current wall clock as epoch seconds, for `inserted_at` stamping.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}
