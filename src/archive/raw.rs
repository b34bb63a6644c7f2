// =============================================================================
// Raw Archive — Verbatim payload bodies, keyed by fetch instant
// =============================================================================
//
// The raw layer exists for forensics and replay: whatever the upstream API
// returned is kept byte-for-byte, before any parsing opinion is applied.
// Keys embed the fetch instant at nanosecond resolution plus a short unique
// suffix, so overlapping invocations in the same instant never collide.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Store of verbatim upstream payloads.
pub trait RawArchive: Send + Sync {
    /// Persist one payload body; returns the storage key.
    fn put(&self, fetched_at: DateTime<Utc>, body: &str) -> Result<String>;
}

/// Filesystem-backed raw archive writing one object per fetch.
pub struct FsRawArchive {
    dir: PathBuf,
}

impl FsRawArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RawArchive for FsRawArchive {
    fn put(&self, fetched_at: DateTime<Utc>, body: &str) -> Result<String> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create raw dir {}", self.dir.display()))?;

        let key = format!(
            "{}_{}.json",
            fetched_at.format("%Y%m%dT%H%M%S%.9fZ"),
            short_id()
        );
        let path = self.dir.join(&key);
        let tmp_path = self.dir.join(format!("{key}.tmp"));

        // Atomic publish: write to tmp, then rename.
        std::fs::write(&tmp_path, body)
            .with_context(|| format!("failed to write tmp raw object {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to publish raw object {}", path.display()))?;

        debug!(key = %key, bytes = body.len(), "raw payload archived");
        Ok(key)
    }
}

/// First 8 hex chars of a fresh UUID v4.
pub(crate) fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
