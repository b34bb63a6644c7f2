// =============================================================================
// Partition Store — Hour-partitioned normalized layer (zstd JSONL)
// =============================================================================
//
// Normalized batches land as `year=YYYY/month=MM/day=DD/hour=HH/<file>.jsonl.zst`
// under the normalized root.  Writers only ever create new files (the file id
// embeds the fetch instant plus a unique suffix) and publish atomically, so:
//
//   * overlapping ingest invocations cannot clobber each other,
//   * a crashed run leaves either nothing or a complete file,
//   * re-running an hour adds sibling files; dedup is the materializer's job.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::archive::raw::short_id;
use crate::snapshot::normalizer::NormalizedBatch;
use crate::snapshot::record::NormalizedRecord;
use crate::types::FetchWindow;

/// One file written into the normalized layer.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// File name without directory (unique per invocation).
    pub file_id: String,
    /// Full path of the published file.
    pub path: PathBuf,
    /// Number of records serialized into the file.
    pub records: usize,
}

/// Hour-partitioned store of normalized records.
pub trait PartitionStore: Send + Sync {
    /// Serialize a batch as one new compressed JSONL file in its window's
    /// partition.  Never touches existing files.
    fn write_batch(&self, batch: &NormalizedBatch) -> Result<StoredFile>;

    /// All normalized files of a window, sorted by path.  A window that was
    /// never written lists as empty.
    fn list_files(&self, window: &FetchWindow) -> Result<Vec<PathBuf>>;

    /// Decode and parse one normalized file.
    fn read_file(&self, path: &Path) -> Result<Vec<NormalizedRecord>>;
}

/// Filesystem-backed partition store.
pub struct FsPartitionStore {
    root: PathBuf,
    zstd_level: i32,
}

impl FsPartitionStore {
    pub fn new(root: impl Into<PathBuf>, zstd_level: i32) -> Self {
        Self {
            root: root.into(),
            zstd_level,
        }
    }

    fn partition_dir(&self, window: &FetchWindow) -> PathBuf {
        self.root.join(window.partition_path())
    }
}

impl PartitionStore for FsPartitionStore {
    fn write_batch(&self, batch: &NormalizedBatch) -> Result<StoredFile> {
        let dir = self.partition_dir(&batch.window);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create partition dir {}", dir.display()))?;

        let file_id = format!(
            "snap-{}-{}.jsonl.zst",
            batch.fetched_at.format("%Y%m%dT%H%M%S%3fZ"),
            short_id()
        );
        let path = dir.join(&file_id);
        let tmp_path = dir.join(format!("{file_id}.tmp"));

        let mut lines = Vec::with_capacity(batch.records.len() * 256);
        for record in &batch.records {
            serde_json::to_writer(&mut lines, record)
                .context("failed to serialise normalized record")?;
            lines.push(b'\n');
        }

        let compressed = zstd::encode_all(lines.as_slice(), self.zstd_level)
            .context("failed to zstd-compress normalized batch")?;

        // Atomic publish: write tmp, fsync, rename.
        {
            let mut file = std::fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create tmp file {}", tmp_path.display()))?;
            file.write_all(&compressed)
                .with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync tmp file {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to publish normalized file {}", path.display()))?;

        debug!(
            window = %batch.window,
            file = %file_id,
            records = batch.records.len(),
            compressed_bytes = compressed.len(),
            "normalized batch written"
        );

        Ok(StoredFile {
            file_id,
            path,
            records: batch.records.len(),
        })
    }

    fn list_files(&self, window: &FetchWindow) -> Result<Vec<PathBuf>> {
        let dir = self.partition_dir(window);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list partition dir {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".jsonl.zst"))
                    .unwrap_or(false)
            })
            .collect();

        // Sorted for a deterministic scan order.
        paths.sort();
        Ok(paths)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<NormalizedRecord>> {
        let compressed = std::fs::read(path)
            .with_context(|| format!("failed to read normalized file {}", path.display()))?;

        let decoded = zstd::decode_all(compressed.as_slice())
            .with_context(|| format!("failed to zstd-decode {}", path.display()))?;

        let text = String::from_utf8(decoded)
            .with_context(|| format!("normalized file {} is not UTF-8", path.display()))?;

        let mut records = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: NormalizedRecord = serde_json::from_str(line).with_context(|| {
                format!("failed to parse line {} of {}", n + 1, path.display())
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn sample_record(asset_id: &str, price: f64, observed_at: i64) -> NormalizedRecord {
        NormalizedRecord {
            asset_id: asset_id.to_string(),
            symbol: asset_id.chars().take(3).collect(),
            name: format!("{asset_id} coin"),
            price,
            market_cap: json!(1_000_000),
            market_cap_rank: json!(1),
            volume_24h: json!(50_000),
            pct_change_1h: json!(0.5),
            pct_change_24h: json!(-1.2),
            pct_change_7d: json!(3.4),
            observed_at,
            year: 2025,
            month: 9,
            day: 8,
            hour: 2,
        }
    }

    fn sample_batch(assets: &[&str]) -> NormalizedBatch {
        let fetched_at = Utc.with_ymd_and_hms(2025, 9, 8, 2, 13, 7).unwrap();
        NormalizedBatch {
            window: FetchWindow::containing(fetched_at),
            fetched_at,
            records: assets
                .iter()
                .enumerate()
                .map(|(i, a)| sample_record(a, 100.0 + i as f64, fetched_at.timestamp()))
                .collect(),
            skipped: 0,
        }
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let batch = sample_batch(&["bitcoin", "ethereum", "solana"]);
        let stored = store.write_batch(&batch).unwrap();
        assert_eq!(stored.records, 3);

        let read = store.read_file(&stored.path).unwrap();
        assert_eq!(read, batch.records);
    }

    #[test]
    fn files_land_in_the_window_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let batch = sample_batch(&["bitcoin"]);
        let stored = store.write_batch(&batch).unwrap();

        let expected_dir = dir
            .path()
            .join("normalized/year=2025/month=09/day=08/hour=02");
        assert!(stored.path.starts_with(&expected_dir));
        assert!(stored.file_id.starts_with("snap-20250908T021307"));
    }

    #[test]
    fn repeated_writes_add_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let batch = sample_batch(&["bitcoin"]);
        let first = store.write_batch(&batch).unwrap();
        let second = store.write_batch(&batch).unwrap();
        assert_ne!(first.file_id, second.file_id);

        let files = store.list_files(&batch.window).unwrap();
        assert_eq!(files.len(), 2);
        // Sorted scan order.
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn unwritten_window_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let window = FetchWindow::parse("2025-01-01T00").unwrap();
        assert!(store.list_files(&window).unwrap().is_empty());
    }

    #[test]
    fn empty_batch_writes_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let batch = sample_batch(&[]);
        let stored = store.write_batch(&batch).unwrap();
        assert_eq!(stored.records, 0);
        assert!(store.read_file(&stored.path).unwrap().is_empty());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);
        let batch = sample_batch(&["bitcoin"]);
        let stored = store.write_batch(&batch).unwrap();

        let partition_dir = stored.path.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(partition_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path().join("normalized"), 3);

        let path = dir.path().join("garbage.jsonl.zst");
        std::fs::write(&path, b"definitely not zstd").unwrap();
        assert!(store.read_file(&path).is_err());
    }
}
