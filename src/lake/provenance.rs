// =============================================================================
// Provenance Log — Append-only audit trail of materializations
// =============================================================================
//
// One JSON line per executed statement: the engine's query id, the window,
// how many rows the run inserted and the statement text itself.  The log is
// the answer to "what produced the rows in this partition": a no-op re-run
// still gets a line (rows_inserted 0), so the full run history is visible.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::FetchWindow;

/// One materialization run, as recorded in the provenance log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Engine-assigned execution id.
    pub query_id: String,

    /// Window in CLI form, e.g. "2025-09-08T02".
    pub window: String,

    /// Rows the execution inserted (zero on an idempotent re-run).
    pub rows_inserted: u64,

    /// The exact statement text that was executed.
    pub statement: String,

    /// RFC 3339 instant the record was appended.
    pub recorded_at: String,
}

impl ProvenanceRecord {
    pub fn new(query_id: String, window: &FetchWindow, rows_inserted: u64, statement: String) -> Self {
        Self {
            query_id,
            window: window.to_string(),
            rows_inserted,
            statement,
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Append-only JSONL log on the local filesystem.
pub struct ProvenanceLog {
    path: PathBuf,
}

impl ProvenanceLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append one record.  Creates the parent directory and the file on first
    /// use.
    pub fn append(&self, record: &ProvenanceRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open provenance log {}", self.path.display()))?;
        let line = serde_json::to_string(record).context("failed to serialise provenance record")?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// The last `n` records, oldest first.  A missing log reads as empty and
    /// malformed lines are skipped with a warning, so a partial write can
    /// never make the history unreadable.
    pub fn tail(&self, n: usize) -> anyhow::Result<Vec<ProvenanceRecord>> {
        let mut records = self.read_all()?;
        if records.len() > n {
            records.drain(..records.len() - n);
        }
        Ok(records)
    }

    /// Every record for one window, oldest first.
    pub fn for_window(&self, window: &FetchWindow) -> anyhow::Result<Vec<ProvenanceRecord>> {
        let label = window.to_string();
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.window == label)
            .collect())
    }

    fn read_all(&self) -> anyhow::Result<Vec<ProvenanceRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read provenance log {}", self.path.display())
                })
            }
        };

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ProvenanceRecord>(line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(line = idx + 1, %error, "skipping malformed provenance line")
                }
            }
        }
        Ok(records)
    }
}
