// =============================================================================
// Snapshot Ingestor — One fetch / archive / normalize / write run
// =============================================================================
//
// Drives a single ingest invocation through its phases:
//
//   Fetch -> ArchiveRaw -> Normalize -> WriteNormalized
//
// Each phase either advances or ends the run; the failing phase is part of
// the surfaced error and of the failure event sent to the sink.  A fatal
// fetch therefore records zero writes; a payload-level schema failure still
// leaves the raw body archived for forensics.
//
// Per-record schema violations never end a run: they reduce the written
// count and surface as `skipped` on the report.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::archive::{PartitionStore, RawArchive};
use crate::failure::{Component, FailureEvent, FailureSink};
use crate::market::SnapshotFetcher;
use crate::snapshot::normalizer::normalize;
use crate::types::FetchWindow;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Phase of an ingest run, carried in failure context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestPhase {
    Fetch,
    ArchiveRaw,
    Normalize,
    WriteNormalized,
}

impl std::fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch => write!(f, "fetch"),
            Self::ArchiveRaw => write!(f, "archive-raw"),
            Self::Normalize => write!(f, "normalize"),
            Self::WriteNormalized => write!(f, "write-normalized"),
        }
    }
}

/// Terminal failure of an ingest run.
#[derive(Debug, Error)]
#[error("ingest failed during {phase}: {message}")]
pub struct IngestError {
    pub phase: IngestPhase,
    pub message: String,
}

/// Serializable outcome of a successful run; printed as one JSON line for
/// the orchestrating caller.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Instant the snapshot was fetched.
    pub fetched_at: DateTime<Utc>,

    /// Hour window the records landed in.
    pub window: FetchWindow,

    /// Key of the archived raw payload.
    pub raw_key: String,

    /// Name of the normalized file written by this run.
    pub file_id: String,

    /// Records written to the normalized layer.
    pub records_written: usize,

    /// Entries dropped for schema violations.
    pub skipped: usize,

    /// Upstream request id of the fetch.
    pub source_request_id: String,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Ties the fetcher, raw archive, partition store and failure sink together
/// for one short-lived ingest invocation.
pub struct Ingestor {
    pub fetcher: Arc<dyn SnapshotFetcher>,
    pub raw_archive: Arc<dyn RawArchive>,
    pub partition_store: Arc<dyn PartitionStore>,
    pub failure_sink: FailureSink,
}

impl Ingestor {
    pub fn new(
        fetcher: Arc<dyn SnapshotFetcher>,
        raw_archive: Arc<dyn RawArchive>,
        partition_store: Arc<dyn PartitionStore>,
        failure_sink: FailureSink,
    ) -> Self {
        Self {
            fetcher,
            raw_archive,
            partition_store,
            failure_sink,
        }
    }

    /// Run one ingest invocation.
    ///
    /// `at_override` pins the effective fetch instant (partition placement,
    /// observed_at) instead of the client's wall clock; used for reruns and
    /// tests.
    pub async fn run(&self, at_override: Option<DateTime<Utc>>) -> Result<IngestReport, IngestError> {
        info!("ingest run started");

        // -----------------------------------------------------------------
        // Fetch (transient failures are retried inside the client; whatever
        // reaches here ends the run)
        // -----------------------------------------------------------------
        let mut payload = match self.fetcher.fetch_snapshot().await {
            Ok(p) => p,
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "ingest fetch failed");
                self.failure_sink.record(FailureEvent::new(
                    Component::Ingestor,
                    "fetch_fatal",
                    &message,
                ));
                return Err(IngestError {
                    phase: IngestPhase::Fetch,
                    message,
                });
            }
        };

        if let Some(at) = at_override {
            payload.fetched_at = at;
        }
        let window = FetchWindow::containing(payload.fetched_at);

        info!(
            fetched_at = %payload.fetched_at,
            window = %window,
            bytes = payload.body.len(),
            request_id = %payload.source_request_id,
            "snapshot fetched"
        );

        // -----------------------------------------------------------------
        // Archive raw (verbatim, before any parsing opinion)
        // -----------------------------------------------------------------
        let raw_key = match self.raw_archive.put(payload.fetched_at, &payload.body) {
            Ok(key) => key,
            Err(err) => {
                let message = err.to_string();
                self.failure_sink.record(
                    FailureEvent::new(Component::Ingestor, "archive", &message)
                        .with_window(window.to_string()),
                );
                return Err(IngestError {
                    phase: IngestPhase::ArchiveRaw,
                    message,
                });
            }
        };

        // -----------------------------------------------------------------
        // Normalize
        // -----------------------------------------------------------------
        let batch = match normalize(&payload.body, payload.fetched_at) {
            Ok(batch) => batch,
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, raw_key = %raw_key, "payload failed normalization, raw copy kept");
                self.failure_sink.record(
                    FailureEvent::new(Component::Ingestor, "schema", &message)
                        .with_window(window.to_string()),
                );
                return Err(IngestError {
                    phase: IngestPhase::Normalize,
                    message,
                });
            }
        };

        if batch.skipped > 0 {
            warn!(
                skipped = batch.skipped,
                window = %window,
                "entries skipped for schema violations"
            );
            self.failure_sink.record(
                FailureEvent::new(
                    Component::Ingestor,
                    "schema_skip",
                    "entries skipped for schema violations",
                )
                .with_window(window.to_string())
                .with_skipped(batch.skipped),
            );
        }

        // -----------------------------------------------------------------
        // Write normalized
        // -----------------------------------------------------------------
        let stored = match self.partition_store.write_batch(&batch) {
            Ok(stored) => stored,
            Err(err) => {
                let message = err.to_string();
                self.failure_sink.record(
                    FailureEvent::new(Component::Ingestor, "write", &message)
                        .with_window(window.to_string()),
                );
                return Err(IngestError {
                    phase: IngestPhase::WriteNormalized,
                    message,
                });
            }
        };

        info!(
            window = %window,
            raw_key = %raw_key,
            path = %stored.path.display(),
            records = stored.records,
            skipped = batch.skipped,
            "ingest run complete"
        );

        Ok(IngestReport {
            fetched_at: payload.fetched_at,
            window,
            raw_key,
            file_id: stored.file_id,
            records_written: stored.records,
            skipped: batch.skipped,
            source_request_id: payload.source_request_id,
        })
    }
}
