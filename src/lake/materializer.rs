// =============================================================================
// Materializer — One window, one statement, one provenance record
// =============================================================================
//
// The thin orchestration layer over the statement store, the query engine and
// the provenance log.  Its job is ordering and bookkeeping, not data work:
//
//   * refuse a window whose hour has not fully elapsed, before any statement
//     is even rendered,
//   * render the statement, submit exactly one request to the engine,
//   * append the provenance record (query id, row count, statement text),
//   * report terminal failures to the failure sink on the way out.
//
// A run that inserts zero rows is a success: it means the window was already
// materialized or genuinely empty, which is exactly what re-running after a
// suspected partial failure should find.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::failure::{Component, FailureEvent, FailureSink};
use crate::lake::engine::{EngineError, MaterializeRequest, QueryEngine};
use crate::lake::provenance::{ProvenanceLog, ProvenanceRecord};
use crate::lake::statement::{StatementError, StatementStore};
use crate::types::FetchWindow;

#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The window's hour has not fully elapsed yet.
    #[error("window {window} is not complete yet (closes at {closes_at})")]
    WindowNotReady { window: String, closes_at: String },

    #[error("statement store: {0}")]
    Statement(#[from] StatementError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("provenance log: {0}")]
    Provenance(String),
}

/// Outcome of one materialization run, as printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct MaterializeReport {
    pub window: FetchWindow,
    pub query_id: String,
    pub rows_inserted: u64,
}

pub struct Materializer {
    statements: Arc<dyn StatementStore>,
    engine: Arc<dyn QueryEngine>,
    provenance: ProvenanceLog,
    failure_sink: FailureSink,
}

impl Materializer {
    pub fn new(
        statements: Arc<dyn StatementStore>,
        engine: Arc<dyn QueryEngine>,
        provenance: ProvenanceLog,
        failure_sink: FailureSink,
    ) -> Self {
        Self {
            statements,
            engine,
            provenance,
            failure_sink,
        }
    }

    /// Materialize one window, judged against `now` for completeness.
    #[instrument(skip(self), name = "materializer::run", fields(window = %window))]
    pub async fn materialize(
        &self,
        window: FetchWindow,
        now: DateTime<Utc>,
    ) -> Result<MaterializeReport, MaterializeError> {
        if !window.is_complete(now) {
            let err = MaterializeError::WindowNotReady {
                window: window.to_string(),
                closes_at: window.end().to_rfc3339(),
            };
            self.report_failure("window_not_ready", &err, &window);
            return Err(err);
        }

        let statement = match self.statements.statement_for(&window) {
            Ok(statement) => statement,
            Err(e) => {
                let err = MaterializeError::from(e);
                self.report_failure("statement", &err, &window);
                return Err(err);
            }
        };

        info!(statement_bytes = statement.len(), "submitting materialization");
        let execution = match self
            .engine
            .execute(MaterializeRequest {
                window,
                statement: statement.clone(),
            })
            .await
        {
            Ok(execution) => execution,
            Err(e) => {
                let err = MaterializeError::from(e);
                self.report_failure("engine", &err, &window);
                return Err(err);
            }
        };

        let record = ProvenanceRecord::new(
            execution.query_id.clone(),
            &window,
            execution.rows_inserted,
            statement,
        );
        if let Err(e) = self.provenance.append(&record) {
            // The insert itself succeeded; a re-run will be a no-op and will
            // get its provenance line then.  The failure event carries the
            // query id the log entry would have held.
            let err = MaterializeError::Provenance(format!("{e:#}"));
            self.failure_sink.record(
                FailureEvent::new(Component::Materializer, "provenance", err.to_string())
                    .with_window(window.to_string())
                    .with_query_id(execution.query_id.clone()),
            );
            return Err(err);
        }

        if execution.rows_inserted == 0 {
            info!(query_id = %execution.query_id, "window already materialized or empty");
        } else {
            info!(
                query_id = %execution.query_id,
                rows_inserted = execution.rows_inserted,
                "window materialized"
            );
        }

        Ok(MaterializeReport {
            window,
            query_id: execution.query_id,
            rows_inserted: execution.rows_inserted,
        })
    }

    fn report_failure(&self, kind: &str, err: &MaterializeError, window: &FetchWindow) {
        self.failure_sink.record(
            FailureEvent::new(Component::Materializer, kind, err.to_string())
                .with_window(window.to_string()),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{FsPartitionStore, PartitionStore};
    use crate::config::LakeConfig;
    use crate::lake::engine::QueryExecution;
    use crate::lake::local::LocalQueryEngine;
    use crate::lake::statement::TemplateStore;
    use crate::snapshot::normalizer::NormalizedBatch;
    use crate::snapshot::record::NormalizedRecord;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    // 2025-09-08T02:00:00Z
    const WINDOW_START_EPOCH: i64 = 1_757_296_800;

    fn window() -> FetchWindow {
        FetchWindow::parse("2025-09-08T02").unwrap()
    }

    fn after_window() -> DateTime<Utc> {
        window().end() + chrono::Duration::seconds(90)
    }

    fn record(asset_id: &str, market_cap: serde_json::Value) -> NormalizedRecord {
        let w = window();
        NormalizedRecord {
            asset_id: asset_id.to_string(),
            symbol: asset_id.to_string(),
            name: asset_id.to_string(),
            price: 100.0,
            market_cap,
            market_cap_rank: json!(1),
            volume_24h: json!(1000),
            pct_change_1h: json!(0.1),
            pct_change_24h: json!(0.2),
            pct_change_7d: json!(0.3),
            observed_at: WINDOW_START_EPOCH,
            year: w.year(),
            month: w.month(),
            day: w.day(),
            hour: w.hour(),
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<FsPartitionStore>,
        sink: FailureSink,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(FsPartitionStore::new(dir.path().join("normalized"), 3));
            let sink = FailureSink::spawn(dir.path().join("failures.jsonl"), 16);
            Self { dir, store, sink }
        }

        fn materializer(&self) -> Materializer {
            let statements = Arc::new(
                TemplateStore::from_config(&LakeConfig {
                    normalized_table: "market_snapshots_normalized".to_string(),
                    analytical_table: "market_snapshots".to_string(),
                    statement_template_path: None,
                })
                .unwrap(),
            );
            let engine = Arc::new(LocalQueryEngine::new(
                self.store.clone(),
                self.dir.path().join("analytical"),
                Duration::from_secs(900),
            ));
            Materializer::new(
                statements,
                engine,
                ProvenanceLog::new(self.dir.path().join("provenance.jsonl")),
                self.sink.clone(),
            )
        }

        fn provenance(&self) -> ProvenanceLog {
            ProvenanceLog::new(self.dir.path().join("provenance.jsonl"))
        }

        fn store_batch(&self, records: Vec<NormalizedRecord>) {
            let w = window();
            self.store
                .write_batch(&NormalizedBatch {
                    window: w,
                    fetched_at: w.start(),
                    records,
                    skipped: 0,
                })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn completed_window_materializes_and_rerun_inserts_nothing() {
        let fx = Fixture::new();
        fx.store_batch(vec![
            record("bitcoin", json!(1_280_000_000_000i64)),
            record("ethereum", json!("N/A")),
        ]);
        let materializer = fx.materializer();

        let first = materializer.materialize(window(), after_window()).await.unwrap();
        assert_eq!(first.rows_inserted, 2);

        let second = materializer.materialize(window(), after_window()).await.unwrap();
        assert_eq!(second.rows_inserted, 0);
        assert_ne!(first.query_id, second.query_id);

        // Both runs are on the audit trail, the rendered statement included.
        let records = fx.provenance().for_window(&window()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rows_inserted, 2);
        assert_eq!(records[1].rows_inserted, 0);
        assert!(records[0].statement.contains("INSERT INTO market_snapshots"));
        assert!(records[0].statement.contains("'09'"));
    }

    #[tokio::test]
    async fn incomplete_window_is_refused_before_any_work() {
        let fx = Fixture::new();
        let materializer = fx.materializer();

        // "now" is inside the window: even its last second is still open.
        let now = window().end() - chrono::Duration::seconds(1);
        let err = materializer.materialize(window(), now).await.unwrap_err();
        assert!(matches!(err, MaterializeError::WindowNotReady { .. }), "{err}");

        assert!(fx.provenance().tail(10).unwrap().is_empty());
        let recent = fx.sink.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "window_not_ready");
        assert_eq!(recent[0].window.as_deref(), Some("2025-09-08T02"));
    }

    #[tokio::test]
    async fn boundary_instant_still_counts_as_open() {
        let fx = Fixture::new();
        let materializer = fx.materializer();

        // now == end: the closing instant itself has not elapsed.
        let err = materializer
            .materialize(window(), window().end())
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::WindowNotReady { .. }));
    }

    struct ExplodingEngine;

    #[async_trait]
    impl QueryEngine for ExplodingEngine {
        async fn execute(
            &self,
            _request: MaterializeRequest,
        ) -> Result<QueryExecution, EngineError> {
            Err(EngineError::Scan("decode blew up".to_string()))
        }
    }

    #[tokio::test]
    async fn provenance_failure_still_carries_the_query_id() {
        let fx = Fixture::new();
        fx.store_batch(vec![record("bitcoin", json!(1))]);

        // A plain file where the log's parent directory should be makes every
        // append fail after the insert has gone through.
        std::fs::write(fx.dir.path().join("blocked"), "").unwrap();
        let statements = Arc::new(
            TemplateStore::from_config(&LakeConfig {
                normalized_table: "n".to_string(),
                analytical_table: "a".to_string(),
                statement_template_path: None,
            })
            .unwrap(),
        );
        let engine = Arc::new(LocalQueryEngine::new(
            fx.store.clone(),
            fx.dir.path().join("analytical"),
            Duration::from_secs(900),
        ));
        let materializer = Materializer::new(
            statements,
            engine.clone(),
            ProvenanceLog::new(fx.dir.path().join("blocked").join("provenance.jsonl")),
            fx.sink.clone(),
        );

        let err = materializer
            .materialize(window(), after_window())
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::Provenance(_)), "{err}");

        // The row landed even though the audit line did not.
        assert_eq!(engine.window_row_count(&window()).await.unwrap(), 1);

        let recent = fx.sink.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "provenance");
        assert_eq!(recent[0].window.as_deref(), Some("2025-09-08T02"));
        assert!(recent[0].query_id.is_some());
    }

    #[tokio::test]
    async fn engine_failure_is_reported_and_leaves_no_provenance() {
        let fx = Fixture::new();
        let statements = Arc::new(
            TemplateStore::from_config(&LakeConfig {
                normalized_table: "n".to_string(),
                analytical_table: "a".to_string(),
                statement_template_path: None,
            })
            .unwrap(),
        );
        let materializer = Materializer::new(
            statements,
            Arc::new(ExplodingEngine),
            fx.provenance(),
            fx.sink.clone(),
        );

        let err = materializer
            .materialize(window(), after_window())
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::Engine(_)), "{err}");

        assert!(fx.provenance().tail(10).unwrap().is_empty());
        let recent = fx.sink.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, "engine");
    }
}
