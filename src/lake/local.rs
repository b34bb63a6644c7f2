// =============================================================================
// Local Query Engine — Native execution of the materialization contract
// =============================================================================
//
// Executes one window materialization directly against the filesystem lake:
//
//   1. take the window's lock (a create_new marker file in the analytical
//      partition; a concurrent run fails fast, an abandoned lock older than
//      the stale threshold is broken),
//   2. fold every normalized file of the window into a latest-wins map keyed
//      by natural key (files are visited in sorted order, so the newest file
//      overrides earlier duplicates),
//   3. read the natural keys already present in the analytical partition and
//      anti-join the map against them,
//   4. cast the surviving rows and publish them as one new parquet file via
//      tmp + rename.
//
// A re-run therefore inserts nothing and writes no file, and two runs can
// never double-insert the same observation.  The rendered statement in the
// request is the contract being executed; the engine logs its size and leaves
// recording it to the provenance log.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arrow::array::{Array, ArrayRef, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures_util::StreamExt;
use parquet::arrow::{ArrowWriter, ParquetRecordBatchStreamBuilder};
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::archive::PartitionStore;
use crate::lake::cast::{now_epoch, to_materialized};
use crate::lake::engine::{EngineError, MaterializeRequest, QueryEngine, QueryExecution};
use crate::snapshot::record::{MaterializedRecord, NormalizedRecord};
use crate::types::{FetchWindow, NaturalKey};

const LOCK_FILE: &str = ".materialize.lock";
const READ_BATCH_SIZE: usize = 8192;

pub struct LocalQueryEngine {
    partition_store: Arc<dyn PartitionStore>,
    analytical_root: PathBuf,
    lock_stale: Duration,
}

impl LocalQueryEngine {
    pub fn new(
        partition_store: Arc<dyn PartitionStore>,
        analytical_root: PathBuf,
        lock_stale: Duration,
    ) -> Self {
        Self {
            partition_store,
            analytical_root,
            lock_stale,
        }
    }

    fn window_dir(&self, window: &FetchWindow) -> PathBuf {
        self.analytical_root.join(window.partition_path())
    }

    /// Rows currently present in a window's analytical partition.  Counted
    /// from parquet footers, no row data is read.
    #[cfg(test)]
    pub async fn window_row_count(&self, window: &FetchWindow) -> Result<u64> {
        let mut total = 0u64;
        for path in parquet_files(&self.window_dir(window))? {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let builder = ParquetRecordBatchStreamBuilder::new(file)
                .await
                .with_context(|| format!("failed to read parquet metadata from {}", path.display()))?;
            total += builder.metadata().file_metadata().num_rows() as u64;
        }
        Ok(total)
    }

    // -------------------------------------------------------------------------
    // Anti-join inputs
    // -------------------------------------------------------------------------

    /// Latest-wins view of the window's normalized records, keyed by natural
    /// key.  Files are read in sorted path order; file ids embed the fetch
    /// instant, so a later ingest of the same observation overrides.
    fn scan_normalized(&self, window: &FetchWindow) -> Result<HashMap<NaturalKey, NormalizedRecord>> {
        let mut latest = HashMap::new();
        for path in self.partition_store.list_files(window)? {
            for record in self.partition_store.read_file(&path)? {
                latest.insert(record.natural_key(), record);
            }
        }
        Ok(latest)
    }

    async fn existing_keys(&self, dir: &Path) -> Result<HashSet<NaturalKey>> {
        let mut keys = HashSet::new();
        for path in parquet_files(dir)? {
            read_keys_from(&path, &mut keys).await?;
        }
        Ok(keys)
    }
}

#[async_trait]
impl QueryEngine for LocalQueryEngine {
    #[instrument(skip(self, request), name = "lake::execute", fields(window = %request.window))]
    async fn execute(&self, request: MaterializeRequest) -> Result<QueryExecution, EngineError> {
        let window = request.window;
        let dir = self.window_dir(&window);
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Write(format!("failed to create {}: {e}", dir.display())))?;
        let _lock = WindowLock::acquire(&dir, self.lock_stale)?;

        debug!(
            statement_bytes = request.statement.len(),
            "executing statement natively"
        );

        let latest = self
            .scan_normalized(&window)
            .map_err(|e| EngineError::Scan(format!("{e:#}")))?;
        let existing = self
            .existing_keys(&dir)
            .await
            .map_err(|e| EngineError::Scan(format!("{e:#}")))?;

        let mut delta: Vec<NormalizedRecord> = latest
            .into_iter()
            .filter(|(key, _)| !existing.contains(key))
            .map(|(_, record)| record)
            .collect();
        delta.sort_by(|a, b| {
            (a.asset_id.as_str(), a.observed_at).cmp(&(b.asset_id.as_str(), b.observed_at))
        });

        let query_id = Uuid::new_v4().to_string();
        if delta.is_empty() {
            info!(%query_id, "window already materialized or empty, nothing to insert");
            return Ok(QueryExecution {
                query_id,
                rows_inserted: 0,
            });
        }

        let inserted_at = now_epoch();
        let rows: Vec<MaterializedRecord> = delta
            .iter()
            .map(|r| to_materialized(r, &window, inserted_at))
            .collect();

        let path =
            write_delta(&dir, &rows).map_err(|e| EngineError::Write(format!("{e:#}")))?;
        info!(
            %query_id,
            rows = rows.len(),
            file = %path.display(),
            "window delta materialized"
        );

        Ok(QueryExecution {
            query_id,
            rows_inserted: rows.len() as u64,
        })
    }
}

// -----------------------------------------------------------------------------
// Window lock
// -----------------------------------------------------------------------------

/// Marker-file lock scoped to one analytical partition.  Released on drop;
/// an unreleased lock from a dead run is broken once it ages past the stale
/// threshold.
struct WindowLock {
    path: PathBuf,
}

impl WindowLock {
    fn acquire(dir: &Path, stale_after: Duration) -> Result<Self, EngineError> {
        let path = dir.join(LOCK_FILE);
        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok());
                match age {
                    Some(age) if age >= stale_after => {
                        warn!(
                            lock = %path.display(),
                            age_secs = age.as_secs(),
                            "breaking stale materialization lock"
                        );
                        let _ = std::fs::remove_file(&path);
                        Self::try_create(&path)
                            .map_err(|e| EngineError::WindowLocked(e.to_string()))
                    }
                    _ => Err(EngineError::WindowLocked(format!(
                        "lock file {} is held",
                        path.display()
                    ))),
                }
            }
            Err(e) => Err(EngineError::Write(format!(
                "failed to create lock file {}: {e}",
                path.display()
            ))),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let _ = write!(file, "{}", std::process::id());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WindowLock {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), %error, "failed to remove window lock");
        }
    }
}

// -----------------------------------------------------------------------------
// Parquet I/O
// -----------------------------------------------------------------------------

fn analytical_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("asset_id", DataType::Utf8, false),
        Field::new("symbol", DataType::Utf8, true),
        Field::new("name", DataType::Utf8, true),
        Field::new("price", DataType::Float64, false),
        Field::new("market_cap", DataType::Int64, true),
        Field::new("market_cap_rank", DataType::Int64, true),
        Field::new("volume_24h", DataType::Int64, true),
        Field::new("pct_change_1h", DataType::Float64, true),
        Field::new("pct_change_24h", DataType::Float64, true),
        Field::new("pct_change_7d", DataType::Float64, true),
        Field::new("observed_at", DataType::Int64, false),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("hour", DataType::Int32, false),
        Field::new("inserted_at", DataType::Int64, false),
        Field::new("source_fetch_window", DataType::Utf8, false),
    ]))
}

fn rows_to_batch(rows: &[MaterializedRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.asset_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.symbol.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.name.as_str()),
        )),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.price))),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.market_cap).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.market_cap_rank).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.volume_24h).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.pct_change_1h).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.pct_change_24h).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.pct_change_7d).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from_iter_values(
            rows.iter().map(|r| r.observed_at),
        )),
        Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.year))),
        Arc::new(Int32Array::from_iter_values(
            rows.iter().map(|r| r.month as i32),
        )),
        Arc::new(Int32Array::from_iter_values(
            rows.iter().map(|r| r.day as i32),
        )),
        Arc::new(Int32Array::from_iter_values(
            rows.iter().map(|r| r.hour as i32),
        )),
        Arc::new(Int64Array::from_iter_values(
            rows.iter().map(|r| r.inserted_at),
        )),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.source_fetch_window.as_str()),
        )),
    ];
    RecordBatch::try_new(analytical_schema(), columns)
        .context("failed to build analytical record batch")
}

/// Publish `rows` as one new parquet file in `dir` via tmp + rename.
fn write_delta(dir: &Path, rows: &[MaterializedRecord]) -> Result<PathBuf> {
    let batch = rows_to_batch(rows)?;
    let file_name = format!("part-{}.parquet", Uuid::new_v4().simple());
    let final_path = dir.join(&file_name);
    let tmp_path = dir.join(format!("{file_name}.tmp"));

    let file = std::fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .context("failed to open parquet writer")?;
    writer.write(&batch).context("failed to write analytical batch")?;
    writer.close().context("failed to finalize parquet file")?;

    std::fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("failed to publish {}", final_path.display()))?;
    Ok(final_path)
}

/// Parquet files of one partition directory, sorted by path.  A partition
/// that was never written lists as empty.
fn parquet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to list {}", dir.display()));
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list {}", dir.display()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn read_keys_from(path: &Path, keys: &mut HashSet<NaturalKey>) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let builder = ParquetRecordBatchStreamBuilder::new(file)
        .await
        .with_context(|| format!("failed to read parquet metadata from {}", path.display()))?
        .with_batch_size(READ_BATCH_SIZE);
    let schema = builder.schema().clone();
    let asset_col = column_index(&schema, "asset_id")?;
    let observed_col = column_index(&schema, "observed_at")?;

    let mut stream = Box::pin(
        builder
            .build()
            .with_context(|| format!("failed to build parquet stream for {}", path.display()))?,
    );
    while let Some(batch) = stream.next().await {
        let batch =
            batch.with_context(|| format!("failed to decode a batch from {}", path.display()))?;
        let assets = as_array::<StringArray>(&batch, asset_col)?;
        let observed = as_array::<Int64Array>(&batch, observed_col)?;
        for row in 0..batch.num_rows() {
            keys.insert((assets.value(row).to_string(), observed.value(row)));
        }
    }
    Ok(())
}

fn column_index(schema: &SchemaRef, name: &str) -> Result<usize> {
    schema
        .column_with_name(name)
        .map(|(idx, _)| idx)
        .ok_or_else(|| anyhow!("analytical file is missing the {name} column"))
}

fn as_array<T: Array + 'static>(batch: &RecordBatch, column: usize) -> Result<&T> {
    batch
        .column(column)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("unexpected column type at index {column}"))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::FsPartitionStore;
    use crate::snapshot::normalizer::NormalizedBatch;
    use serde_json::{json, Value};

    // 2025-09-08T02:00:00Z
    const WINDOW_START_EPOCH: i64 = 1_757_296_800;

    fn window() -> FetchWindow {
        FetchWindow::parse("2025-09-08T02").unwrap()
    }

    fn record(asset_id: &str, observed_at: i64, price: f64, market_cap: Value) -> NormalizedRecord {
        let w = window();
        NormalizedRecord {
            asset_id: asset_id.to_string(),
            symbol: asset_id.to_string(),
            name: asset_id.to_string(),
            price,
            market_cap,
            market_cap_rank: json!(1),
            volume_24h: json!(1000),
            pct_change_1h: json!(0.1),
            pct_change_24h: json!(0.2),
            pct_change_7d: json!(0.3),
            observed_at,
            year: w.year(),
            month: w.month(),
            day: w.day(),
            hour: w.hour(),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<FsPartitionStore>,
        engine: LocalQueryEngine,
        analytical_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsPartitionStore::new(dir.path().join("normalized"), 3));
        let analytical_root = dir.path().join("analytical");
        let engine = LocalQueryEngine::new(
            store.clone(),
            analytical_root.clone(),
            Duration::from_secs(900),
        );
        Fixture {
            _dir: dir,
            store,
            engine,
            analytical_root,
        }
    }

    /// Write one normalized file; `offset_secs` orders files within the hour.
    fn store_records(fx: &Fixture, offset_secs: i64, records: Vec<NormalizedRecord>) {
        let w = window();
        let batch = NormalizedBatch {
            window: w,
            fetched_at: w.start() + chrono::Duration::seconds(offset_secs),
            records,
            skipped: 0,
        };
        fx.store.write_batch(&batch).unwrap();
    }

    fn request() -> MaterializeRequest {
        MaterializeRequest {
            window: window(),
            statement: "INSERT INTO market_snapshots SELECT 1".to_string(),
        }
    }

    async fn read_back(dir: &Path) -> Vec<(String, f64, Option<i64>)> {
        let mut rows = Vec::new();
        for path in parquet_files(dir).unwrap() {
            let file = tokio::fs::File::open(&path).await.unwrap();
            let builder = ParquetRecordBatchStreamBuilder::new(file).await.unwrap();
            let schema = builder.schema().clone();
            let asset_col = column_index(&schema, "asset_id").unwrap();
            let price_col = column_index(&schema, "price").unwrap();
            let cap_col = column_index(&schema, "market_cap").unwrap();
            let mut stream = Box::pin(builder.build().unwrap());
            while let Some(batch) = stream.next().await {
                let batch = batch.unwrap();
                let assets = as_array::<StringArray>(&batch, asset_col).unwrap();
                let prices = as_array::<Float64Array>(&batch, price_col).unwrap();
                let caps = as_array::<Int64Array>(&batch, cap_col).unwrap();
                for row in 0..batch.num_rows() {
                    let cap = (!caps.is_null(row)).then(|| caps.value(row));
                    rows.push((assets.value(row).to_string(), prices.value(row), cap));
                }
            }
        }
        rows
    }

    #[tokio::test]
    async fn first_run_inserts_then_rerun_is_a_noop() {
        let fx = fixture();
        store_records(
            &fx,
            0,
            vec![
                record("bitcoin", WINDOW_START_EPOCH, 65000.0, json!(1_280_000_000_000i64)),
                record("ethereum", WINDOW_START_EPOCH, 3100.0, json!(372_000_000_000i64)),
                record("solana", WINDOW_START_EPOCH, 150.0, json!(68_000_000_000i64)),
            ],
        );

        let first = fx.engine.execute(request()).await.unwrap();
        assert_eq!(first.rows_inserted, 3);

        let second = fx.engine.execute(request()).await.unwrap();
        assert_eq!(second.rows_inserted, 0);
        assert_ne!(first.query_id, second.query_id);

        assert_eq!(fx.engine.window_row_count(&window()).await.unwrap(), 3);

        let dir = fx.analytical_root.join(window().partition_path());
        assert!(!dir.join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn later_files_override_earlier_duplicates() {
        let fx = fixture();
        store_records(
            &fx,
            0,
            vec![record("bitcoin", WINDOW_START_EPOCH, 100.0, json!(1))],
        );
        store_records(
            &fx,
            60,
            vec![record("bitcoin", WINDOW_START_EPOCH, 200.0, json!(2))],
        );

        let execution = fx.engine.execute(request()).await.unwrap();
        assert_eq!(execution.rows_inserted, 1);

        let dir = fx.analytical_root.join(window().partition_path());
        let rows = read_back(&dir).await;
        assert_eq!(rows, vec![("bitcoin".to_string(), 200.0, Some(2))]);
    }

    #[tokio::test]
    async fn unconvertible_market_cap_lands_as_null() {
        let fx = fixture();
        store_records(
            &fx,
            0,
            vec![record("bitcoin", WINDOW_START_EPOCH, 65000.0, json!("N/A"))],
        );

        let execution = fx.engine.execute(request()).await.unwrap();
        assert_eq!(execution.rows_inserted, 1);

        let dir = fx.analytical_root.join(window().partition_path());
        let rows = read_back(&dir).await;
        assert_eq!(rows, vec![("bitcoin".to_string(), 65000.0, None)]);
    }

    #[tokio::test]
    async fn new_snapshot_file_adds_only_missing_rows() {
        let fx = fixture();
        store_records(
            &fx,
            0,
            vec![
                record("bitcoin", WINDOW_START_EPOCH, 65000.0, json!(1)),
                record("ethereum", WINDOW_START_EPOCH, 3100.0, json!(2)),
            ],
        );
        assert_eq!(fx.engine.execute(request()).await.unwrap().rows_inserted, 2);

        // A later ingest re-observes bitcoin and adds solana.
        store_records(
            &fx,
            60,
            vec![
                record("bitcoin", WINDOW_START_EPOCH, 64000.0, json!(1)),
                record("solana", WINDOW_START_EPOCH + 60, 150.0, json!(3)),
            ],
        );
        assert_eq!(fx.engine.execute(request()).await.unwrap().rows_inserted, 1);
        assert_eq!(fx.engine.window_row_count(&window()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_window_executes_as_zero_rows() {
        let fx = fixture();
        let execution = fx.engine.execute(request()).await.unwrap();
        assert_eq!(execution.rows_inserted, 0);

        let dir = fx.analytical_root.join(window().partition_path());
        assert!(parquet_files(&dir).unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_lock_fails_fast() {
        let fx = fixture();
        let dir = fx.analytical_root.join(window().partition_path());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOCK_FILE), "99999").unwrap();

        let err = fx.engine.execute(request()).await.unwrap_err();
        assert!(matches!(err, EngineError::WindowLocked(_)), "{err}");
    }

    #[tokio::test]
    async fn stale_lock_is_broken_and_the_run_proceeds() {
        let fx = fixture();
        let dir = fx.analytical_root.join(window().partition_path());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOCK_FILE), "99999").unwrap();
        store_records(
            &fx,
            0,
            vec![record("bitcoin", WINDOW_START_EPOCH, 65000.0, json!(1))],
        );

        let engine = LocalQueryEngine::new(
            fx.store.clone(),
            fx.analytical_root.clone(),
            Duration::ZERO,
        );
        let execution = engine.execute(request()).await.unwrap();
        assert_eq!(execution.rows_inserted, 1);
        assert!(!dir.join(LOCK_FILE).exists());
    }
}
