// =============================================================================
// Failure Sink — Fire-and-forget failure recording
// =============================================================================
//
// Pipeline failures are operationally interesting but must never make a run
// worse: `record()` is synchronous, never blocks, and never returns an error.
// Events flow over a bounded channel to a writer task that appends them as
// JSON lines; if the channel is full the event is dropped and counted.
//
// A bounded in-memory ring of recent events is kept on the caller side so
// tests can assert on what was recorded without reading the file back; the
// `status` subcommand reads the file via `read_recent`.
// =============================================================================

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Size of the channel between `record()` and the writer task.
const CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Event
// =============================================================================

/// Pipeline component an event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    Ingestor,
    Materializer,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingestor => write!(f, "ingestor"),
            Self::Materializer => write!(f, "materializer"),
        }
    }
}

/// One recorded failure, with enough context to investigate it later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    /// ISO 8601 timestamp of when the failure was recorded.
    pub occurred_at: String,

    /// Component the failure originated from.
    pub component: Component,

    /// Short machine-friendly label, e.g. "fetch_fatal" or "engine".
    pub kind: String,

    /// Human-readable description.
    pub message: String,

    /// Window identifier, when the failure pertains to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,

    /// Engine execution identifier, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    /// Schema-skip count accompanying the failure, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<usize>,
}

impl FailureEvent {
    pub fn new(
        component: Component,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            occurred_at: Utc::now().to_rfc3339(),
            component,
            kind: kind.into(),
            message: message.into(),
            window: None,
            query_id: None,
            skipped: None,
        }
    }

    pub fn with_window(mut self, window: impl Into<String>) -> Self {
        self.window = Some(window.into());
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = Some(skipped);
        self
    }
}

// =============================================================================
// Sink
// =============================================================================

enum SinkMessage {
    Event(FailureEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the failure recorder.  Cheap to clone; all clones feed the same
/// writer task and the same ring.
#[derive(Clone)]
pub struct FailureSink {
    tx: mpsc::Sender<SinkMessage>,
    recent: Arc<RwLock<VecDeque<FailureEvent>>>,
    ring_capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl FailureSink {
    /// Spawn the writer task appending events to `path` as JSON lines.
    pub fn spawn(path: PathBuf, ring_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            run_writer(path, rx).await;
        });

        Self {
            tx,
            recent: Arc::new(RwLock::new(VecDeque::with_capacity(ring_capacity))),
            ring_capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a failure (non-blocking; a full or closed channel drops the
    /// event and counts the drop).
    pub fn record(&self, event: FailureEvent) {
        {
            let mut ring = self.recent.write();
            ring.push_back(event.clone());
            while ring.len() > self.ring_capacity {
                ring.pop_front();
            }
        }

        if self.tx.try_send(SinkMessage::Event(event)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("failure sink channel unavailable, event dropped");
        }
    }

    /// Most recent events, oldest first.
    #[cfg(test)]
    pub fn recent(&self) -> Vec<FailureEvent> {
        self.recent.read().iter().cloned().collect()
    }

    /// Number of events dropped due to channel pressure or shutdown.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush pending events and stop the writer task.  Any drops that
    /// happened along the way are surfaced here, since the counter is the
    /// only trace they leave.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SinkMessage::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "failure events were dropped under channel pressure");
        }
    }
}

async fn run_writer(path: PathBuf, mut rx: mpsc::Receiver<SinkMessage>) {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(error = %e, dir = %parent.display(), "failed to create failure log dir");
        }
    }

    let mut file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "failed to open failure log");
            None
        }
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMessage::Event(event) => {
                let Some(f) = file.as_mut() else { continue };
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        if let Err(e) = writeln!(f, "{line}") {
                            warn!(error = %e, "failed to append failure event");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialise failure event"),
                }
            }
            SinkMessage::Shutdown(ack) => {
                if let Some(f) = file.as_mut() {
                    let _ = f.flush();
                }
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// The last `n` events of a failure log written by earlier runs, oldest
/// first.  A missing log reads as empty and malformed lines are skipped, in
/// keeping with the sink's never-fail posture.
pub fn read_recent(path: &Path, n: usize) -> Vec<FailureEvent> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };

    let mut events: Vec<FailureEvent> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    if events.len() > n {
        events.drain(..events.len() - n);
    }
    events
}
