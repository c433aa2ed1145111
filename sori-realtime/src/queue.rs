//! FIFO serialization of session-mutating operations.
//!
//! `start_session` / `stop_session` / `change_scenario` are never run
//! directly; they are enqueued here and executed strictly one at a time.
//! This removes the need for ad-hoc reentrancy flags in the orchestrator:
//! three concurrent start calls produce exactly one executed start and
//! two well-defined rejections.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, VoiceError};

/// The kinds of operation the queue serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    StartSession,
    StopSession,
    ChangeScenario,
}

type OpFuture = Pin<Box<dyn Future<Output = Result<bool>> + Send>>;
type OpFn = Box<dyn FnOnce() -> OpFuture + Send>;

struct Entry {
    kind: OperationKind,
    op: OpFn,
    tx: oneshot::Sender<Result<bool>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueInner {
    queue: Mutex<VecDeque<Entry>>,
    is_processing: AtomicBool,
    pending_starts: AtomicUsize,
    pending_stops: AtomicUsize,
    closed: AtomicBool,
}

/// Single-consumer FIFO operation queue. Cheap to clone; clones share
/// the queue.
#[derive(Clone, Default)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an operation and wait for its result.
    ///
    /// Duplicate policy: a `StartSession` enqueued while another start is
    /// pending or executing is rejected; a `StopSession` enqueued while
    /// another stop is pending is resolved as success without running.
    pub async fn run<F, Fut>(&self, kind: OperationKind, op: F) -> Result<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(VoiceError::SessionStart("session manager destroyed".to_string()));
        }

        match kind {
            OperationKind::StartSession => {
                if self.inner.pending_starts.fetch_add(1, Ordering::AcqRel) > 0 {
                    self.inner.pending_starts.fetch_sub(1, Ordering::AcqRel);
                    return Err(VoiceError::SessionStart(
                        "a session start is already in progress".to_string(),
                    ));
                }
            }
            OperationKind::StopSession => {
                if self.inner.pending_stops.fetch_add(1, Ordering::AcqRel) > 0 {
                    self.inner.pending_stops.fetch_sub(1, Ordering::AcqRel);
                    return Ok(true);
                }
            }
            OperationKind::ChangeScenario => {}
        }

        let (tx, rx) = oneshot::channel();
        let entry = Entry {
            kind,
            op: Box::new(move || Box::pin(op()) as OpFuture),
            tx,
            enqueued_at: Instant::now(),
        };
        self.inner.queue.lock().push_back(entry);
        self.ensure_processing();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(VoiceError::SessionStop("operation dropped during shutdown".to_string())),
        }
    }

    /// Start the processing loop unless one is already running.
    fn ensure_processing(&self) {
        if self.inner.is_processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let entry = inner.queue.lock().pop_front();
                match entry {
                    Some(entry) => {
                        let waited = entry.enqueued_at.elapsed();
                        tracing::debug!(kind = ?entry.kind, waited_ms = waited.as_millis() as u64,
                            "processing queued operation");
                        let result = (entry.op)().await;
                        Self::settle(&inner, entry.kind);
                        let _ = entry.tx.send(result);
                    }
                    None => {
                        inner.is_processing.store(false, Ordering::Release);
                        // An enqueue may have raced the flag clear; claim
                        // the loop back if so.
                        if inner.queue.lock().is_empty()
                            || inner.is_processing.swap(true, Ordering::AcqRel)
                        {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn settle(inner: &QueueInner, kind: OperationKind) {
        match kind {
            OperationKind::StartSession => {
                inner.pending_starts.fetch_sub(1, Ordering::AcqRel);
            }
            OperationKind::StopSession => {
                inner.pending_stops.fetch_sub(1, Ordering::AcqRel);
            }
            OperationKind::ChangeScenario => {}
        }
    }

    /// Drop every queued operation and refuse new ones. Waiting callers
    /// receive a shutdown error.
    pub fn clear(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Entry> = self.inner.queue.lock().drain(..).collect();
        for entry in drained {
            Self::settle(&self.inner, entry.kind);
            drop(entry.tx);
        }
    }

    /// Accept operations again after [`Self::clear`].
    pub fn reopen(&self) {
        self.inner.closed.store(false, Ordering::Release);
    }

    /// Number of queued (not yet executing) operations.
    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }
}
