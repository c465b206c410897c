//! Threshold-triggered batching between the sweeps and the sink.
//!
//! Producers push actions into a bounded channel; a single worker task owns
//! the pending batch, so snapshot-and-clear needs no lock and sink writes
//! never overlap.
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::SyncError;
use crate::model::Action;
use crate::sink::ActionSink;

/// Actions accumulated since the last flush.
#[derive(Debug)]
pub struct PendingBatch {
    actions: Vec<Action>,
    threshold: usize,
}

impl PendingBatch {
    pub fn new(threshold: usize) -> Self {
        Self {
            actions: Vec::new(),
            threshold,
        }
    }

    /// Appends and, once the batch holds more than `threshold` actions,
    /// hands back everything accumulated and leaves the batch empty.
    pub fn push(&mut self, action: Action) -> Option<Vec<Action>> {
        self.actions.push(action);
        if self.actions.len() > self.threshold {
            Some(std::mem::take(&mut self.actions))
        } else {
            None
        }
    }

    pub fn take_remaining(&mut self) -> Option<Vec<Action>> {
        if self.actions.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.actions))
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub received: usize,
    pub flushes: usize,
    pub flushed: usize,
    pub dropped: usize,
}

pub struct ActionQueue {
    tx: mpsc::Sender<Action>,
    worker: JoinHandle<QueueStats>,
}

impl ActionQueue {
    pub fn spawn(sink: Arc<dyn ActionSink>, threshold: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(rx, sink, PendingBatch::new(threshold)));
        Self { tx, worker }
    }

    /// Waits only while the channel is full.
    pub async fn push(&self, action: Action) -> Result<(), SyncError> {
        self.tx.send(action).await.map_err(|_| SyncError::QueueClosed)
    }

    /// Closes the queue, waits for every pushed action to be processed and
    /// flushes whatever is still pending.
    pub async fn drain(self) -> Result<QueueStats, SyncError> {
        let Self { tx, worker } = self;
        drop(tx);
        worker.await.map_err(|err| {
            error!(?err, "action queue worker failed");
            SyncError::QueueClosed
        })
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Action>,
    sink: Arc<dyn ActionSink>,
    mut pending: PendingBatch,
) -> QueueStats {
    let mut stats = QueueStats::default();
    while let Some(action) = rx.recv().await {
        stats.received += 1;
        if let Some(snapshot) = pending.push(action) {
            info!(count = snapshot.len(), "flush threshold exceeded");
            flush(sink.as_ref(), snapshot, &mut stats).await;
        }
    }
    if let Some(rest) = pending.take_remaining() {
        info!(count = rest.len(), "draining remaining actions");
        flush(sink.as_ref(), rest, &mut stats).await;
    }
    stats
}

async fn flush(sink: &dyn ActionSink, batch: Vec<Action>, stats: &mut QueueStats) {
    let count = batch.len();
    match sink.insert_many(&batch).await {
        Ok(()) => {
            stats.flushes += 1;
            stats.flushed += count;
        }
        Err(source) => {
            // Not retried: the batch is lost.
            let err = SyncError::SinkWriteFailure { count, source };
            error!(error = ?err, "dropping action batch");
            stats.dropped += count;
        }
    }
}
