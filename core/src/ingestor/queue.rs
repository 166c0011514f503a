use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_channel::{Receiver, Sender};

use crate::chunk::Chunk;
use crate::errors::{ChunkError, IngestionError, LifecycleError};

/// The input and retry queues shared by producers and writers.
///
/// `in_flight` counts chunks admitted through the input queue that may
/// still enter the retry queue. The retry queue closes once the input queue
/// is closed and that count reaches zero, so writers drain every retry
/// before they see both queues closed.
pub(crate) struct Queues {
    input_tx: Sender<Chunk>,
    input_rx: Receiver<Chunk>,
    retry_tx: Sender<Chunk>,
    retry_rx: Receiver<Chunk>,
    in_flight: AtomicU64,
}

impl Queues {
    pub(crate) fn new(input_capacity: usize, retry_capacity: usize) -> Self {
        let (input_tx, input_rx) = async_channel::bounded(input_capacity.max(1));
        let (retry_tx, retry_rx) = async_channel::bounded(retry_capacity.max(1));
        Self {
            input_tx,
            input_rx,
            retry_tx,
            retry_rx,
            in_flight: AtomicU64::new(0),
        }
    }

    pub(crate) fn input(&self) -> &Receiver<Chunk> {
        &self.input_rx
    }

    pub(crate) fn retry(&self) -> &Receiver<Chunk> {
        &self.retry_rx
    }

    /// Admits a chunk, suspending while the input queue is full.
    pub(crate) async fn push(&self, chunk: Chunk) -> Result<(), Chunk> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.input_tx.send(chunk).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.settle();
                Err(err.into_inner())
            }
        }
    }

    pub(crate) async fn requeue(&self, chunk: Chunk) -> Result<(), Chunk> {
        self.retry_tx.send(chunk).await.map_err(|err| err.into_inner())
    }

    /// Marks one admitted chunk as no longer able to enter the retry queue.
    pub(crate) fn settle(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.close_retry_if_drained();
        }
    }

    pub(crate) fn close_input(&self) {
        self.input_tx.close();
        self.close_retry_if_drained();
    }

    pub(crate) fn close_all(&self) {
        self.input_tx.close();
        self.retry_tx.close();
    }

    fn close_retry_if_drained(&self) {
        if self.input_tx.is_closed() && self.in_flight.load(Ordering::SeqCst) == 0 {
            self.retry_tx.close();
        }
    }

    /// Takes every chunk still queued; used after the writers are gone.
    pub(crate) fn drain(&self) -> Vec<Chunk> {
        let mut left = Vec::new();
        while let Ok(chunk) = self.retry_rx.try_recv() {
            left.push(chunk);
        }
        while let Ok(chunk) = self.input_rx.try_recv() {
            left.push(chunk);
        }
        for _ in &left {
            self.settle();
        }
        left
    }

    pub(crate) fn queued(&self) -> usize {
        self.input_rx.len()
    }

    pub(crate) fn retrying(&self) -> usize {
        self.retry_rx.len()
    }

    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Runs a chunk's callback with an abort outcome on the caller's task.
pub(crate) fn abandon(chunk: Chunk, reason: &str) {
    let pending = chunk.into_pending();
    if let Some(run) = pending.resolve(Err(ChunkError::Aborted {
        reason: reason.to_string(),
    })) {
        run();
    }
}

/// A cloneable producer handle onto an ingest's input queue.
#[derive(Clone)]
pub struct ChunkStream {
    queues: Arc<Queues>,
}

impl ChunkStream {
    pub(crate) fn new(queues: Arc<Queues>) -> Self {
        Self { queues }
    }

    /// Enqueues a chunk, suspending while the queue is full.
    ///
    /// Once the ingest is stopped the chunk's callback receives an abort and
    /// the call fails.
    pub async fn send(&self, chunk: Chunk) -> Result<(), IngestionError> {
        match self.queues.push(chunk).await {
            Ok(()) => Ok(()),
            Err(chunk) => {
                abandon(chunk, "ingest stopped");
                Err(LifecycleError::Stopped.into())
            }
        }
    }

    /// Chunks waiting in the input queue.
    pub fn len(&self) -> usize {
        self.queues.queued()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.queues.input_tx.is_closed()
    }
}
