use std::sync::{Arc, OnceLock};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, PendingCompletion};
use crate::config::EngineConfig;
use crate::errors::{ChunkError, IngestionError, LifecycleError, Result};
use crate::ingestor::queue::{ChunkStream, Queues, abandon};
use crate::ingestor::statement::StatementCache;
use crate::ingestor::writer::spawn_writer;
use crate::ingestor::Ingest;
use crate::sink::Sink;
use crate::telemetry::{Counters, IngestMetrics};

/// State every writer of one engine shares.
pub(crate) struct Shared<S: Sink> {
    pub(crate) sink: S,
    pub(crate) config: EngineConfig,
    pub(crate) statements: StatementCache,
    pub(crate) counters: Counters,
    pub(crate) cancel: CancellationToken,
    callbacks: TaskTracker,
}

impl<S: Sink> Shared<S> {
    /// Hands a chunk back to its owner without blocking the writer.
    pub(crate) fn complete(
        &self,
        pending: PendingCompletion,
        result: std::result::Result<(), ChunkError>,
    ) {
        if let Some(run) = pending.resolve(result) {
            self.callbacks.spawn_blocking(run);
        }
    }

    /// Stops the line: writers exit after their current chunk and producers
    /// are refused.
    pub(crate) fn abort(&self, queues: &Queues) {
        self.cancel.cancel();
        queues.close_all();
    }
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    workers: Vec<JoinHandle<Result<()>>>,
}

/// Batch ingestion engine.
///
/// A fixed pool of writers turns chunks into multi-row inserts. Each writer
/// owns one transaction at a time and commits it once more than
/// `commit_size` rows have accumulated. Chunks whose insert fails go to a
/// retry queue that every writer drains before taking new input.
pub struct Engine<S: Sink> {
    shared: Arc<Shared<S>>,
    workers: usize,
    queues: OnceLock<Arc<Queues>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<S: Sink> Engine<S> {
    pub fn new(sink: S, config: EngineConfig) -> Self {
        let workers = config.worker_count();
        let statements =
            StatementCache::new(config.table_name.clone(), config.columns, sink.placeholder());
        Self {
            shared: Arc::new(Shared {
                sink,
                config,
                statements,
                counters: Counters::default(),
                cancel: CancellationToken::new(),
                callbacks: TaskTracker::new(),
            }),
            workers,
            queues: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    /// Normalized number of writers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.shared.counters.snapshot()
    }

    /// Distinct statement shapes generated so far.
    pub fn cached_statements(&self) -> usize {
        self.shared.statements.len()
    }
}

impl<S: Sink> Ingest for Engine<S> {
    async fn add_chunk(&self, chunk: Chunk) -> Result<()> {
        match self.queues.get() {
            Some(queues) => ChunkStream::new(Arc::clone(queues)).send(chunk).await,
            None => {
                abandon(chunk, "ingest not started");
                Err(LifecycleError::NotStarted.into())
            }
        }
    }

    fn total_rows(&self) -> u64 {
        self.shared.counters.total_rows()
    }

    fn total_chunks(&self) -> u64 {
        self.shared.counters.total_chunks()
    }

    fn stream(&self) -> Result<ChunkStream> {
        self.queues
            .get()
            .map(|queues| ChunkStream::new(Arc::clone(queues)))
            .ok_or_else(|| LifecycleError::NotStarted.into())
    }

    fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.started {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        self.shared.config.validate()?;

        let queues = Arc::new(Queues::new(self.workers * 10, self.workers * 5));
        if self.queues.set(Arc::clone(&queues)).is_err() {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        lifecycle.started = true;
        lifecycle.workers = (0..self.workers)
            .map(|id| spawn_writer(&runtime, id, Arc::clone(&self.shared), Arc::clone(&queues)))
            .collect();

        info!(
            workers = self.workers,
            table = %self.shared.config.table_name,
            columns = self.shared.config.columns,
            commit_size = self.shared.config.commit_size,
            "ingest engine started"
        );
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.started {
            return Err(LifecycleError::NotStarted.into());
        }
        if lifecycle.stopped {
            return Ok(());
        }
        lifecycle.stopped = true;

        if let Some(queues) = self.queues.get() {
            info!(
                queued = queues.queued(),
                retrying = queues.retrying(),
                in_flight = queues.in_flight(),
                "closing ingest input"
            );
            queues.close_input();
        }
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let workers = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.started {
                return Err(LifecycleError::NotStarted.into());
            }
            std::mem::take(&mut lifecycle.workers)
        };

        let mut first_error = None;
        for (worker, joined) in join_all(workers).await.into_iter().enumerate() {
            let result = joined.unwrap_or_else(|err| {
                Err(IngestionError::WorkerPanicked {
                    worker,
                    reason: err.to_string(),
                })
            });
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    debug!(worker, "additional writer failure: {}", err);
                }
            }
        }

        if let Some(queues) = self.queues.get() {
            let left = queues.drain();
            if !left.is_empty() {
                warn!(chunks = left.len(), "ingest stopped with chunks still queued");
            }
            let reason = match &first_error {
                Some(err) => err.to_string(),
                None => "ingest stopped".to_string(),
            };
            for chunk in left {
                self.shared.complete(
                    chunk.into_pending(),
                    Err(ChunkError::Aborted {
                        reason: reason.clone(),
                    }),
                );
            }
        }

        self.shared.callbacks.close();
        self.shared.callbacks.wait().await;

        let metrics = self.metrics();
        info!(
            rows = metrics.total_rows,
            chunks = metrics.total_chunks,
            retried = metrics.retried_chunks,
            rejected = metrics.rejected_chunks,
            commits = metrics.commits,
            "ingest engine finished"
        );
        first_error.map_or(Ok(()), Err)
    }
}
