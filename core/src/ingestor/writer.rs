use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::chunk::{Chunk, PendingCompletion};
use crate::errors::{ChunkError, IngestionError, Result, SinkError, Stage};
use crate::ingestor::engine::Shared;
use crate::ingestor::queue::Queues;
use crate::sink::{Sink, Transaction};

struct Prepared<T> {
    rows: usize,
    statement: T,
}

/// A writer's transaction together with its prepared statement.
struct OpenTransaction<T: Transaction> {
    tx: T,
    prepared: Option<Prepared<T::Statement>>,
    /// Rows executed since the last commit.
    rows: usize,
}

/// One worker of the pool: drains the queues into its own transactions.
pub(crate) struct Writer<S: Sink> {
    id: usize,
    shared: Arc<Shared<S>>,
    queues: Arc<Queues>,
    retry_open: bool,
    input_open: bool,
    /// Executed chunks whose callbacks wait for the next commit.
    pending: Vec<PendingCompletion>,
}

/// Spawns a writer; a panic inside it aborts the engine like a fatal error.
pub(crate) fn spawn_writer<S: Sink>(
    runtime: &Handle,
    id: usize,
    shared: Arc<Shared<S>>,
    queues: Arc<Queues>,
) -> JoinHandle<Result<()>> {
    let writer = Writer::new(id, Arc::clone(&shared), Arc::clone(&queues));
    runtime.spawn(async move {
        match AssertUnwindSafe(writer.run()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(worker = id, "writer panicked: {}", reason);
                shared.abort(&queues);
                Err(IngestionError::WorkerPanicked { worker: id, reason })
            }
        }
    })
}

impl<S: Sink> Writer<S> {
    fn new(id: usize, shared: Arc<Shared<S>>, queues: Arc<Queues>) -> Self {
        Self {
            id,
            shared,
            queues,
            retry_open: true,
            input_open: true,
            pending: Vec::new(),
        }
    }

    async fn run(mut self) -> Result<()> {
        debug!(worker = self.id, "writer started");
        let result = self.drive().await;
        match &result {
            Ok(()) => debug!(worker = self.id, "writer finished"),
            Err(err) => {
                error!(worker = self.id, "writer stopped: {}", err);
                self.shared.abort(&self.queues);
                self.release_pending(Err(ChunkError::Aborted {
                    reason: err.to_string(),
                }));
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut open = self.begin().await?;
        while let Some(chunk) = self.next_chunk().await {
            open = self.process(open, chunk).await?;
        }
        self.commit(open).await
    }

    /// Next chunk, retries first. `None` once both queues are closed and
    /// empty or the engine aborted.
    async fn next_chunk(&mut self) -> Option<Chunk> {
        loop {
            if !self.retry_open && !self.input_open {
                return None;
            }
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return None,
                received = self.queues.retry().recv(), if self.retry_open => match received {
                    Ok(chunk) => return Some(chunk),
                    Err(_) => self.retry_open = false,
                },
                received = self.queues.input().recv(), if self.input_open => match received {
                    Ok(chunk) => return Some(chunk),
                    Err(_) => self.input_open = false,
                },
            }
        }
    }

    async fn process(
        &mut self,
        mut open: OpenTransaction<S::Transaction>,
        chunk: Chunk,
    ) -> Result<OpenTransaction<S::Transaction>> {
        let rows = match chunk.row_count(self.shared.config.columns) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    worker = self.id,
                    stream_id = chunk.stream_id,
                    index = chunk.index,
                    "rejecting chunk: {}",
                    err
                );
                self.shared.counters.record_rejected();
                self.shared.complete(chunk.into_pending(), Err(err));
                self.queues.settle();
                return Ok(open);
            }
        };

        let prepared = match open.prepared.take() {
            Some(prepared) if prepared.rows == rows => prepared,
            stale => {
                if let Some(old) = stale {
                    if let Err(err) = open.tx.close(old.statement).await {
                        let err = self.fatal(Stage::CloseStatement, err);
                        self.shared.complete(
                            chunk.into_pending(),
                            Err(ChunkError::Aborted {
                                reason: err.to_string(),
                            }),
                        );
                        self.queues.settle();
                        return Err(err);
                    }
                }
                let sql = self.shared.statements.get(rows);
                match open.tx.prepare(&sql).await {
                    Ok(statement) => Prepared { rows, statement },
                    Err(err) => {
                        warn!(
                            worker = self.id,
                            rows, "failed to prepare insert statement: {}", err
                        );
                        self.requeue(chunk).await;
                        let open = self.restart(open).await?;
                        tokio::time::sleep(self.shared.config.retry_backoff()).await;
                        return Ok(open);
                    }
                }
            }
        };

        let executed = open.tx.execute(&prepared.statement, &chunk.values).await;
        open.prepared = Some(prepared);

        match executed {
            Ok(_) => {
                self.shared.counters.record_written(rows);
                open.rows += rows;
                self.pending.push(chunk.into_pending());
                self.queues.settle();

                if open.rows > self.shared.config.commit_size {
                    debug!(worker = self.id, rows = open.rows, "commit window reached");
                    self.commit(open).await?;
                    return self.begin().await;
                }
                Ok(open)
            }
            Err(err) => {
                warn!(
                    worker = self.id,
                    stream_id = chunk.stream_id,
                    index = chunk.index,
                    retry = chunk.retry + 1,
                    "insert failed, requeueing chunk: {}",
                    err
                );
                self.requeue(chunk).await;
                self.restart(open).await
            }
        }
    }

    async fn requeue(&mut self, mut chunk: Chunk) {
        chunk.retry += 1;
        self.shared.counters.record_retry();
        if let Err(chunk) = self.queues.requeue(chunk).await {
            self.shared.complete(
                chunk.into_pending(),
                Err(ChunkError::Aborted {
                    reason: "ingest aborted before the chunk was retried".to_string(),
                }),
            );
            self.queues.settle();
        }
    }

    /// Ends the transaction a failed statement ran in and begins a new one.
    /// Rows already executed in it are committed rather than lost.
    async fn restart(
        &mut self,
        open: OpenTransaction<S::Transaction>,
    ) -> Result<OpenTransaction<S::Transaction>> {
        if open.rows > 0 {
            self.commit(open).await?;
        } else {
            drop(open);
        }
        self.begin().await
    }

    async fn begin(&mut self) -> Result<OpenTransaction<S::Transaction>> {
        let tx = self
            .shared
            .sink
            .begin()
            .await
            .map_err(|err| self.fatal(Stage::Begin, err))?;
        Ok(OpenTransaction {
            tx,
            prepared: None,
            rows: 0,
        })
    }

    async fn commit(&mut self, mut open: OpenTransaction<S::Transaction>) -> Result<()> {
        if let Some(prepared) = open.prepared.take() {
            open.tx
                .close(prepared.statement)
                .await
                .map_err(|err| self.fatal(Stage::CloseStatement, err))?;
        }

        let rows = open.rows;
        match open.tx.commit().await {
            Ok(()) => {}
            Err(err) if err.is_transaction_finished() => {
                debug!(worker = self.id, rows, "transaction already finished: {}", err);
            }
            Err(err) => return Err(self.fatal(Stage::Commit, err)),
        }

        self.shared.counters.record_commit();
        debug!(worker = self.id, rows, chunks = self.pending.len(), "committed");
        self.release_pending(Ok(()));
        Ok(())
    }

    fn release_pending(&mut self, result: std::result::Result<(), ChunkError>) {
        for pending in self.pending.drain(..) {
            self.shared.complete(pending, result.clone());
        }
    }

    fn fatal(&self, stage: Stage, source: SinkError) -> IngestionError {
        IngestionError::Fatal {
            worker: self.id,
            stage,
            source,
        }
    }
}
