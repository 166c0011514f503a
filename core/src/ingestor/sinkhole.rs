use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::errors::{IngestionError, LifecycleError, Result};
use crate::ingestor::Ingest;
use crate::ingestor::queue::{ChunkStream, Queues, abandon};
use crate::telemetry::{Counters, IngestMetrics};

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    consumer: Option<JoinHandle<()>>,
}

/// An ingest that counts chunks and throws them away.
///
/// Useful to measure how fast a source can produce without a database in
/// the way.
pub struct Sinkhole {
    columns: usize,
    counters: Arc<Counters>,
    queues: OnceLock<Arc<Queues>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Sinkhole {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            counters: Arc::new(Counters::default()),
            queues: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.counters.snapshot()
    }
}

async fn consume(columns: usize, queues: Arc<Queues>, counters: Arc<Counters>) {
    while let Ok(chunk) = queues.input().recv().await {
        let result = chunk.row_count(columns).map(|rows| counters.record_written(rows));
        if let Err(err) = &result {
            warn!(stream_id = chunk.stream_id, index = chunk.index, "rejecting chunk: {}", err);
            counters.record_rejected();
        }
        if let Some(run) = chunk.into_pending().resolve(result) {
            run();
        }
        queues.settle();
    }
    debug!("sinkhole drained");
}

impl Ingest for Sinkhole {
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
        self.counters.total_rows()
    }

    fn total_chunks(&self) -> u64 {
        self.counters.total_chunks()
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

        let queues = Arc::new(Queues::new(100, 1));
        if self.queues.set(Arc::clone(&queues)).is_err() {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        lifecycle.started = true;
        lifecycle.consumer = Some(runtime.spawn(consume(
            self.columns,
            queues,
            Arc::clone(&self.counters),
        )));
        info!(columns = self.columns, "sinkhole started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.started {
            return Err(LifecycleError::NotStarted.into());
        }
        if !lifecycle.stopped {
            lifecycle.stopped = true;
            if let Some(queues) = self.queues.get() {
                queues.close_input();
            }
        }
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let consumer = {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.started {
                return Err(LifecycleError::NotStarted.into());
            }
            lifecycle.consumer.take()
        };
        if let Some(consumer) = consumer {
            consumer.await.map_err(|err| IngestionError::WorkerPanicked {
                worker: 0,
                reason: err.to_string(),
            })?;
        }
        info!(
            rows = self.total_rows(),
            chunks = self.total_chunks(),
            "sinkhole finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Value;

    fn values(n: i64) -> Vec<Value> {
        (0..n).map(Value::from).collect()
    }

    #[tokio::test]
    async fn counts_rows_and_chunks() {
        let sinkhole = Sinkhole::new(2);
        sinkhole.start().unwrap();

        let (first, first_ack) = Chunk::new(0, 0, values(4)).with_ack();
        let (second, second_ack) = Chunk::new(0, 1, values(6)).with_ack();
        sinkhole.add_chunk(first).await.unwrap();
        sinkhole.stream().unwrap().send(second).await.unwrap();

        sinkhole.stop().unwrap();
        sinkhole.wait().await.unwrap();

        assert!(first_ack.await.unwrap().is_ok());
        assert!(second_ack.await.unwrap().is_ok());
        assert_eq!(sinkhole.total_rows(), 5);
        assert_eq!(sinkhole.total_chunks(), 2);
    }

    #[tokio::test]
    async fn rejects_partial_rows() {
        let sinkhole = Sinkhole::new(3);
        sinkhole.start().unwrap();

        let (chunk, ack) = Chunk::new(0, 0, values(4)).with_ack();
        sinkhole.add_chunk(chunk).await.unwrap();
        sinkhole.stop().unwrap();
        sinkhole.wait().await.unwrap();

        assert!(!ack.await.unwrap().is_ok());
        assert_eq!(sinkhole.total_rows(), 0);
        assert_eq!(sinkhole.metrics().rejected_chunks, 1);
    }

    #[tokio::test]
    async fn add_before_start_fails() {
        let sinkhole = Sinkhole::new(1);
        let (chunk, ack) = Chunk::new(0, 0, values(1)).with_ack();
        let err = sinkhole.add_chunk(chunk).await.unwrap_err();
        assert!(matches!(err, IngestionError::Lifecycle(LifecycleError::NotStarted)));
        assert!(!ack.await.unwrap().is_ok());
    }
}
