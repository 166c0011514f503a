use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{IngestionError, LifecycleError, Result, SourceError};
use crate::ingestor::Ingest;
use crate::source::Source;

/// Moves chunks from a source into an ingest.
///
/// A shared semaphore passed to `with_limit` bounds how many pipes read at
/// the same time.
pub struct Pipe<S: Source, I: Ingest> {
    source: Mutex<Option<S>>,
    ingest: Arc<I>,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<u64>>>>,
}

impl<S: Source, I: Ingest> Pipe<S, I> {
    pub fn new(source: S, ingest: Arc<I>) -> Self {
        Self {
            source: Mutex::new(Some(source)),
            ingest,
            limit: None,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_limit(source: S, ingest: Arc<I>, limit: Arc<Semaphore>) -> Self {
        let mut pipe = Self::new(source, ingest);
        pipe.limit = Some(limit);
        pipe
    }

    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        let source = self
            .source
            .lock()
            .take()
            .ok_or(LifecycleError::AlreadyStarted)?;
        let task = runtime.spawn(run(
            source,
            Arc::clone(&self.ingest),
            self.limit.clone(),
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Asks the pipe to stop after the chunk it is forwarding.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Number of chunks forwarded, or the error that ended the pipe.
    pub async fn wait(&self) -> Result<u64> {
        let task = self.task.lock().take().ok_or(LifecycleError::NotStarted)?;
        task.await.map_err(|err| {
            IngestionError::Generic(anyhow::anyhow!("pipe task failed: {}", err))
        })?
    }
}

async fn run<S: Source, I: Ingest>(
    mut source: S,
    ingest: Arc<I>,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> Result<u64> {
    let _permit = match limit {
        Some(limit) => tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            permit = limit.acquire_owned() => {
                Some(permit.map_err(|err| IngestionError::Generic(err.into()))?)
            }
        },
        None => None,
    };

    source.open().await?;
    let forwarded = forward(&mut source, ingest.as_ref(), &cancel).await;
    if let Err(err) = source.close().await {
        warn!("failed to close source: {}", err);
    }

    match &forwarded {
        Ok(chunks) => info!(chunks, "pipe finished"),
        Err(err) => error!("pipe stopped: {}", err),
    }
    forwarded
}

async fn forward<S: Source, I: Ingest>(
    source: &mut S,
    ingest: &I,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut forwarded = 0;
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(forwarded, "pipe cancelled");
                break;
            }
            read = source.read() => read,
        };
        match read {
            Ok(Some(chunk)) => {
                ingest.add_chunk(chunk).await?;
                forwarded += 1;
            }
            Ok(None) => break,
            Err(err @ SourceError::Transient { .. }) => {
                warn!("transient source error, continuing: {}", err);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(forwarded)
}
