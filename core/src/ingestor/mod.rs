mod engine;
mod queue;
mod sinkhole;
mod statement;
mod writer;

use std::future::Future;

use crate::chunk::Chunk;
use crate::errors::Result;

pub use engine::Engine;
pub use queue::ChunkStream;
pub use sinkhole::Sinkhole;
pub use statement::StatementCache;

/// The `Ingest` trait is the contract every chunk consumer offers producers.
///
/// Lifecycle: `start`, then any number of `add_chunk` calls or sends on
/// `stream`, then `stop` to close the input, then `wait` until every
/// accepted chunk has been written or given up on.
pub trait Ingest: Send + Sync + 'static {
    /// Enqueues a chunk, suspending while the input queue is full.
    fn add_chunk(&self, chunk: Chunk) -> impl Future<Output = Result<()>> + Send;

    /// Rows written so far.
    fn total_rows(&self) -> u64;

    /// Chunks written so far.
    fn total_chunks(&self) -> u64;

    /// A producer handle onto the input queue. Only available once started.
    fn stream(&self) -> Result<ChunkStream>;

    fn start(&self) -> Result<()>;

    /// Closes the input. Already queued chunks are still written.
    fn stop(&self) -> Result<()>;

    /// Resolves once every worker has exited and every callback has run.
    fn wait(&self) -> impl Future<Output = Result<()>> + Send;
}
