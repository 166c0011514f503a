pub mod csv;

use std::future::Future;

use crate::chunk::Chunk;
use crate::errors::SourceError;

pub use self::csv::{CsvOptions, CsvSource, Preprocess};

/// A producer of chunks, regardless of whether it reads a file, a socket or
/// a generator.
pub trait Source: Send + 'static {
    /// Acquires whatever the source reads from. Called once before `read`.
    fn open(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Returns the next chunk of flattened row values.
    ///
    /// A final partial chunk is returned before `None`, which signals that
    /// the source is exhausted.
    fn read(&mut self) -> impl Future<Output = Result<Option<Chunk>, SourceError>> + Send;

    /// Releases the source. This should be called even when reading failed.
    fn close(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;
}
