pub mod chunk;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod pipe;
pub mod rate;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use chunk::{Chunk, Completion, Value};
pub use config::{EngineConfig, IngestConfig};
pub use errors::{IngestionError, Result};
pub use ingestor::{ChunkStream, Engine, Ingest, Sinkhole};
pub use pipe::Pipe;
pub use rate::{RateReporter, format_quantity};
