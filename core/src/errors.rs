use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error: {0}")]
    SourceError(#[from] SourceError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// A worker could not begin, commit or close and stopped the line.
    #[error("Worker {worker} failed to {stage}: {source}")]
    Fatal {
        worker: usize,
        stage: Stage,
        #[source]
        source: SinkError,
    },

    #[error("Worker {worker} panicked: {reason}")]
    WorkerPanicked { worker: usize, reason: String },

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// The resource operation a fatal worker error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Begin,
    Commit,
    CloseStatement,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Begin => f.write_str("begin transaction"),
            Stage::Commit => f.write_str("commit transaction"),
            Stage::CloseStatement => f.write_str("close statement"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("ingest already started")]
    AlreadyStarted,

    #[error("ingest not started")]
    NotStarted,

    #[error("ingest stopped, no more chunks are accepted")]
    Stopped,

    #[error("no tokio runtime is running")]
    NoRuntime,
}

/// Outcome errors delivered to a chunk's completion callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("the number of values ({values}) is not a multiple of the column count ({columns})")]
    ColumnMismatch { values: usize, columns: usize },

    #[error("chunk was not written: {reason}")]
    Aborted { reason: String },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source is not open")]
    NotOpen,

    #[error("Failed to read record: {0}")]
    Csv(#[from] csv::Error),

    #[error("A transient error occurred, the operation can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("transaction has already been committed or rolled back")]
    TransactionFinished,

    #[error("Statement rejected: {reason}")]
    Rejected { reason: String },
}

impl SinkError {
    /// Commit outcomes a flush may race with; these are not failures.
    pub fn is_transaction_finished(&self) -> bool {
        match self {
            SinkError::TransactionFinished => true,
            SinkError::Database(sqlx::Error::Database(db)) => db
                .message()
                .contains("transaction has already been committed or rolled back"),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl IngestionError {
    /// Errors that mean the ingestion line has stopped and data may be unwritten.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestionError::Fatal { .. } | IngestionError::WorkerPanicked { .. }
        )
    }
}
