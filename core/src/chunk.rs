use std::borrow::Cow;
use std::fmt;
use std::fmt::Write as _;

use tokio::sync::oneshot;

use crate::errors::ChunkError;

/// A single scalar bound as one positional statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// The value in PostgreSQL's text input syntax, `None` for NULL.
    pub fn to_text(&self) -> Option<Cow<'_, str>> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(v) => Cow::Borrowed(if *v { "true" } else { "false" }),
            Value::Int(v) => Cow::Owned(v.to_string()),
            Value::Float(v) if v.is_nan() => Cow::Borrowed("NaN"),
            Value::Float(v) if v.is_infinite() => {
                Cow::Borrowed(if *v > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Value::Float(v) => Cow::Owned(v.to_string()),
            Value::Text(v) => Cow::Borrowed(v.as_str()),
            Value::Bytes(v) => {
                let mut hex = String::with_capacity(2 + v.len() * 2);
                hex.push_str("\\x");
                for byte in v {
                    let _ = write!(hex, "{:02x}", byte);
                }
                Cow::Owned(hex)
            }
        };
        Some(text)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// What a chunk's callback receives once its fate is known.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub stream_id: u64,
    pub index: u64,
    /// How many times the chunk went through the retry queue.
    pub retry: u32,
    pub result: Result<(), ChunkError>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A batch of records flattened row-major into one value sequence.
pub struct Chunk {
    pub stream_id: u64,
    pub index: u64,
    pub values: Vec<Value>,
    pub retry: u32,
    callback: Option<Callback>,
}

impl Chunk {
    pub fn new(stream_id: u64, index: u64, values: Vec<Value>) -> Self {
        Self {
            stream_id,
            index,
            values,
            retry: 0,
            callback: None,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Replaces the callback with a oneshot channel carrying the completion.
    pub fn with_ack(self) -> (Self, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let chunk = self.with_callback(move |completion| {
            let _ = tx.send(completion);
        });
        (chunk, rx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of rows the values form for `columns` columns.
    pub fn row_count(&self, columns: usize) -> Result<usize, ChunkError> {
        let values = self.values.len();
        if columns == 0 || values == 0 || values % columns != 0 {
            return Err(ChunkError::ColumnMismatch { values, columns });
        }
        Ok(values / columns)
    }

    /// Splits the chunk into its completion handle, dropping the values.
    pub(crate) fn into_pending(mut self) -> PendingCompletion {
        PendingCompletion {
            stream_id: self.stream_id,
            index: self.index,
            retry: self.retry,
            callback: self.callback.take(),
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("stream_id", &self.stream_id)
            .field("index", &self.index)
            .field("values", &self.values.len())
            .field("retry", &self.retry)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// A chunk whose values are gone and whose callback still has to fire.
pub(crate) struct PendingCompletion {
    stream_id: u64,
    index: u64,
    retry: u32,
    callback: Option<Callback>,
}

impl PendingCompletion {
    /// Returns the callback bound to its completion, if the chunk had one.
    pub(crate) fn resolve(self, result: Result<(), ChunkError>) -> Option<impl FnOnce() + Send + 'static> {
        let completion = Completion {
            stream_id: self.stream_id,
            index: self.index,
            retry: self.retry,
            result,
        };
        self.callback.map(|callback| move || callback(completion))
    }
}
