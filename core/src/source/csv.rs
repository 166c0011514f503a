use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{Reader, ReaderBuilder, StringRecord};
use tracing::{debug, warn};

use crate::chunk::{Chunk, Value};
use crate::config::SourceConfig;
use crate::errors::{ConfigError, SourceError};
use crate::source::Source;

/// Maps one record onto the values appended for its row.
pub type Preprocess = Arc<dyn Fn(&StringRecord, &mut Vec<Value>) + Send + Sync>;

/// Empty fields become NULL, everything else is bound as text.
pub fn text_or_null(record: &StringRecord, values: &mut Vec<Value>) {
    values.extend(record.iter().map(|field| {
        if field.is_empty() {
            Value::Null
        } else {
            Value::Text(field.to_string())
        }
    }));
}

#[derive(Clone)]
pub struct CsvOptions {
    pub delimiter: u8,
    pub has_headers: bool,
    /// Rows per chunk.
    pub batch_size: usize,
    /// Fields every record must have.
    pub columns: usize,
    pub stream_id: u64,
    pub preprocess: Preprocess,
}

impl CsvOptions {
    pub fn new(columns: usize, batch_size: usize) -> Self {
        Self {
            delimiter: b',',
            has_headers: false,
            batch_size,
            columns,
            stream_id: 0,
            preprocess: Arc::new(text_or_null),
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_headers(mut self, has_headers: bool) -> Self {
        self.has_headers = has_headers;
        self
    }

    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_preprocess<F>(mut self, preprocess: F) -> Self
    where
        F: Fn(&StringRecord, &mut Vec<Value>) + Send + Sync + 'static,
    {
        self.preprocess = Arc::new(preprocess);
        self
    }
}

struct Batch {
    values: Vec<Value>,
    rows: usize,
    skipped: u64,
    eof: bool,
    /// Error that ended the batch early; rows read before it are kept.
    error: Option<csv::Error>,
}

/// Reads a delimited file in chunks of `batch_size` rows.
///
/// Parsing runs on the blocking pool; the reader moves into the blocking
/// task and back for every batch.
///
/// A record that fails to parse ends its batch. The rows before it are
/// returned first and the error is reported by the following `read`, as
/// `SourceError::Transient` unless the underlying file failed.
pub struct CsvSource {
    path: PathBuf,
    options: CsvOptions,
    reader: Option<Reader<File>>,
    next_index: u64,
    skipped: u64,
    exhausted: bool,
    deferred: Option<csv::Error>,
}

impl CsvSource {
    pub fn new(path: impl AsRef<Path>, options: CsvOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
            reader: None,
            next_index: 0,
            skipped: 0,
            exhausted: false,
            deferred: None,
        }
    }

    pub fn from_config(config: &SourceConfig, columns: usize) -> Result<Self, ConfigError> {
        let delimiter = u8::try_from(config.delimiter).map_err(|_| ConfigError::Invalid {
            message: format!("delimiter {:?} is not a single byte", config.delimiter),
        })?;
        let options = CsvOptions::new(columns, config.batch_size)
            .with_delimiter(delimiter)
            .with_headers(config.has_headers)
            .with_stream_id(config.stream_id);
        Ok(Self::new(&config.path, options))
    }

    /// Records dropped because their field count was wrong.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Chunks produced so far.
    pub fn chunks_read(&self) -> u64 {
        self.next_index
    }
}

fn read_batch(reader: &mut Reader<File>, options: &CsvOptions) -> Batch {
    let limit = options.batch_size.max(1);
    let mut batch = Batch {
        values: Vec::with_capacity(limit * options.columns),
        rows: 0,
        skipped: 0,
        eof: false,
        error: None,
    };
    let mut record = StringRecord::new();
    while batch.rows < limit {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => {
                batch.eof = true;
                break;
            }
            Err(err) => {
                batch.error = Some(err);
                break;
            }
        }
        if record.len() != options.columns {
            warn!(
                line = record.position().map(|p| p.line()),
                fields = record.len(),
                expected = options.columns,
                "skipping malformed record"
            );
            batch.skipped += 1;
            continue;
        }
        (options.preprocess)(&record, &mut batch.values);
        batch.rows += 1;
    }
    batch
}

fn classify(err: csv::Error) -> SourceError {
    if err.is_io_error() {
        SourceError::Csv(err)
    } else {
        SourceError::Transient {
            source: Box::new(err),
        }
    }
}

impl Source for CsvSource {
    async fn open(&mut self) -> Result<(), SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Open {
            path: self.path.display().to_string(),
            source,
        })?;
        let reader = ReaderBuilder::new()
            .delimiter(self.options.delimiter)
            .has_headers(self.options.has_headers)
            .flexible(true)
            .from_reader(file);
        self.reader = Some(reader);
        self.exhausted = false;
        self.deferred = None;
        debug!(path = %self.path.display(), "csv source opened");
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Chunk>, SourceError> {
        if let Some(err) = self.deferred.take() {
            return Err(classify(err));
        }
        if self.exhausted {
            return Ok(None);
        }
        let mut reader = self.reader.take().ok_or(SourceError::NotOpen)?;
        let options = self.options.clone();
        let (reader, batch) = tokio::task::spawn_blocking(move || {
            let batch = read_batch(&mut reader, &options);
            (reader, batch)
        })
        .await
        .map_err(|err| SourceError::Unrecoverable(Box::new(err)))?;
        self.reader = Some(reader);

        self.skipped += batch.skipped;
        if batch.eof {
            self.exhausted = true;
        }
        if let Some(err) = batch.error {
            warn!(rows = batch.rows, "csv batch cut short: {}", err);
            if batch.rows == 0 {
                return Err(classify(err));
            }
            self.deferred = Some(err);
        } else if batch.rows == 0 {
            return Ok(None);
        }

        let chunk = Chunk::new(self.options.stream_id, self.next_index, batch.values);
        self.next_index += 1;
        Ok(Some(chunk))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.reader = None;
        debug!(
            path = %self.path.display(),
            chunks = self.next_index,
            skipped = self.skipped,
            "csv source closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn read_all(source: &mut CsvSource) -> Vec<Chunk> {
        source.open().await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = source.read().await.unwrap() {
            chunks.push(chunk);
        }
        source.close().await.unwrap();
        chunks
    }

    #[tokio::test]
    async fn batches_rows_and_delivers_the_tail() {
        let file = file_with("1,a\n2,b\n3,c\n4,d\n5,e\n");
        let mut source = CsvSource::new(file.path(), CsvOptions::new(2, 2));

        let chunks = read_all(&mut source).await;
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(chunks[2].values, vec![Value::from("5"), Value::from("e")]);
    }

    #[tokio::test]
    async fn empty_fields_become_null() {
        let file = file_with("id|name\n1|\n|x\n");
        let options = CsvOptions::new(2, 10)
            .with_delimiter(b'|')
            .with_headers(true)
            .with_stream_id(9);
        let mut source = CsvSource::new(file.path(), options);

        let chunks = read_all(&mut source).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].stream_id, 9);
        assert_eq!(
            chunks[0].values,
            vec![Value::from("1"), Value::Null, Value::Null, Value::from("x")]
        );
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let file = file_with("1,a\n2\n3,c,extra\n4,d\n");
        let mut source = CsvSource::new(file.path(), CsvOptions::new(2, 10));

        let chunks = read_all(&mut source).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(source.skipped(), 2);
    }

    #[tokio::test]
    async fn preprocess_hook_shapes_values() {
        let file = file_with("1,true\n2,false\n");
        let options = CsvOptions::new(2, 10).with_preprocess(|record, values| {
            values.push(Value::Int(record[0].parse().unwrap_or_default()));
            values.push(Value::Bool(&record[1] == "true"));
        });
        let mut source = CsvSource::new(file.path(), options);

        let chunks = read_all(&mut source).await;
        assert_eq!(
            chunks[0].values,
            vec![
                Value::Int(1),
                Value::Bool(true),
                Value::Int(2),
                Value::Bool(false)
            ]
        );
    }

    #[tokio::test]
    async fn read_before_open_fails() {
        let mut source = CsvSource::new("/nonexistent.csv", CsvOptions::new(1, 1));
        assert!(matches!(source.read().await, Err(SourceError::NotOpen)));
        assert!(matches!(
            source.open().await,
            Err(SourceError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn bad_record_keeps_earlier_rows_and_reads_on() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"1,a\n2,b\n3,\xff\n4,d\n").unwrap();
        file.flush().unwrap();
        let mut source = CsvSource::new(file.path(), CsvOptions::new(2, 10));
        source.open().await.unwrap();

        let first = source.read().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first.index, 0);
        assert!(matches!(
            source.read().await,
            Err(SourceError::Transient { .. })
        ));
        let rest = source.read().await.unwrap().unwrap();
        assert_eq!(rest.values, vec![Value::from("4"), Value::from("d")]);
        assert_eq!(rest.index, 1);
        assert!(source.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_first_record_fails_the_read() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"\xfe,a\n2,b\n").unwrap();
        file.flush().unwrap();
        let mut source = CsvSource::new(file.path(), CsvOptions::new(2, 10));
        source.open().await.unwrap();

        assert!(matches!(
            source.read().await,
            Err(SourceError::Transient { .. })
        ));
        let rest = source.read().await.unwrap().unwrap();
        assert_eq!(rest.values, vec![Value::from("2"), Value::from("b")]);
    }

    #[tokio::test]
    async fn empty_file_yields_nothing() {
        let file = file_with("");
        let mut source = CsvSource::new(file.path(), CsvOptions::new(3, 5));
        assert!(read_all(&mut source).await.is_empty());
    }
}
