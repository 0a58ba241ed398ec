//! Batched row movement between flat files and the store.
//!
//! Readers yield bounded [`RowBatch`]es; writers consume and discard them.
//! One batch is in flight at a time, which bounds peak memory to the batch
//! size on every path except the labeled whole-result fallback.

use crate::client::{ColumnMeta, StoreClient};
use crate::error::{BridgeError, Result};
use crate::schema::{coerce_cell, ColumnDescriptor};
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;
use tracing::warn;

/// Default upper bound on rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// File formats accepted on both directions of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    /// Resolves a format from a file name's extension. Anything other than
    /// `.csv` / `.json` is rejected.
    pub fn from_filename(filename: &str) -> Result<Self> {
        let lower = filename.to_lowercase();
        if lower.ends_with(".csv") {
            Ok(FileFormat::Csv)
        } else if lower.ends_with(".json") {
            Ok(FileFormat::Json)
        } else {
            Err(BridgeError::UnsupportedFormat(format!(
                "unsupported file extension on '{}', expected .csv or .json",
                filename
            )))
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "json" => Ok(FileFormat::Json),
            other => Err(BridgeError::UnsupportedFormat(format!(
                "unsupported file format '{}'",
                other
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
        }
    }
}

/// Bounded chunk of rows, positionally aligned to a descriptor sequence.
#[derive(Clone, Debug, Default)]
pub struct RowBatch {
    pub rows: Vec<Vec<Value>>,
}

impl RowBatch {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Textual representation used for CSV cells and all-string store inserts.
/// Null becomes the empty string; everything else keeps its literal form.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

enum FileSource {
    Csv {
        reader: csv::Reader<Cursor<Vec<u8>>>,
        // Source column index per descriptor position.
        projection: Vec<Option<usize>>,
    },
    Json {
        records: std::vec::IntoIter<Value>,
    },
}

/// Forward-only batch reader over an uploaded file. Not restartable; the
/// underlying content is consumed exactly once.
pub struct FileBatchReader {
    source: FileSource,
    descriptors: Vec<ColumnDescriptor>,
    batch_size: usize,
    nullable: bool,
}

impl FileBatchReader {
    /// Builds a CSV reader projecting the file's columns onto `descriptors`
    /// (which may be a subset of the header, already validated upstream).
    pub fn csv(
        content: Vec<u8>,
        descriptors: Vec<ColumnDescriptor>,
        batch_size: usize,
        nullable: bool,
    ) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(content));

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let projection = descriptors
            .iter()
            .map(|d| headers.iter().position(|h| h == &d.name))
            .collect();

        Ok(Self {
            source: FileSource::Csv { reader, projection },
            descriptors,
            batch_size: batch_size.max(1),
            nullable,
        })
    }

    /// Builds a reader over an already-parsed JSON records array. The array
    /// form cannot be consumed incrementally, so import memory is bounded by
    /// the uploaded payload rather than the batch size.
    pub fn json(
        records: Vec<Value>,
        descriptors: Vec<ColumnDescriptor>,
        batch_size: usize,
        nullable: bool,
    ) -> Self {
        Self {
            source: FileSource::Json {
                records: records.into_iter(),
            },
            descriptors,
            batch_size: batch_size.max(1),
            nullable,
        }
    }

    pub fn descriptors(&self) -> &[ColumnDescriptor] {
        &self.descriptors
    }

    /// Pulls the next batch, or `None` once the file is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        let mut rows = Vec::new();

        match &mut self.source {
            FileSource::Csv { reader, projection } => {
                let mut record = csv::StringRecord::new();
                while rows.len() < self.batch_size && reader.read_record(&mut record)? {
                    let row = self
                        .descriptors
                        .iter()
                        .zip(projection.iter())
                        .map(|(descriptor, source_idx)| {
                            let raw = source_idx
                                .and_then(|idx| record.get(idx))
                                .unwrap_or("");
                            coerce_cell(raw, descriptor.semantic_type, self.nullable)
                        })
                        .collect();
                    rows.push(row);
                }
            }
            FileSource::Json { records } => {
                while rows.len() < self.batch_size {
                    let Some(record) = records.next() else {
                        break;
                    };
                    let obj = record.as_object().ok_or_else(|| {
                        BridgeError::Validation(
                            "JSON file must be an array of objects".to_string(),
                        )
                    })?;
                    let row = self
                        .descriptors
                        .iter()
                        .map(|d| obj.get(&d.name).cloned().unwrap_or(Value::Null))
                        .collect();
                    rows.push(row);
                }
            }
        }

        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RowBatch::new(rows)))
        }
    }
}

enum FileSink {
    Csv {
        writer: csv::Writer<File>,
        header_written: bool,
    },
    Json {
        writer: BufWriter<File>,
        wrote_record: bool,
    },
}

/// Appends batches to a destination file, writing the CSV header (or opening
/// the JSON records array) before the first rows.
pub struct FileBatchWriter {
    sink: FileSink,
    descriptors: Vec<ColumnDescriptor>,
}

impl FileBatchWriter {
    pub fn create(
        path: &Path,
        format: FileFormat,
        descriptors: Vec<ColumnDescriptor>,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let sink = match format {
            FileFormat::Csv => FileSink::Csv {
                writer: csv::WriterBuilder::new().from_writer(file),
                header_written: false,
            },
            FileFormat::Json => {
                let mut writer = BufWriter::new(file);
                writer.write_all(b"[")?;
                FileSink::Json {
                    writer,
                    wrote_record: false,
                }
            }
        };
        Ok(Self { sink, descriptors })
    }

    pub fn write_batch(&mut self, batch: &RowBatch) -> Result<()> {
        match &mut self.sink {
            FileSink::Csv {
                writer,
                header_written,
            } => {
                if !*header_written {
                    writer.write_record(self.descriptors.iter().map(|d| d.name.as_str()))?;
                    *header_written = true;
                }
                for row in &batch.rows {
                    let cells: Vec<String> = self
                        .descriptors
                        .iter()
                        .enumerate()
                        .map(|(idx, _)| value_to_text(row.get(idx).unwrap_or(&Value::Null)))
                        .collect();
                    writer.write_record(&cells)?;
                }
            }
            FileSink::Json {
                writer,
                wrote_record,
            } => {
                for row in &batch.rows {
                    let mut object = serde_json::Map::with_capacity(self.descriptors.len());
                    for (idx, descriptor) in self.descriptors.iter().enumerate() {
                        object.insert(
                            descriptor.name.clone(),
                            row.get(idx).cloned().unwrap_or(Value::Null),
                        );
                    }
                    if *wrote_record {
                        writer.write_all(b",")?;
                    }
                    serde_json::to_writer(&mut *writer, &Value::Object(object))?;
                    *wrote_record = true;
                }
            }
        }
        Ok(())
    }

    /// Flushes buffered output and closes the JSON array. The CSV header is
    /// still emitted for a zero-row result.
    pub fn finish(mut self) -> Result<()> {
        match &mut self.sink {
            FileSink::Csv {
                writer,
                header_written,
            } => {
                if !*header_written {
                    writer.write_record(self.descriptors.iter().map(|d| d.name.as_str()))?;
                }
                writer.flush()?;
            }
            FileSink::Json { writer, .. } => {
                writer.write_all(b"]")?;
                writer.flush()?;
            }
        }
        Ok(())
    }
}

/// Batched reader over a store query. The default path advances a
/// LIMIT/OFFSET window `batch_size` rows at a time; with `paged` off it runs
/// the whole query once and slices client-side, which loads the entire
/// result into memory and is unsafe for large results.
pub struct StoreBatchReader<'a> {
    client: &'a dyn StoreClient,
    sql: String,
    batch_size: usize,
    paged: bool,
    offset: usize,
    columns: Option<Vec<ColumnMeta>>,
    buffered: Option<Vec<Vec<Value>>>,
    position: usize,
    done: bool,
}

impl<'a> StoreBatchReader<'a> {
    pub fn new(client: &'a dyn StoreClient, sql: String, batch_size: usize, paged: bool) -> Self {
        Self {
            client,
            sql,
            batch_size: batch_size.max(1),
            paged,
            offset: 0,
            columns: None,
            buffered: None,
            position: 0,
            done: false,
        }
    }

    /// Column metadata from the first pull; `None` until then.
    pub fn columns(&self) -> Option<&[ColumnMeta]> {
        self.columns.as_deref()
    }

    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.done {
            return Ok(None);
        }

        if self.paged {
            let result = self
                .client
                .query_page(&self.sql, self.batch_size, self.offset)
                .await?;
            if self.columns.is_none() {
                self.columns = Some(result.columns);
            }
            let count = result.rows.len();
            self.offset += count;
            if count < self.batch_size {
                self.done = true;
            }
            if count == 0 {
                return Ok(None);
            }
            return Ok(Some(RowBatch::new(result.rows)));
        }

        if self.buffered.is_none() {
            warn!(
                sql = %self.sql,
                "whole-result fallback: full result set held in memory"
            );
            let result = self.client.query(&self.sql).await?;
            self.columns = Some(result.columns);
            self.buffered = Some(result.rows);
            self.position = 0;
        }

        let buffered = self.buffered.as_mut().unwrap();
        if self.position >= buffered.len() {
            self.done = true;
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(buffered.len());
        let rows = buffered[self.position..end].to_vec();
        self.position = end;
        Ok(Some(RowBatch::new(rows)))
    }
}

/// Writes one batch into the store as a single bulk insert. Every cell goes
/// in as its textual representation, matching the all-string table schema.
pub async fn write_store_batch(
    client: &dyn StoreClient,
    table: &str,
    columns: &[String],
    batch: &RowBatch,
) -> Result<u64> {
    let rows: Vec<Vec<Value>> = batch
        .rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|idx| Value::String(value_to_text(row.get(idx).unwrap_or(&Value::Null))))
                .collect()
        })
        .collect();
    client.insert_rows(table, columns, &rows).await
}
