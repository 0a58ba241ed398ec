//! Transfer orchestrator - drives one job end-to-end.
//!
//! A job is a strict sequential pipeline: read one batch, write it, repeat.
//! State machine: Pending -> Running on the first batch pull, then Succeeded
//! on end-of-input or Failed on the first unrecoverable error. Jobs are never
//! retried or resumed; a failed job still reports the rows moved so far.

use crate::batch::{
    write_store_batch, FileBatchReader, FileBatchWriter, FileFormat, StoreBatchReader,
    DEFAULT_BATCH_SIZE,
};
use crate::client::{quote_identifier, validate_identifier, StoreClient};
use crate::error::{BridgeError, Result};
use crate::schema::{
    descriptors_from_meta, infer_from_csv, infer_from_json, ColumnDescriptor, InferenceOptions,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferDirection {
    StoreToFile,
    FileToStore,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Options controlling a single transfer.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    /// Upper bound on rows per batch.
    pub batch_size: usize,

    /// Sample prefix length for file type inference.
    pub sample_rows: usize,

    /// Whether empty cells are kept as nulls during inference and reads.
    pub nullable: bool,

    /// Server-side LIMIT/OFFSET paging for store reads. Turning this off
    /// falls back to one whole-result query sliced client-side, which is
    /// memory-unsafe for large results.
    pub paged: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sample_rows: 100,
            nullable: true,
            paged: true,
        }
    }
}

/// Cooperative cancellation flag, checked between batches. Rows already
/// written stay written; there is no rollback.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BridgeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

/// Final report for one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferReport {
    pub job_id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,

    /// Destination file name or table name, when the job got far enough to
    /// resolve one.
    pub destination: Option<String>,

    pub rows_transferred: u64,
    pub warnings: Vec<String>,
    pub error: Option<ErrorDetail>,
}

/// One transfer job. Created Pending, mutated as batches complete, terminal
/// once Succeeded or Failed.
pub struct TransferJob {
    pub id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub destination: Option<String>,
    pub rows_transferred: u64,
    pub warnings: Vec<String>,
    pub error: Option<ErrorDetail>,
}

impl TransferJob {
    pub(crate) fn new(direction: TransferDirection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            status: TransferStatus::Pending,
            destination: None,
            rows_transferred: 0,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn start(&mut self) {
        if self.status == TransferStatus::Pending {
            self.status = TransferStatus::Running;
        }
    }

    pub(crate) fn succeed(&mut self) {
        self.status = TransferStatus::Succeeded;
    }

    pub(crate) fn fail(&mut self, error: &BridgeError) {
        self.status = TransferStatus::Failed;
        self.error = Some(ErrorDetail {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    pub(crate) fn report(self) -> TransferReport {
        TransferReport {
            job_id: self.id,
            direction: self.direction,
            status: self.status,
            destination: self.destination,
            rows_transferred: self.rows_transferred,
            warnings: self.warnings,
            error: self.error,
        }
    }
}

/// Deterministic destination name for an export.
pub fn export_filename(table: &str, format: FileFormat) -> String {
    format!(
        "export_{}_{}.{}",
        table,
        Utc::now().format(TIMESTAMP_FORMAT),
        format.extension()
    )
}

/// Deterministic table name for an import without an explicit target.
/// Second-resolution timestamps mean concurrent jobs within the same second
/// collide; callers needing more than that must name the table themselves.
pub fn generated_table_name() -> String {
    format!("imported_{}", Utc::now().format(TIMESTAMP_FORMAT))
}

fn create_table_sql(table: &str, descriptors: &[ColumnDescriptor]) -> String {
    let columns = descriptors
        .iter()
        .map(|d| format!("{} String", quote_identifier(&d.name)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = MergeTree() ORDER BY tuple()",
        quote_identifier(table),
        columns
    )
}

/// Coordinates single transfer jobs. Each job owns its client for its whole
/// lifetime; nothing is shared between jobs.
pub struct TransferOrchestrator {
    options: TransferOptions,
}

impl TransferOrchestrator {
    pub fn new(options: TransferOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Streams a store table (optionally a column subset) into a new file
    /// under `output_dir`.
    pub async fn store_to_file(
        &self,
        client: &dyn StoreClient,
        table: &str,
        columns: &[String],
        format: FileFormat,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> TransferReport {
        let mut job = TransferJob::new(TransferDirection::StoreToFile);
        info!(job_id = %job.id, table, "starting store-to-file transfer");
        match self
            .run_store_to_file(client, table, columns, format, output_dir, cancel, &mut job)
            .await
        {
            Ok(()) => job.succeed(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "transfer failed");
                job.fail(&e);
            }
        }
        job.report()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_store_to_file(
        &self,
        client: &dyn StoreClient,
        table: &str,
        columns: &[String],
        format: FileFormat,
        output_dir: &Path,
        cancel: &CancelToken,
        job: &mut TransferJob,
    ) -> Result<()> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }

        if !columns.is_empty() {
            self.check_column_subset(client, table, columns).await?;
        }

        let select_list = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!("SELECT {} FROM {}", select_list, quote_identifier(table));

        let filename = export_filename(table, format);
        let path = output_dir.join(&filename);
        job.destination = Some(filename);

        let mut reader = StoreBatchReader::new(client, sql, self.options.batch_size, self.options.paged);
        let mut writer: Option<FileBatchWriter> = None;

        job.start();
        loop {
            cancel.checkpoint()?;
            let batch = reader.next_batch().await?;

            if writer.is_none() {
                let meta = reader.columns().ok_or_else(|| {
                    BridgeError::Query("store returned no column metadata".to_string())
                })?;
                let (descriptors, warnings) = descriptors_from_meta(meta);
                job.warnings.extend(warnings);
                writer = Some(FileBatchWriter::create(&path, format, descriptors)?);
            }

            let Some(batch) = batch else {
                break;
            };
            writer.as_mut().unwrap().write_batch(&batch)?;
            job.rows_transferred += batch.len() as u64;
        }

        if let Some(writer) = writer {
            writer.finish()?;
        }
        info!(job_id = %job.id, rows = job.rows_transferred, "export complete");
        Ok(())
    }

    async fn check_column_subset(
        &self,
        client: &dyn StoreClient,
        table: &str,
        columns: &[String],
    ) -> Result<()> {
        let described = client
            .query(&format!("DESCRIBE TABLE {}", quote_identifier(table)))
            .await?;
        let known: Vec<String> = described
            .rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|cell| cell.as_str().map(|s| s.to_string()))
            .collect();
        for column in columns {
            if !known.contains(column) {
                return Err(BridgeError::SchemaMismatch(format!(
                    "column '{}' does not exist on table '{}'",
                    column, table
                )));
            }
        }
        Ok(())
    }

    /// Streams an uploaded file into a store table, creating the table with
    /// all-String columns when it does not exist yet.
    pub async fn file_to_store(
        &self,
        client: &dyn StoreClient,
        filename: &str,
        content: &[u8],
        table: Option<String>,
        columns: &[String],
        cancel: &CancelToken,
    ) -> TransferReport {
        let mut job = TransferJob::new(TransferDirection::FileToStore);
        info!(job_id = %job.id, filename, "starting file-to-store transfer");
        match self
            .run_file_to_store(client, filename, content, table, columns, cancel, &mut job)
            .await
        {
            Ok(()) => job.succeed(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "transfer failed");
                job.fail(&e);
            }
        }
        job.report()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_file_to_store(
        &self,
        client: &dyn StoreClient,
        filename: &str,
        content: &[u8],
        table: Option<String>,
        columns: &[String],
        cancel: &CancelToken,
        job: &mut TransferJob,
    ) -> Result<()> {
        let format = FileFormat::from_filename(filename)?;

        let inference = InferenceOptions {
            sample_rows: self.options.sample_rows,
            nullable: self.options.nullable,
        };

        let mut reader = match format {
            FileFormat::Csv => {
                let inferred = infer_from_csv(content, &inference)?;
                let descriptors = select_columns(inferred, columns)?;
                FileBatchReader::csv(
                    content.to_vec(),
                    descriptors,
                    self.options.batch_size,
                    self.options.nullable,
                )?
            }
            FileFormat::Json => {
                let records: Vec<Value> = serde_json::from_slice(content)
                    .map_err(|e| BridgeError::Validation(format!("invalid JSON file: {}", e)))?;
                let inferred = infer_from_json(&records, &inference)?;
                let descriptors = select_columns(inferred, columns)?;
                FileBatchReader::json(
                    records,
                    descriptors,
                    self.options.batch_size,
                    self.options.nullable,
                )
            }
        };

        let table = match table {
            Some(name) => {
                validate_identifier(&name)?;
                name
            }
            None => generated_table_name(),
        };
        job.destination = Some(table.clone());

        let column_names: Vec<String> = reader
            .descriptors()
            .iter()
            .map(|d| d.name.clone())
            .collect();

        job.start();
        let mut table_created = false;
        while let Some(batch) = {
            cancel.checkpoint()?;
            reader.next_batch()?
        } {
            if !table_created {
                client
                    .execute(&create_table_sql(&table, reader.descriptors()))
                    .await?;
                table_created = true;
            }
            let written = write_store_batch(client, &table, &column_names, &batch).await?;
            job.rows_transferred += written;
        }

        info!(job_id = %job.id, rows = job.rows_transferred, table = %table, "import complete");
        Ok(())
    }
}

impl Default for TransferOrchestrator {
    fn default() -> Self {
        Self::new(TransferOptions::default())
    }
}

/// Projects inferred descriptors onto a requested subset, in request order.
/// Unknown names are a schema mismatch.
fn select_columns(
    inferred: Vec<ColumnDescriptor>,
    columns: &[String],
) -> Result<Vec<ColumnDescriptor>> {
    if columns.is_empty() {
        return Ok(inferred);
    }
    columns
        .iter()
        .map(|name| {
            inferred
                .iter()
                .find(|d| &d.name == name)
                .cloned()
                .ok_or_else(|| {
                    BridgeError::SchemaMismatch(format!(
                        "selected column '{}' not present in the uploaded file",
                        name
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SemanticType;
    use regex::Regex;

    #[test]
    fn test_export_filename_shape() {
        let name = export_filename("trips", FileFormat::Csv);
        let re = Regex::new(r"^export_trips_\d{8}_\d{6}\.csv$").unwrap();
        assert!(re.is_match(&name), "unexpected filename: {}", name);
    }

    #[test]
    fn test_generated_table_name_shape() {
        let name = generated_table_name();
        let re = Regex::new(r"^imported_\d{8}_\d{6}$").unwrap();
        assert!(re.is_match(&name), "unexpected table name: {}", name);
    }

    #[test]
    fn test_create_table_sql_all_string() {
        let descriptors = vec![
            ColumnDescriptor::new("id", SemanticType::Int64),
            ColumnDescriptor::new("name", SemanticType::String),
        ];
        assert_eq!(
            create_table_sql("imports", &descriptors),
            "CREATE TABLE IF NOT EXISTS `imports` (`id` String, `name` String) \
             ENGINE = MergeTree() ORDER BY tuple()"
        );
    }

    #[test]
    fn test_select_columns_subset_and_order() {
        let inferred = vec![
            ColumnDescriptor::new("a", SemanticType::Int64),
            ColumnDescriptor::new("b", SemanticType::String),
            ColumnDescriptor::new("c", SemanticType::Bool),
        ];
        let picked =
            select_columns(inferred.clone(), &["c".to_string(), "a".to_string()]).unwrap();
        let names: Vec<&str> = picked.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a"]);

        let err = select_columns(inferred, &["missing".to_string()]).unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
