//! Join planner - builds and executes multi-table join exports.
//!
//! Tables are joined strictly left to right in list order; condition `i`
//! links the accumulated result of tables `0..=i` with table `i + 1`. No
//! reordering or optimization happens here.

use crate::batch::{FileBatchWriter, FileFormat, StoreBatchReader};
use crate::client::{quote_identifier, validate_identifier, StoreClient};
use crate::error::{BridgeError, Result};
use crate::schema::descriptors_from_meta;
use crate::transfer::{CancelToken, TransferDirection, TransferJob, TransferReport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// An ordered multi-table join request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinSpec {
    pub tables: Vec<String>,
    pub join_conditions: Vec<String>,
}

impl JoinSpec {
    /// Rejects structurally invalid specs before any query runs.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(BridgeError::Validation(
                "join requires at least one table".to_string(),
            ));
        }
        if self.join_conditions.len() != self.tables.len() - 1 {
            return Err(BridgeError::Validation(format!(
                "expected {} join conditions for {} tables, got {}",
                self.tables.len() - 1,
                self.tables.len(),
                self.join_conditions.len()
            )));
        }
        for table in &self.tables {
            validate_identifier(table)?;
        }
        Ok(())
    }

    /// Builds the join query left to right, in list order.
    pub fn to_sql(&self) -> Result<String> {
        self.validate()?;
        let mut sql = format!("SELECT * FROM {}", quote_identifier(&self.tables[0]));
        for (table, condition) in self.tables[1..].iter().zip(self.join_conditions.iter()) {
            sql.push_str(&format!(" JOIN {} ON {}", quote_identifier(table), condition));
        }
        Ok(sql)
    }
}

/// Executes a join and streams the result to a CSV file under `output_dir`.
/// Join exports are restricted to CSV.
pub struct JoinPlanner {
    batch_size: usize,
    paged: bool,
}

impl JoinPlanner {
    pub fn new(batch_size: usize, paged: bool) -> Self {
        Self {
            batch_size: batch_size.max(1),
            paged,
        }
    }

    pub async fn execute(
        &self,
        client: &dyn StoreClient,
        spec: &JoinSpec,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> TransferReport {
        let mut job = TransferJob::new(TransferDirection::StoreToFile);
        match self.run(client, spec, output_dir, cancel, &mut job).await {
            Ok(()) => job.succeed(),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "join export failed");
                job.fail(&e);
            }
        }
        job.report()
    }

    async fn run(
        &self,
        client: &dyn StoreClient,
        spec: &JoinSpec,
        output_dir: &Path,
        cancel: &CancelToken,
        job: &mut TransferJob,
    ) -> Result<()> {
        let sql = spec.to_sql()?;
        info!(job_id = %job.id, sql = %sql, "executing join export");

        let filename = format!(
            "joined_export_{}.csv",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = output_dir.join(&filename);
        job.destination = Some(filename);

        let mut reader = StoreBatchReader::new(client, sql, self.batch_size, self.paged);
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
                writer = Some(FileBatchWriter::create(&path, FileFormat::Csv, descriptors)?);
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
        Ok(())
    }
}

impl Default for JoinPlanner {
    fn default() -> Self {
        Self::new(crate::batch::DEFAULT_BATCH_SIZE, true)
    }
}
