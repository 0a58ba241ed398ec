//! Request/response surface for the HTTP server.
//!
//! Handlers parse wire DTOs, open a client scoped to the request, run the
//! pipeline, and fold every failure into one uniform error body carrying a
//! kind tag and a human-readable message.

use crate::batch::FileFormat;
use crate::client::{quote_identifier, validate_identifier, HttpStoreClient, StoreClient};
use crate::connection::ConnectionSpec;
use crate::error::{BridgeError, Result};
use crate::join::{JoinPlanner, JoinSpec};
use crate::transfer::{CancelToken, TransferOrchestrator, TransferReport, TransferStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

/// Export request: connection fields plus table/column selection.
#[derive(Debug, Deserialize)]
pub struct StoreToFileRequest {
    #[serde(flatten)]
    pub connection: ConnectionSpec,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_format")]
    pub file_format: String,
}

fn default_format() -> String {
    "csv".to_string()
}

/// Import request: connection fields plus the uploaded file.
#[derive(Debug, Deserialize)]
pub struct FileToStoreRequest {
    #[serde(flatten)]
    pub connection: ConnectionSpec,
    pub filename: String,
    pub content: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Join-export request: connection fields plus the ordered join spec.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    #[serde(flatten)]
    pub connection: ConnectionSpec,
    pub tables: Vec<String>,
    #[serde(default)]
    pub join_conditions: Vec<String>,
}

/// HTTP status code plus JSON body, ready for the server to serialize.
#[derive(Debug)]
pub struct ApiResponse {
    pub code: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self { code: 200, body }
    }

    fn error(error: &BridgeError) -> Self {
        Self {
            code: 400,
            body: json!({
                "status": "error",
                "kind": error.kind(),
                "message": error.to_string(),
            }),
        }
    }
}

/// Folds a finished transfer report into the wire shape. `destination_key`
/// names the report's destination field on the wire ("filename" or "table").
fn report_response(report: &TransferReport, destination_key: &str) -> ApiResponse {
    match report.status {
        TransferStatus::Succeeded => ApiResponse::ok(json!({
            "status": "success",
            destination_key: report.destination,
            "record_count": report.rows_transferred,
            "warnings": report.warnings,
        })),
        _ => {
            let (kind, message) = report
                .error
                .as_ref()
                .map(|e| (e.kind.as_str(), e.message.as_str()))
                .unwrap_or(("query_error", "transfer failed"));
            ApiResponse {
                code: 400,
                body: json!({
                    "status": "error",
                    "kind": kind,
                    "message": message,
                    "record_count": report.rows_transferred,
                }),
            }
        }
    }
}

/// `POST /api/connect` - probes the store with the supplied parameters.
pub async fn handle_connect(spec: ConnectionSpec) -> ApiResponse {
    match HttpStoreClient::connect(spec).await {
        Ok(_) => ApiResponse::ok(json!({
            "status": "success",
            "message": "Connected successfully",
        })),
        Err(e) => ApiResponse::error(&e),
    }
}

/// `POST /api/tables` - lists tables in the connected database.
pub async fn handle_tables(spec: ConnectionSpec) -> ApiResponse {
    match list_tables(spec).await {
        Ok(tables) => ApiResponse::ok(json!({ "tables": tables })),
        Err(e) => ApiResponse::error(&e),
    }
}

async fn list_tables(spec: ConnectionSpec) -> Result<Vec<String>> {
    let client = HttpStoreClient::connect(spec).await?;
    let result = client.query("SHOW TABLES").await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.first())
        .filter_map(|cell| cell.as_str().map(|s| s.to_string()))
        .collect())
}

/// `POST /api/columns?table=..` - lists (name, store-native type) pairs.
pub async fn handle_columns(spec: ConnectionSpec, table: &str) -> ApiResponse {
    match list_columns(spec, table).await {
        Ok(columns) => ApiResponse::ok(json!({ "columns": columns })),
        Err(e) => ApiResponse::error(&e),
    }
}

async fn list_columns(spec: ConnectionSpec, table: &str) -> Result<Vec<Value>> {
    validate_identifier(table)?;
    let client = HttpStoreClient::connect(spec).await?;
    let result = client
        .query(&format!("DESCRIBE TABLE {}", quote_identifier(table)))
        .await?;
    Ok(result
        .rows
        .iter()
        .map(|row| {
            json!({
                "name": row.first().cloned().unwrap_or(Value::Null),
                "type": row.get(1).cloned().unwrap_or(Value::Null),
            })
        })
        .collect())
}

/// `POST /api/ingest/clickhouse-to-file` - exports a table to a flat file.
pub async fn handle_store_to_file(req: StoreToFileRequest, output_dir: &Path) -> ApiResponse {
    let format = match FileFormat::from_name(&req.file_format) {
        Ok(format) => format,
        Err(e) => return ApiResponse::error(&e),
    };
    let client = match HttpStoreClient::connect(req.connection).await {
        Ok(client) => client,
        Err(e) => return ApiResponse::error(&e),
    };

    let orchestrator = TransferOrchestrator::default();
    let report = orchestrator
        .store_to_file(
            &client,
            &req.table,
            &req.columns,
            format,
            output_dir,
            &CancelToken::new(),
        )
        .await;
    report_response(&report, "filename")
}

/// `POST /api/ingest/file-to-clickhouse` - imports an uploaded file into a
/// new or existing table.
pub async fn handle_file_to_store(req: FileToStoreRequest) -> ApiResponse {
    // Reject unsupported extensions before opening a connection.
    if let Err(e) = FileFormat::from_filename(&req.filename) {
        return ApiResponse::error(&e);
    }
    let client = match HttpStoreClient::connect(req.connection).await {
        Ok(client) => client,
        Err(e) => return ApiResponse::error(&e),
    };

    let orchestrator = TransferOrchestrator::default();
    let report = orchestrator
        .file_to_store(
            &client,
            &req.filename,
            req.content.as_bytes(),
            req.table,
            &req.columns,
            &CancelToken::new(),
        )
        .await;
    report_response(&report, "table")
}

/// `POST /api/join-tables` - joins tables in list order and exports to CSV.
pub async fn handle_join(req: JoinRequest, output_dir: &Path) -> ApiResponse {
    let spec = JoinSpec {
        tables: req.tables,
        join_conditions: req.join_conditions,
    };
    // Structural validation happens before any connection is opened.
    if let Err(e) = spec.validate() {
        return ApiResponse::error(&e);
    }
    let client = match HttpStoreClient::connect(req.connection).await {
        Ok(client) => client,
        Err(e) => return ApiResponse::error(&e),
    };

    let planner = JoinPlanner::default();
    let report = planner
        .execute(&client, &spec, output_dir, &CancelToken::new())
        .await;
    report_response(&report, "filename")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{ErrorDetail, TransferDirection};

    #[test]
    fn test_flattened_connection_fields_deserialize() {
        let req: StoreToFileRequest = serde_json::from_str(
            r#"{
                "host": "localhost",
                "port": 8123,
                "database": "default",
                "user": "default",
                "jwt_token": "secret",
                "table": "trips",
                "columns": ["id", "fare"]
            }"#,
        )
        .unwrap();
        assert_eq!(req.connection.host, "localhost");
        assert_eq!(req.connection.credential, "secret");
        assert_eq!(req.file_format, "csv");
        assert_eq!(req.columns, vec!["id", "fare"]);
    }

    #[test]
    fn test_success_report_shape() {
        let report = TransferReport {
            job_id: "j".to_string(),
            direction: TransferDirection::StoreToFile,
            status: TransferStatus::Succeeded,
            destination: Some("export_trips_20240101_000000.csv".to_string()),
            rows_transferred: 42,
            warnings: vec![],
            error: None,
        };
        let response = report_response(&report, "filename");
        assert_eq!(response.code, 200);
        assert_eq!(response.body["status"], "success");
        assert_eq!(response.body["record_count"], 42);
        assert!(response.body["filename"]
            .as_str()
            .unwrap()
            .starts_with("export_trips_"));
    }

    #[test]
    fn test_failure_report_keeps_rows_so_far() {
        let report = TransferReport {
            job_id: "j".to_string(),
            direction: TransferDirection::FileToStore,
            status: TransferStatus::Failed,
            destination: Some("imported_20240101_000000".to_string()),
            rows_transferred: 30_000,
            warnings: vec![],
            error: Some(ErrorDetail {
                kind: "insert_error".to_string(),
                message: "store rejected batch".to_string(),
            }),
        };
        let response = report_response(&report, "table");
        assert_eq!(response.code, 400);
        assert_eq!(response.body["kind"], "insert_error");
        assert_eq!(response.body["record_count"], 30_000);
    }
}
