use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Insert error: {0}")]
    Insert(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BridgeError {
    /// Machine-readable kind tag carried in failure responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Connection(_) => "connection_error",
            BridgeError::Query(_) => "query_error",
            BridgeError::UnsupportedFormat(_) => "unsupported_format",
            BridgeError::SchemaMismatch(_) => "schema_mismatch",
            BridgeError::Insert(_) => "insert_error",
            BridgeError::Validation(_) => "validation_error",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Io(_) => "io_error",
            BridgeError::Json(_) => "json_error",
            BridgeError::Csv(_) => "csv_error",
            BridgeError::Http(_) => "connection_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
