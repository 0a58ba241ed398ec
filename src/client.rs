//! Store client adapter - ClickHouse over its HTTP interface.
//!
//! Reads use `FORMAT JSONCompact` (column metadata plus positional rows),
//! bulk writes use `FORMAT JSONCompactEachRow` bodies. The session is scoped
//! to the client value; dropping it releases the underlying HTTP pool.

use crate::connection::ConnectionSpec;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    static ref IDENTIFIER_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Rejects anything that is not a plain identifier before it is interpolated
/// into SQL.
pub fn validate_identifier(name: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(BridgeError::Validation(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

/// Backtick-quotes a previously validated identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name)
}

/// One result-set column as reported by the store.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub native_type: String,
}

/// A fully materialized query result: column metadata plus positional rows.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

/// Seam between the transfer pipeline and the store. Production code uses
/// [`HttpStoreClient`]; tests substitute a scripted double.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Executes a row-returning statement and materializes the full result.
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Executes a row-returning statement windowed to `limit` rows starting
    /// at `offset`. This is the cursor the batched reader advances.
    async fn query_page(&self, sql: &str, limit: usize, offset: usize) -> Result<QueryResult>;

    /// Executes DDL/DML. Returns the affected-row count when the store
    /// reports one, otherwise 0.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Performs one bulk insert. Either the whole batch is applied or the
    /// call fails; no partial-row guarantee is made here.
    async fn insert_rows(&self, table: &str, columns: &[String], rows: &[Vec<Value>])
        -> Result<u64>;
}

#[derive(Deserialize)]
struct JsonCompactBody {
    meta: Vec<ColumnMeta>,
    data: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct QuerySummary {
    #[serde(default)]
    written_rows: Option<String>,
}

/// ClickHouse client speaking the HTTP interface. Whether the channel is
/// encrypted is decided by the port alone (see [`ConnectionSpec`]).
pub struct HttpStoreClient {
    spec: ConnectionSpec,
    base_url: String,
    http: reqwest::Client,
}

impl HttpStoreClient {
    /// Builds a client without touching the network.
    pub fn new(spec: ConnectionSpec) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| BridgeError::Connection(format!("failed to build HTTP client: {}", e)))?;
        let base_url = spec.base_url();
        Ok(Self {
            spec,
            base_url,
            http,
        })
    }

    /// Opens a client and probes the store with `SELECT 1`.
    pub async fn connect(spec: ConnectionSpec) -> Result<Self> {
        let client = Self::new(spec)?;
        client
            .query("SELECT 1")
            .await
            .map_err(|e| BridgeError::Connection(format!("connection probe failed: {}", e)))?;
        Ok(client)
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, sql: String, body: Option<String>) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(&self.base_url)
            .query(&[("database", self.spec.database.as_str())])
            .header("X-ClickHouse-User", &self.spec.user)
            .header("X-ClickHouse-Key", &self.spec.credential);

        request = match body {
            // Statement goes in the query string so the body can carry rows.
            Some(rows) => request.query(&[("query", sql.as_str())]).body(rows),
            None => request.body(sql),
        };

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Connection(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BridgeError::Query(format!(
                "store returned {}: {}",
                status,
                detail.trim()
            )));
        }
        Ok(response)
    }

    fn written_rows(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get("x-clickhouse-summary")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str::<QuerySummary>(v).ok())
            .and_then(|s| s.written_rows)
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    async fn query(&self, sql: &str) -> Result<QueryResult> {
        debug!(sql, "store query");
        let response = self
            .send(format!("{} FORMAT JSONCompact", sql), None)
            .await?;
        let body: JsonCompactBody = response
            .json()
            .await
            .map_err(|e| BridgeError::Query(format!("malformed result payload: {}", e)))?;
        Ok(QueryResult {
            columns: body.meta,
            rows: body.data,
        })
    }

    async fn query_page(&self, sql: &str, limit: usize, offset: usize) -> Result<QueryResult> {
        self.query(&format!("{} LIMIT {} OFFSET {}", sql, limit, offset))
            .await
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "store execute");
        let response = self.send(sql.to_string(), None).await?;
        Ok(Self::written_rows(&response))
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        validate_identifier(table)?;
        for column in columns {
            validate_identifier(column)?;
        }

        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "INSERT INTO {} ({}) FORMAT JSONCompactEachRow",
            quote_identifier(table),
            column_list
        );

        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        let response = self
            .send(statement, Some(body))
            .await
            .map_err(|e| BridgeError::Insert(e.to_string()))?;
        let written = Self::written_rows(&response);
        Ok(if written > 0 { written } else { rows.len() as u64 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16) -> ConnectionSpec {
        ConnectionSpec {
            host: "ch.example.com".to_string(),
            port,
            database: "analytics".to_string(),
            user: "reader".to_string(),
            credential: "token".to_string(),
        }
    }

    #[test]
    fn test_secure_port_selects_encrypted_channel() {
        let client = HttpStoreClient::new(spec(9440)).unwrap();
        assert!(client.base_url().starts_with("https://"));
        let client = HttpStoreClient::new(spec(8443)).unwrap();
        assert!(client.base_url().starts_with("https://"));
    }

    #[test]
    fn test_plain_port_selects_plaintext_channel() {
        let client = HttpStoreClient::new(spec(8123)).unwrap();
        assert!(client.base_url().starts_with("http://"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("trips_2024").is_ok());
        assert!(validate_identifier("_internal").is_ok());
        assert!(validate_identifier("1bad").is_err());
        assert!(validate_identifier("drop table;--").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("trips"), "`trips`");
    }
}
