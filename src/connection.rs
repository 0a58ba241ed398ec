//! Connection parameters for the ClickHouse store.

use serde::{Deserialize, Serialize};

/// Ports on which the store expects an encrypted channel. Any other port is
/// treated as plaintext; this is the only thing that selects the scheme.
pub const SECURE_PORTS: [u16; 2] = [9440, 8443];

/// Connection parameters supplied with every request. Immutable once a
/// client has been opened from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,

    /// Credential passed through to the store as-is.
    #[serde(rename = "jwt_token")]
    pub credential: String,
}

impl ConnectionSpec {
    pub fn is_secure(&self) -> bool {
        SECURE_PORTS.contains(&self.port)
    }

    pub fn scheme(&self) -> &'static str {
        if self.is_secure() {
            "https"
        } else {
            "http"
        }
    }

    /// Base URL of the store's HTTP interface.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme(), self.host, self.port)
    }
}
