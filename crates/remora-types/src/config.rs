//! Configuration for remoting connections and TLS.
//!
//! Deserialized from TOML. Every field has a default so partial files work:
//!
//! ```toml
//! [connection]
//! host = "10.0.0.5"
//! timeout_ms = 2000
//!
//! [tls]
//! enabled = true
//! truststore_path = "/etc/remora/ca.pem"
//! enabled_protocols = ["TLSv1.3"]
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default blocking-call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default port for remoting connections.
pub const DEFAULT_PORT: u16 = 5445;

/// Default store provider name: PEM files on the local filesystem.
pub const DEFAULT_STORE_PROVIDER: &str = "PEM";

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoraConfig {
    /// Connection parameters.
    pub connection: ConnectionParams,
    /// TLS settings for the secure transport variant.
    pub tls: TlsConfig,
}

/// Parameters of a single remoting connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Default timeout for blocking sends that don't specify their own.
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ConnectionParams {
    /// Default blocking-call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Keystore/truststore material and protocol settings for TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether connections use TLS.
    pub enabled: bool,
    /// Keystore provider (`PEM` or `DER`).
    pub keystore_provider: String,
    /// Keystore location: URL, filesystem path or bundled resource name.
    pub keystore_path: Option<String>,
    /// Keystore password.
    pub keystore_password: Option<String>,
    /// Truststore provider (`PEM` or `DER`).
    pub truststore_provider: String,
    /// Truststore location: URL, filesystem path or bundled resource name.
    pub truststore_path: Option<String>,
    /// Truststore password.
    pub truststore_password: Option<String>,
    /// Protocol versions requested for this configuration. Empty means
    /// "use the process-wide override, else the platform defaults".
    pub enabled_protocols: Vec<String>,
    /// Name to verify the server certificate against. Defaults to the host.
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keystore_provider: DEFAULT_STORE_PROVIDER.to_string(),
            keystore_path: None,
            keystore_password: None,
            truststore_provider: DEFAULT_STORE_PROVIDER.to_string(),
            truststore_path: None,
            truststore_password: None,
            enabled_protocols: Vec::new(),
            server_name: None,
        }
    }
}
