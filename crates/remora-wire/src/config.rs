//! Configuration loading.

use crate::tls::{BundledStores, TlsContextBuilder, TlsError};
use crate::transport::TcpConnector;
use remora_types::config::RemoraConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Load configuration from a TOML file, falling back to defaults.
///
/// Any failure to read or parse the file is logged and yields
/// [`RemoraConfig::default`].
pub fn load_config(path: Option<&Path>) -> RemoraConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RemoraConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<RemoraConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                RemoraConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            RemoraConfig::default()
        }
    }
}

/// `~/.remora/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".remora")
        .join("config.toml")
}

/// Build the connector described by `config`.
///
/// With `[tls] enabled`, the TLS context is built here, so store problems
/// surface before any connection attempt. The server name defaults to the
/// configured host.
pub fn connector_from_config(
    config: &RemoraConfig,
    bundled: BundledStores,
) -> Result<TcpConnector, TlsError> {
    let connector = TcpConnector::new(config.connection.address());
    if !config.tls.enabled {
        return Ok(connector);
    }

    let context = TlsContextBuilder::new(config.tls.clone())
        .bundled(bundled)
        .build()?;
    let server_name = config
        .tls
        .server_name
        .clone()
        .unwrap_or_else(|| config.connection.host.clone());
    Ok(connector.with_tls(
        Arc::new(context),
        server_name,
        config.tls.enabled_protocols.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = load_config(Some(Path::new("/definitely/not/here/config.toml")));
        assert_eq!(config, RemoraConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\ntimeout_ms = 250\n\n[tls]\nenabled = true").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.connection.timeout_ms, 250);
        assert_eq!(config.connection.host, "127.0.0.1");
        assert!(config.tls.enabled);
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection\ntimeout_ms = ").unwrap();

        assert_eq!(load_config(Some(file.path())), RemoraConfig::default());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".remora/config.toml"));
    }

    #[test]
    fn test_plain_connector_from_config() {
        let mut config = RemoraConfig::default();
        config.connection.port = 6000;
        let connector = connector_from_config(&config, BundledStores::new()).unwrap();
        assert_eq!(connector.address(), "127.0.0.1:6000");
    }

    #[test]
    fn test_tls_connector_surfaces_store_errors() {
        let mut config = RemoraConfig::default();
        config.tls.enabled = true;
        config.tls.truststore_path = Some("missing-ca.pem".to_string());
        assert!(matches!(
            connector_from_config(&config, BundledStores::new()),
            Err(TlsError::StoreNotFound { .. })
        ));
    }
}
