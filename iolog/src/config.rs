//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: IOLOG_, nested keys separated by `__`)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/iolog/{service_name}/config.toml
//! 4. System directory: /etc/iolog/{service_name}/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Audit trail configuration
    #[serde(default)]
    pub iologger: IoLoggerConfig,

    /// Database configuration for the audit store (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// NATS configuration (optional)
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name, recorded as the source application of every audit record
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error) or a full `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Audit trail configuration
///
/// Loaded from the `[iologger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoLoggerConfig {
    /// Enable the HTTP interceptor (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Header carrying the trace id (matched case-insensitively)
    #[serde(default = "default_trace_header")]
    pub trace_header: String,

    /// Routes that pass through without being audited
    ///
    /// Response bodies are buffered before they reach the client, except
    /// `text/event-stream`. Long downloads and other streamed bodies belong here.
    #[serde(default = "default_excluded_routes")]
    pub excluded_routes: Vec<String>,

    /// Replace values of credential-bearing headers before they are stored
    #[serde(default = "default_true")]
    pub mask_sensitive_headers: bool,

    /// Largest request body that will be buffered, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Read request bodies in an outer layer, ahead of every other layer
    #[serde(default)]
    pub eager_body: bool,

    /// Convert handler panics into 500 responses inside the audit layer
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Upper bound on records kept by the in-memory store (unbounded when unset)
    #[serde(default)]
    pub memory_capacity: Option<usize>,
}

impl Default for IoLoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trace_header: default_trace_header(),
            excluded_routes: default_excluded_routes(),
            mask_sensitive_headers: true,
            max_body_bytes: default_max_body_bytes(),
            eager_body: false,
            catch_panic: true,
            memory_capacity: None,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl DatabaseConfig {
    /// Connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Connection name
    #[serde(default)]
    pub name: Option<String>,

    /// Max reconnection attempts
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,

    /// Maximum retry attempts for initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "unknown-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_true() -> bool {
    true
}

fn default_trace_header() -> String {
    crate::correlation::TRACE_ID_HEADER.to_string()
}

fn default_excluded_routes() -> Vec<String> {
    vec![
        "/health".to_string(),
        "/ready".to_string(),
        "/metrics".to_string(),
    ]
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_reconnects() -> usize {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

impl Config {
    /// Load configuration for the running binary
    ///
    /// The service name used for file lookup is inferred from the executable name.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(default_service_name);

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so that higher priority files override
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("IOLOG_").split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// Bypasses the XDG and system directories. Environment variables still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IOLOG_").split("__"))
            .extract()?;

        Ok(config)
    }

    /// Candidate config file paths, highest priority first
    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.toml")];

        let xdg_dirs = xdg::BaseDirectories::with_prefix("iolog");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Some(path) = xdg_dirs.find_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/iolog")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    /// Name recorded as `source_application` on audit records
    pub fn source_application(&self) -> &str {
        &self.service.name
    }

    /// Get database URL
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }

    /// Get NATS URL
    pub fn nats_url(&self) -> Option<&str> {
        self.nats.as_ref().map(|n| n.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: default_service_name(),
                log_level: default_log_level(),
                environment: default_environment(),
            },
            iologger: IoLoggerConfig::default(),
            database: None,
            nats: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.name, "unknown-service");
        assert_eq!(config.service.log_level, "info");
        assert!(config.iologger.enabled);
        assert_eq!(config.iologger.trace_header, "traceId");
        assert!(config.iologger.mask_sensitive_headers);
        assert!(config.iologger.catch_panic);
        assert!(!config.iologger.eager_body);
        assert_eq!(
            config.iologger.excluded_routes,
            vec!["/health", "/ready", "/metrics"]
        );
        assert!(config.database_url().is_none());
        assert!(config.nats_url().is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "account-service"

[iologger]
excluded_routes = ["/internal/*"]
max_body_bytes = 1024

[nats]
url = "nats://localhost:4222"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.source_application(), "account-service");
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.iologger.excluded_routes, vec!["/internal/*"]);
        assert_eq!(config.iologger.max_body_bytes, 1024);
        assert!(config.iologger.enabled);
        assert_eq!(config.nats_url(), Some("nats://localhost:4222"));
        assert_eq!(config.nats.unwrap().max_reconnects, 10);
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/iolog/config.toml").unwrap();
        assert_eq!(config.service.name, "unknown-service");
    }
}
