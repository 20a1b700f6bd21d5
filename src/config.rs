//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub owner: OwnerConfig,
    pub federation: FederationConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain, optionally with port (e.g., "pub.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://pub.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Actor ID for a local username
    ///
    /// Local actors live under `/~{username}`.
    pub fn actor_id(&self, username: &str) -> String {
        format!("{}/~{}", self.base_url(), username)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections
    pub max_connections: u32,
}

/// The site owner's identity, created on first start
#[derive(Debug, Clone, Deserialize)]
pub struct OwnerConfig {
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub image_url: String,
    pub email: String,
    /// Pre-shared API key in `$id.$value` form for the outbox endpoint
    pub api_key: Option<String>,
    /// RSA modulus size used when generating the owner's key pair
    pub key_bits: usize,
}

/// Federation client behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Permit fetching actor documents from loopback/private hosts.
    ///
    /// Only meant for local development and tests.
    pub allow_private_hosts: bool,
    /// Timeout for outbound federation requests
    pub request_timeout_seconds: u64,
    /// How long fetched remote actor documents are reused
    pub actor_cache_ttl_seconds: u64,
    /// Maximum cached remote actors
    pub actor_cache_capacity: usize,
    pub user_agent: String,
}

/// Background job processing
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Start the worker pool together with the HTTP server
    pub enabled: bool,
    /// Concurrent jobs
    pub max_workers: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval_ms: u64,
    /// Attempts before a retrying job is discarded
    pub max_attempts: i64,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    /// A running job whose lease expires is handed out again
    pub lease_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIPOST__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.max_connections", 5)?
            .set_default("owner.key_bits", 2048)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.request_timeout_seconds", 30)?
            .set_default("federation.actor_cache_ttl_seconds", 300)?
            .set_default("federation.actor_cache_capacity", 1000)?
            .set_default("federation.user_agent", "fedipost/0.1.0")?
            .set_default("jobs.enabled", true)?
            .set_default("jobs.max_workers", 10)?
            .set_default("jobs.poll_interval_ms", 1000)?
            .set_default("jobs.max_attempts", 25)?
            .set_default("jobs.backoff_base_seconds", 15)?
            .set_default("jobs.backoff_max_seconds", 21_600)?
            .set_default("jobs.lease_seconds", 300)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEDIPOST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.owner.username.is_empty()
            || self.owner.username.contains(['/', '@', '~'])
        {
            return Err(AppError::Config(
                "owner.username must be non-empty and must not contain '/', '@' or '~'"
                    .to_string(),
            ));
        }

        if let Some(api_key) = &self.owner.api_key {
            match api_key.split_once('.') {
                Some((id, value)) if !id.is_empty() && !value.is_empty() => {}
                _ => {
                    return Err(AppError::Config(
                        "owner.api_key must have the form $id.$value".to_string(),
                    ));
                }
            }
        }

        if self.owner.key_bits < 1024 {
            return Err(AppError::Config(
                "owner.key_bits must be at least 1024".to_string(),
            ));
        }

        if self.jobs.max_workers == 0 {
            return Err(AppError::Config(
                "jobs.max_workers must be greater than 0".to_string(),
            ));
        }

        if self.jobs.max_attempts <= 0 {
            return Err(AppError::Config(
                "jobs.max_attempts must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                tracing::warn!(
                    domain = %self.server.domain,
                    "Serving actor IDs over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("federation.allow_private_hosts is enabled; remote fetches are not SSRF-guarded");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
