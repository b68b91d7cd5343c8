//! Configuration loader
//!
//! Loads node configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. First, attempts to load from environment variables
//! 2. If `CLINISYNC_DB_PATH` is unset, falls back to loading from file
//! 3. Probes multiple paths for config files
//! 4. Supports JSON and TOML formats
//!
//! Every loaded configuration is checked by [`validate`].
//!
//! ## Environment Variables
//! - `CLINISYNC_DB_PATH`: Node database file path (required)
//! - `CLINISYNC_DB_POOL_SIZE`: Connection pool size
//! - `CLINISYNC_DB_ENCRYPTION_KEY`: Node database SQLCipher key
//! - `CLINISYNC_NODE_ROLE`: `peripheral` or `central`
//! - `CLINISYNC_NODE_ID`: Consumer identity recorded on broker leases
//! - `CLINISYNC_TENANT_ID`: Clinic tenant of a peripheral node
//! - `CLINISYNC_BROKER_PATH`: Shared broker database path
//! - `CLINISYNC_BROKER_ENCRYPTION_KEY`: Broker SQLCipher key
//! - `CLINISYNC_BROKER_MAX_DELIVERIES`: Deliveries before dead-lettering
//! - `CLINISYNC_BROKER_LEASE_SECS`: Delivery lease duration
//! - `CLINISYNC_RECONCILIATION_ENABLED`: Whether stale rows are resent
//! - `CLINISYNC_RECONCILIATION_CRON`: Six-field cron expression
//! - `CLINISYNC_RECONCILIATION_STALE_AFTER_SECS`: Staleness window
//! - `CLINISYNC_RECONCILIATION_MAX_ATTEMPTS`: Failures before a row is no longer resent
//! - `CLINISYNC_LOG_LEVEL`: `EnvFilter` directive when `RUST_LOG` is unset
//! - `CLINISYNC_LOG_JSON`: Emit JSON log lines (true/false)
//!
//! Unset optional variables keep their defaults.
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./config.{json,toml}` and `./clinisync.{json,toml}`
//! 2. `../config.{json,toml}` and `../../config.{json,toml}`
//! 3. The same names relative to the executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;

use clinisync_domain::{ClinisyncError, Config, NodeRole, Result};
use uuid::Uuid;

/// Load configuration with automatic fallback strategy
///
/// # Errors
/// Returns `ClinisyncError::Config` if neither source yields a valid
/// configuration.
pub fn load() -> Result<Config> {
    let config = match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            config
        }
        Err(e) => {
            tracing::debug!(error = ?e, "Failed to load from environment, trying file");
            load_from_file(None)?
        }
    };
    validate(&config)?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// # Errors
/// Returns `ClinisyncError::Config` if `CLINISYNC_DB_PATH` is missing or a
/// set variable has an invalid value.
pub fn load_from_env() -> Result<Config> {
    let mut config = Config::default();

    config.database.path = env_var("CLINISYNC_DB_PATH")?;
    if let Some(pool_size) = env_parse::<u32>("CLINISYNC_DB_POOL_SIZE")? {
        config.database.pool_size = pool_size;
    }
    config.database.encryption_key = env_opt("CLINISYNC_DB_ENCRYPTION_KEY");

    if let Some(role) = env_parse::<NodeRole>("CLINISYNC_NODE_ROLE")? {
        config.node.role = role;
    }
    if let Some(node_id) = env_opt("CLINISYNC_NODE_ID") {
        config.node.node_id = node_id;
    }
    config.node.tenant_id = env_parse::<Uuid>("CLINISYNC_TENANT_ID")?;

    if let Some(path) = env_opt("CLINISYNC_BROKER_PATH") {
        config.broker.path = path;
    }
    config.broker.encryption_key = env_opt("CLINISYNC_BROKER_ENCRYPTION_KEY");
    if let Some(max_deliveries) = env_parse::<u32>("CLINISYNC_BROKER_MAX_DELIVERIES")? {
        config.broker.max_deliveries = max_deliveries;
    }
    if let Some(lease_secs) = env_parse::<u64>("CLINISYNC_BROKER_LEASE_SECS")? {
        config.broker.lease_secs = lease_secs;
    }

    config.reconciliation.enabled =
        env_bool("CLINISYNC_RECONCILIATION_ENABLED", config.reconciliation.enabled);
    if let Some(cron) = env_opt("CLINISYNC_RECONCILIATION_CRON") {
        config.reconciliation.cron_expression = cron;
    }
    if let Some(stale_after) = env_parse::<u64>("CLINISYNC_RECONCILIATION_STALE_AFTER_SECS")? {
        config.reconciliation.stale_after_secs = stale_after;
    }
    if let Some(max_attempts) = env_parse::<u32>("CLINISYNC_RECONCILIATION_MAX_ATTEMPTS")? {
        config.reconciliation.max_attempts = max_attempts;
    }

    if let Some(level) = env_opt("CLINISYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    config.logging.json = env_bool("CLINISYNC_LOG_JSON", config.logging.json);

    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes multiple locations for config files.
///
/// # Errors
/// Returns `ClinisyncError::Config` if the file is missing, unreadable or
/// not valid JSON/TOML.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(ClinisyncError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            ClinisyncError::Config(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| ClinisyncError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

/// Reject configurations a node cannot run with.
///
/// # Errors
/// Returns `ClinisyncError::Config` naming the first offending field.
pub fn validate(config: &Config) -> Result<()> {
    if config.database.path.trim().is_empty() {
        return Err(ClinisyncError::Config("database.path must not be empty".into()));
    }
    if config.broker.path.trim().is_empty() {
        return Err(ClinisyncError::Config("broker.path must not be empty".into()));
    }
    if config.database.pool_size == 0 || config.broker.pool_size == 0 {
        return Err(ClinisyncError::Config("pool_size must be at least 1".into()));
    }
    if config.broker.max_deliveries == 0 {
        return Err(ClinisyncError::Config("broker.max_deliveries must be at least 1".into()));
    }
    if config.reconciliation.enabled && config.reconciliation.max_attempts == 0 {
        return Err(ClinisyncError::Config(
            "reconciliation.max_attempts must be at least 1".into(),
        ));
    }
    if config.node.node_id.trim().is_empty() {
        return Err(ClinisyncError::Config("node.node_id must not be empty".into()));
    }
    if config.node.role == NodeRole::Peripheral && config.node.tenant_id.is_none() {
        return Err(ClinisyncError::Config("a peripheral node requires node.tenant_id".into()));
    }
    Ok(())
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| ClinisyncError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| ClinisyncError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(ClinisyncError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe multiple paths for configuration files
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut candidates = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        candidates.extend(candidates_in(&cwd));
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.extend(candidates_in(exe_dir));
        }
    }

    candidates.into_iter().find(|path| path.exists())
}

fn candidates_in(dir: &Path) -> Vec<PathBuf> {
    vec![
        dir.join("config.json"),
        dir.join("config.toml"),
        dir.join("clinisync.json"),
        dir.join("clinisync.toml"),
        dir.join("../config.json"),
        dir.join("../config.toml"),
        dir.join("../../config.json"),
        dir.join("../../config.toml"),
    ]
}

/// Get required environment variable
fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        ClinisyncError::Config(format!("Missing required environment variable: {key}"))
    })
}

/// Optional variable; blank counts as unset.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_opt(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ClinisyncError::Config(format!("Invalid value for {key}: {e}")))
        })
        .transpose()
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
