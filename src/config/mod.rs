//! # Configuration
//!
//! Tunables live in a YAML file; every field has a default so the file is
//! optional. Startup flags and environment values are handled by
//! [`crate::cli`] and never read here.
//!
//! The file is re-read on an interval by [`spawn_config_reloader`]; the
//! control loop picks up the newest valid version at the start of each tick.

pub mod settings;
pub mod validation;

pub use settings::{ApiServerConfig, BroadcasterConfig, TimingConfig};
pub use validation::{validate_cluster_id, validate_config};

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid cluster id '{0}': must be a lowercase DNS label of at most 53 characters")]
    InvalidClusterId(String),
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Parse and validate a YAML document; an empty document yields the defaults
pub fn parse_config(content: &str) -> Result<BroadcasterConfig, ConfigError> {
    let config = if content.trim().is_empty() {
        BroadcasterConfig::default()
    } else {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
    };
    validate_config(&config)?;
    Ok(config)
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Expand `~` and environment variables in a user supplied path
pub fn expand_path(path: &str) -> PathBuf {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.into_owned()))
        .unwrap_or_else(|_| PathBuf::from(path))
}

pub fn load_config_file(path: &Path) -> Result<BroadcasterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&content)
}

/// Load the file if one was given, otherwise use the defaults
pub fn load_or_default(path: Option<&Path>) -> Result<BroadcasterConfig, ConfigError> {
    match path {
        Some(path) => load_config_file(path),
        None => Ok(BroadcasterConfig::default()),
    }
}

/// Re-read `path` every `interval` and publish changed, valid configurations
///
/// An unreadable or invalid file keeps the previous configuration in place.
pub fn spawn_config_reloader(
    path: PathBuf,
    interval: Duration,
    tx: watch::Sender<BroadcasterConfig>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; the file was just loaded at startup
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Config reloader stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match load_config_file(&path) {
                Ok(config) => {
                    let changed = tx.send_if_modified(|current| {
                        if *current == config {
                            return false;
                        }
                        *current = config;
                        true
                    });
                    if changed {
                        info!("Reloaded configuration from {}", path.display());
                    }
                }
                Err(e) => warn!("Keeping previous configuration: {}", e),
            }
        }
    })
}
