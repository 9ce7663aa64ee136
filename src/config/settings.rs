//! Broadcaster settings read from the YAML configuration file

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{AccountingOptions, LabelPolicy, PricingConfig, DEFAULT_EXCLUDED_IMAGE_PREFIXES};

/// Longest advertisement lifetime accepted, one week
pub const MAX_ADVERTISEMENT_TTL_SECS: u64 = 7 * 24 * 3600;

/// Shortest token lifetime the TokenRequest API grants
pub const MIN_CREDENTIAL_TTL_SECS: u64 = 600;

/// Everything tunable about advertisement generation
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcasterConfig {
    /// Share of allocatable capacity offered to the peer (0-100)
    #[serde(default = "default_sharing_percentage")]
    pub sharing_percentage: u8,

    /// Applied in order; see [`crate::cluster::labels`]
    #[serde(default)]
    pub label_policies: Vec<LabelPolicy>,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default = "default_excluded_image_prefixes")]
    pub excluded_image_prefixes: Vec<String>,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Periods and retry budgets, all in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    #[serde(default = "default_tick_period")]
    pub tick_period_secs: u64,

    /// Pause before retrying a failed tick
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    #[serde(default = "default_advertisement_ttl")]
    pub advertisement_ttl_secs: u64,

    /// Lifetime requested for the token in the credential handed to the
    /// peer; the credential is re-minted every tick
    #[serde(default = "default_credential_ttl")]
    pub credential_ttl_secs: u64,

    #[serde(default = "default_bootstrap_attempts")]
    pub bootstrap_attempts: u32,

    #[serde(default = "default_bootstrap_pause")]
    pub bootstrap_pause_secs: u64,

    /// Poll period of the remote advertisement watcher
    #[serde(default = "default_watch_poll")]
    pub watch_poll_secs: u64,

    /// How often the configuration file is re-read
    #[serde(default = "default_config_reload")]
    pub config_reload_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_period_secs: default_tick_period(),
            retry_backoff_secs: default_retry_backoff(),
            advertisement_ttl_secs: default_advertisement_ttl(),
            credential_ttl_secs: default_credential_ttl(),
            bootstrap_attempts: default_bootstrap_attempts(),
            bootstrap_pause_secs: default_bootstrap_pause(),
            watch_poll_secs: default_watch_poll(),
            config_reload_secs: default_config_reload(),
        }
    }
}

impl TimingConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_period_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    /// Clamped to [`MAX_ADVERTISEMENT_TTL_SECS`]
    pub fn advertisement_ttl(&self) -> chrono::Duration {
        let secs = self.advertisement_ttl_secs.min(MAX_ADVERTISEMENT_TTL_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn bootstrap_pause(&self) -> Duration {
        Duration::from_secs(self.bootstrap_pause_secs)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_secs(self.watch_poll_secs)
    }

    pub fn config_reload(&self) -> Duration {
        Duration::from_secs(self.config_reload_secs)
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            sharing_percentage: default_sharing_percentage(),
            label_policies: Vec::new(),
            pricing: PricingConfig::default(),
            excluded_image_prefixes: default_excluded_image_prefixes(),
            timing: TimingConfig::default(),
        }
    }
}

impl BroadcasterConfig {
    pub fn accounting_options(&self) -> AccountingOptions {
        AccountingOptions {
            sharing_percentage: self.sharing_percentage,
            excluded_image_prefixes: self.excluded_image_prefixes.clone(),
        }
    }
}

/// Where the foreign cluster reaches this cluster's API server
///
/// Written into the kubeconfig minted for the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiServerConfig {
    pub address: String,
    pub port: u16,
    /// The server certificate chains to a public CA, so no CA bundle is sent
    pub trusted_ca: bool,
}

impl ApiServerConfig {
    pub fn url(&self) -> String {
        if self.address.starts_with("https://") || self.address.starts_with("http://") {
            format!("{}:{}", self.address.trim_end_matches('/'), self.port)
        } else {
            format!("https://{}:{}", self.address, self.port)
        }
    }
}

// Default value functions
fn default_sharing_percentage() -> u8 {
    50
}

// 10 minutes
fn default_tick_period() -> u64 {
    600
}

fn default_retry_backoff() -> u64 {
    60
}

// 30 minutes
fn default_advertisement_ttl() -> u64 {
    1800
}

// 1 hour
fn default_credential_ttl() -> u64 {
    3600
}

fn default_bootstrap_attempts() -> u32 {
    3
}

fn default_bootstrap_pause() -> u64 {
    60
}

fn default_watch_poll() -> u64 {
    30
}

fn default_config_reload() -> u64 {
    60
}

fn default_excluded_image_prefixes() -> Vec<String> {
    DEFAULT_EXCLUDED_IMAGE_PREFIXES
        .iter()
        .map(|s| s.to_string())
        .collect()
}
