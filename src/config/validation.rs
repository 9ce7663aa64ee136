//! Checks applied to configuration values after they are loaded

use regex::Regex;

use super::settings::{BroadcasterConfig, MAX_ADVERTISEMENT_TTL_SECS, MIN_CREDENTIAL_TTL_SECS};
use super::ConfigError;

/// RFC 1123 label: what Kubernetes accepts in object names
const DNS_LABEL: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$";

/// Cluster ids end up in object names, so they must be valid DNS labels
/// short enough to fit behind the `vk-secret-` prefix.
pub fn validate_cluster_id(cluster_id: &str) -> Result<(), ConfigError> {
    let pattern = Regex::new(DNS_LABEL).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    if cluster_id.is_empty() || cluster_id.len() > 53 || !pattern.is_match(cluster_id) {
        return Err(ConfigError::InvalidClusterId(cluster_id.to_string()));
    }
    Ok(())
}

pub fn validate_config(config: &BroadcasterConfig) -> Result<(), ConfigError> {
    if config.sharing_percentage > 100 {
        return Err(ConfigError::Invalid(format!(
            "sharingPercentage must be between 0 and 100, got {}",
            config.sharing_percentage
        )));
    }

    let timing = &config.timing;
    let durations = [
        ("tickPeriodSecs", timing.tick_period_secs),
        ("retryBackoffSecs", timing.retry_backoff_secs),
        ("advertisementTtlSecs", timing.advertisement_ttl_secs),
        ("watchPollSecs", timing.watch_poll_secs),
        ("configReloadSecs", timing.config_reload_secs),
    ];
    if let Some((field, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", field)));
    }
    if timing.advertisement_ttl_secs > MAX_ADVERTISEMENT_TTL_SECS {
        return Err(ConfigError::Invalid(format!(
            "advertisementTtlSecs must be at most {}, got {}",
            MAX_ADVERTISEMENT_TTL_SECS, timing.advertisement_ttl_secs
        )));
    }
    if timing.credential_ttl_secs < MIN_CREDENTIAL_TTL_SECS
        || timing.credential_ttl_secs <= timing.tick_period_secs
    {
        return Err(ConfigError::Invalid(format!(
            "credentialTtlSecs must be at least {} and longer than tickPeriodSecs, got {}",
            MIN_CREDENTIAL_TTL_SECS, timing.credential_ttl_secs
        )));
    }
    if timing.bootstrap_attempts == 0 {
        return Err(ConfigError::Invalid(
            "bootstrapAttempts must be at least 1".to_string(),
        ));
    }

    for (i, policy) in config.label_policies.iter().enumerate() {
        if policy.source_key.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "labelPolicies[{}] has an empty sourceKey",
                i
            )));
        }
    }
    Ok(())
}
