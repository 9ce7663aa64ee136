use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::broadcaster::SharedStatus;
use crate::config::BroadcasterConfig;

/// Shared state of the status server
#[derive(Clone)]
pub struct AppState {
    pub home_cluster_id: String,
    pub status: SharedStatus,
    pub config: watch::Receiver<BroadcasterConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        home_cluster_id: impl Into<String>,
        status: SharedStatus,
        config: watch::Receiver<BroadcasterConfig>,
    ) -> Self {
        Self {
            home_cluster_id: home_cluster_id.into(),
            status,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}
