//! The periodic publish cycle
//!
//! ```text
//!   Bootstrapping ──► Running ──(cancel)──► Terminated
//!                      │   ▲
//!                      ▼   │
//!   mint ─► credential ─► account ─► build ─► publish ─► sleep(period)
//!     │          │            │                   │
//!     └──────────┴────────────┴──── failure ──────┴──► sleep(backoff)
//! ```
//!
//! The credential is minted afresh on every tick, so the token the peer
//! holds is always younger than one tick period. Cancellation is checked
//! before each tick and during every sleep, never in the middle of a tick.
//! On the way out the advertisement is retracted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bootstrap::CredentialMinter;
use super::sync::{RemoteSynchronizer, SyncError};
use super::watch::{AdvertisementWatcher, PollingWatcher, WatchLatch};
use crate::advertisement::{Advertisement, AdvertisementBuilder, AdvertisementInputs};
use crate::cluster::{ResourceAccountant, SecretExt};
use crate::config::BroadcasterConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoopState {
    #[default]
    Bootstrapping,
    Running,
    Terminated,
}

/// Progress of the loop, shared with the status endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    pub state: LoopState,
    pub foreign_cluster_id: Option<String>,
    pub ticks_succeeded: u64,
    pub ticks_failed: u64,
    pub last_publish: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub watch_started: bool,
}

pub type SharedStatus = Arc<RwLock<LoopStatus>>;

pub fn create_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(LoopStatus::default()))
}

/// Drives accounting and synchronization for one foreign cluster
pub struct ControlLoop {
    accountant: ResourceAccountant,
    synchronizer: Arc<RemoteSynchronizer>,
    minter: Arc<dyn CredentialMinter>,
    /// Namespace on the foreign cluster holding the credential secret
    credential_namespace: String,
    config: watch::Receiver<BroadcasterConfig>,
    watcher: Arc<dyn AdvertisementWatcher>,
    latch: WatchLatch,
    status: SharedStatus,
}

impl ControlLoop {
    pub fn new(
        accountant: ResourceAccountant,
        synchronizer: Arc<RemoteSynchronizer>,
        minter: Arc<dyn CredentialMinter>,
        credential_namespace: impl Into<String>,
        config: watch::Receiver<BroadcasterConfig>,
    ) -> Self {
        let poll = config.borrow().timing.watch_poll();
        Self {
            accountant,
            synchronizer,
            minter,
            credential_namespace: credential_namespace.into(),
            config,
            watcher: Arc::new(PollingWatcher::new(poll)),
            latch: WatchLatch::new(),
            status: create_shared_status(),
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn AdvertisementWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn watch_started(&self) -> bool {
        self.latch.is_fired()
    }

    /// One pass: mint and publish the credential, then the freshly built
    /// advertisement
    pub async fn tick(&self, config: &BroadcasterConfig) -> Result<Advertisement, SyncError> {
        let credential = self
            .minter
            .mint(self.synchronizer.home_cluster_id(), &self.credential_namespace)
            .await?;
        self.synchronizer.publish_credential(&credential).await?;

        let resources = self.accountant.account(&config.accounting_options()).await?;
        let inputs =
            AdvertisementInputs::from_resources(resources, &config.label_policies, &config.pricing);
        let builder =
            AdvertisementBuilder::new(self.synchronizer.home_cluster_id(), credential.reference());
        let adv = builder
            .with_ttl(config.timing.advertisement_ttl())
            .build(inputs, Utc::now());

        self.synchronizer.publish_advertisement(&adv).await
    }

    /// Run until `cancel` fires, then retract the advertisement
    pub async fn run(self, cancel: CancellationToken) {
        let foreign = self.synchronizer.foreign_cluster_id().to_string();
        {
            let mut status = self.status.write().await;
            status.state = LoopState::Running;
            status.foreign_cluster_id = Some(foreign.clone());
        }
        info!("Broadcasting to foreign cluster {}", foreign);

        while !cancel.is_cancelled() {
            let config = self.config.borrow().clone();

            let pause = match self.tick(&config).await {
                Ok(adv) => {
                    self.start_watch_once(&cancel);
                    self.record_success(&adv).await;
                    debug!(
                        "Published advertisement {}; next tick in {:?}",
                        adv.name(),
                        config.timing.tick_period()
                    );
                    config.timing.tick_period()
                }
                Err(e) => {
                    warn!(
                        "broadcast tick failed for foreign cluster {}: {}; retrying in {:?}",
                        foreign,
                        e,
                        config.timing.retry_backoff()
                    );
                    self.record_failure(&e).await;
                    config.timing.retry_backoff()
                }
            };

            if !sleep_or_cancel(pause, &cancel).await {
                break;
            }
        }

        info!("Shutting down; retracting advertisement from foreign cluster {}", foreign);
        if let Err(e) = self.synchronizer.retract_advertisement().await {
            error!("{}", e);
        }
        self.status.write().await.state = LoopState::Terminated;
    }

    fn start_watch_once(&self, cancel: &CancellationToken) {
        if !self.latch.try_fire() {
            return;
        }
        let watcher = self.watcher.clone();
        let target = self.synchronizer.target().clone();
        let name = self.synchronizer.advertisement_name();
        let cancel = cancel.child_token();
        tokio::spawn(async move { watcher.watch(target, name, cancel).await });
    }

    async fn record_success(&self, adv: &Advertisement) {
        let mut status = self.status.write().await;
        status.ticks_succeeded += 1;
        status.last_publish = Some(adv.spec.timestamp);
        status.last_error = None;
        status.watch_started = self.latch.is_fired();
    }

    async fn record_failure(&self, e: &SyncError) {
        let mut status = self.status.write().await;
        status.ticks_failed += 1;
        status.last_error = Some(e.to_string());
    }
}

/// Returns false if cancelled before `duration` elapsed
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::bootstrap::BootstrapError;
    use crate::cluster::{
        new_node, new_secret, resource_list, AccountingError, ClusterSource, Node, Pod, Secret,
    };
    use crate::remote::{MemoryRemote, StoreError};
    use async_trait::async_trait;
    use kube::ResourceExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out a new token on every call
    #[derive(Default)]
    struct CountingMinter {
        minted: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CredentialMinter for CountingMinter {
        async fn mint(&self, home: &str, namespace: &str) -> Result<Secret, BootstrapError> {
            if self.fail {
                return Err(BootstrapError::Minting {
                    service_account: "liqo-broadcaster".into(),
                    source: StoreError::Transport("connection refused".into()),
                });
            }
            let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(new_secret(namespace, format!("vk-secret-{}", home))
                .with_data("kubeconfig", format!("token-{}", n)))
        }
    }

    struct StaticSource {
        nodes: Vec<Node>,
    }

    #[async_trait]
    impl ClusterSource for StaticSource {
        async fn list_nodes(&self) -> Result<Vec<Node>, AccountingError> {
            Ok(self.nodes.clone())
        }

        async fn list_pods(&self) -> Result<Vec<Pod>, AccountingError> {
            Ok(Vec::new())
        }
    }

    fn control_loop_with(
        remote: &MemoryRemote,
        minter: Arc<CountingMinter>,
        config: BroadcasterConfig,
    ) -> ControlLoop {
        let source = StaticSource {
            nodes: vec![new_node(
                "worker-1",
                resource_list([("cpu", "4"), ("memory", "8Gi")]).unwrap(),
            )],
        };
        let synchronizer = Arc::new(RemoteSynchronizer::new(remote.target("foreign"), "home"));
        let (_tx, rx) = watch::channel(config);
        ControlLoop::new(
            ResourceAccountant::new(Arc::new(source)),
            synchronizer,
            minter,
            "liqo",
            rx,
        )
    }

    fn control_loop(remote: &MemoryRemote) -> ControlLoop {
        control_loop_with(remote, Arc::default(), BroadcasterConfig::default())
    }

    fn fast_config() -> BroadcasterConfig {
        let mut config = BroadcasterConfig::default();
        config.timing.tick_period_secs = 1;
        config.timing.retry_backoff_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_tick_publishes_credential_and_advertisement() {
        let remote = MemoryRemote::new();
        let cl = control_loop(&remote);

        let adv = cl.tick(&BroadcasterConfig::default()).await.unwrap();
        assert_eq!(adv.name(), "adv-home");
        assert_eq!(adv.availability()["cpu"].value(), 2);
        assert_eq!(remote.advertisements.len(), 1);
        assert_eq!(remote.secrets.len(), 1);
        assert_eq!(adv.spec.kube_config_ref.name.as_deref(), Some("vk-secret-home"));
        assert!(!cl.watch_started());
    }

    #[tokio::test]
    async fn test_every_tick_remints_credential() {
        let remote = MemoryRemote::new();
        let minter = Arc::new(CountingMinter::default());
        let cl = control_loop_with(&remote, minter.clone(), BroadcasterConfig::default());

        cl.tick(&BroadcasterConfig::default()).await.unwrap();
        cl.tick(&BroadcasterConfig::default()).await.unwrap();
        assert_eq!(minter.minted.load(Ordering::SeqCst), 2);

        let secret = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
        assert_eq!(secret.data_string("kubeconfig").as_deref(), Some("token-2"));
        // Ownership set on the first tick survives the refresh on the second
        let adv = remote.advertisements.peek(None, "adv-home").unwrap();
        assert_eq!(secret.owner_references().len(), 1);
        assert_eq!(Some(&secret.owner_references()[0].uid), adv.metadata.uid.as_ref());
    }

    #[tokio::test]
    async fn test_minting_failure_fails_tick() {
        let remote = MemoryRemote::new();
        let minter = Arc::new(CountingMinter {
            fail: true,
            ..Default::default()
        });
        let cl = control_loop_with(&remote, minter, BroadcasterConfig::default());

        let err = cl.tick(&BroadcasterConfig::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential(_)));
        assert!(err.is_retryable());
        assert!(remote.secrets.is_empty());
        assert!(remote.advertisements.is_empty());
    }

    #[tokio::test]
    async fn test_tick_uses_given_config() {
        let remote = MemoryRemote::new();
        let cl = control_loop(&remote);
        let config = BroadcasterConfig {
            sharing_percentage: 100,
            ..Default::default()
        };

        let adv = cl.tick(&config).await.unwrap();
        assert_eq!(adv.availability()["cpu"].value(), 4);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &cancel).await);
    }

    #[tokio::test]
    async fn test_run_stops_and_retracts() {
        let remote = MemoryRemote::new();
        let minter = Arc::new(CountingMinter::default());
        let cl = control_loop_with(&remote, minter.clone(), fast_config());
        let status = cl.status();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(cl.run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(10), async {
            while status.read().await.ticks_succeeded < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let secret = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
        assert_eq!(secret.owner_references().len(), 1);
        assert!(minter.minted.load(Ordering::SeqCst) >= 2);

        cancel.cancel();
        handle.await.unwrap();
        assert!(remote.advertisements.is_empty());
        assert!(remote.secrets.is_empty());
        let status = status.read().await;
        assert_eq!(status.state, LoopState::Terminated);
        assert!(status.watch_started);
        assert_eq!(status.foreign_cluster_id.as_deref(), Some("foreign"));
    }
}
