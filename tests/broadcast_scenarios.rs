//! End-to-end broadcast scenarios against the in-memory remote store
//!
//! The local cluster is a fixed snapshot served by `SnapshotSource`; the
//! foreign cluster is a `MemoryRemote` with ownership garbage collection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use advbroadcaster::advertisement::{Advertisement, AdvertisementBuilder, AdvertisementInputs};
use advbroadcaster::broadcaster::{
    AdvertisementWatcher, BootstrapError, ControlLoop, CredentialMinter, LoopState,
    RemoteSynchronizer,
};
use advbroadcaster::cluster::{
    new_node, new_pod, new_secret, new_virtual_node, parse_quantity, resource_list,
    AccountingError, AccountingOptions, ClusterSource, FlatPricing, Node, Pod, PodExt,
    ResourceAccountant, Secret, SecretExt,
};
use advbroadcaster::config::BroadcasterConfig;
use advbroadcaster::remote::{
    MemoryRemote, ResourceClient, StoreError, StoreOperation, SyncTarget,
};

const HOME: &str = "home";
const FOREIGN: &str = "foreign";

/// Local cluster snapshot; the pod list can change between ticks
struct SnapshotSource {
    nodes: Vec<Node>,
    pods: Mutex<Vec<Pod>>,
}

impl SnapshotSource {
    fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        Self {
            nodes,
            pods: Mutex::new(pods),
        }
    }
}

#[async_trait]
impl ClusterSource for SnapshotSource {
    async fn list_nodes(&self) -> Result<Vec<Node>, AccountingError> {
        Ok(self.nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AccountingError> {
        Ok(self.pods.lock().unwrap().clone())
    }
}

/// Counts how many watches were started
#[derive(Default)]
struct CountingWatcher {
    started: AtomicUsize,
}

#[async_trait]
impl AdvertisementWatcher for CountingWatcher {
    async fn watch(&self, _target: SyncTarget, _name: String, cancel: CancellationToken) {
        self.started.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
    }
}

/// One physical node (cpu=4, memory=8Gi) and one virtual node
fn scenario_nodes() -> Vec<Node> {
    vec![
        new_node("worker-1", resource_list([("cpu", "4"), ("memory", "8Gi")]).unwrap()),
        new_virtual_node(
            "liqo-foreign",
            resource_list([("cpu", "8"), ("memory", "16Gi")]).unwrap(),
        ),
    ]
}

fn credential() -> Secret {
    new_secret("liqo", "vk-secret-home").with_data("kubeconfig", "apiVersion: v1\nkind: Config\n")
}

/// Hands out the scenario credential and counts how often it was asked
#[derive(Default)]
struct CountingMinter {
    minted: AtomicUsize,
}

#[async_trait]
impl CredentialMinter for CountingMinter {
    async fn mint(&self, _home: &str, _namespace: &str) -> Result<Secret, BootstrapError> {
        self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(credential())
    }
}

async fn build_advertisement(source: &SnapshotSource, pct: u8) -> Advertisement {
    let options = AccountingOptions {
        sharing_percentage: pct,
        ..Default::default()
    };
    let resources = ResourceAccountant::new(Arc::new(SnapshotSource::new(
        source.nodes.clone(),
        source.pods.lock().unwrap().clone(),
    )))
    .account(&options)
    .await
    .unwrap();
    let inputs = AdvertisementInputs::from_resources(resources, &[], &FlatPricing::default());
    AdvertisementBuilder::new(HOME, credential().reference()).build(inputs, Utc::now())
}

fn fast_config() -> BroadcasterConfig {
    let mut config = BroadcasterConfig::default();
    config.timing.tick_period_secs = 1;
    config.timing.retry_backoff_secs = 1;
    config
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_scenario_a_idle_cluster() {
    let source = SnapshotSource::new(scenario_nodes(), Vec::new());
    let adv = build_advertisement(&source, 50).await;

    let availability = adv.availability();
    assert_eq!(availability["cpu"], parse_quantity("2").unwrap());
    assert_eq!(availability["memory"], parse_quantity("4Gi").unwrap());
    assert!(adv.limits().unwrap().is_empty());
    assert_eq!(
        adv.spec.neighbors["liqo-foreign"],
        resource_list([("cpu", "8"), ("memory", "16Gi")]).unwrap()
    );
}

#[tokio::test]
async fn test_scenario_b_pod_consumes_capacity() {
    let pod = new_pod("web", "worker-1")
        .with_container(resource_list([("cpu", "1")]).unwrap(), Default::default());
    let source = SnapshotSource::new(scenario_nodes(), vec![pod]);
    let adv = build_advertisement(&source, 50).await;

    assert_eq!(adv.availability()["cpu"], parse_quantity("1").unwrap());
    assert_eq!(adv.availability()["memory"], parse_quantity("4Gi").unwrap());
}

#[tokio::test]
async fn test_pods_on_virtual_nodes_are_ignored() {
    let offloaded = new_pod("offloaded", "liqo-foreign")
        .with_container(resource_list([("cpu", "3")]).unwrap(), Default::default());
    let source = SnapshotSource::new(scenario_nodes(), vec![offloaded]);
    let adv = build_advertisement(&source, 50).await;

    assert_eq!(adv.availability()["cpu"], parse_quantity("2").unwrap());
}

#[tokio::test]
async fn test_publishing_twice_keeps_one_identical_record() {
    let remote = MemoryRemote::new();
    let sync = RemoteSynchronizer::new(remote.target(FOREIGN), HOME);
    let source = SnapshotSource::new(scenario_nodes(), Vec::new());
    let adv = build_advertisement(&source, 50).await;

    sync.publish_credential(&credential()).await.unwrap();
    let first = sync.publish_advertisement(&adv).await.unwrap();
    let second = sync.publish_advertisement(&adv).await.unwrap();

    assert_eq!(remote.advertisements.len(), 1);
    assert_eq!(first.spec, second.spec);
    assert_eq!(first.metadata.uid, second.metadata.uid);
    let stored = remote.advertisements.peek(None, "adv-home").unwrap();
    assert_eq!(stored.spec, adv.spec);
}

#[tokio::test]
async fn test_secret_owned_by_advertisement_after_creation() {
    let remote = MemoryRemote::new();
    let sync = RemoteSynchronizer::new(remote.target(FOREIGN), HOME);
    let source = SnapshotSource::new(scenario_nodes(), Vec::new());

    sync.publish_credential(&credential()).await.unwrap();
    let before = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
    assert!(before.owner_references().is_empty());

    let created = sync
        .publish_advertisement(&build_advertisement(&source, 50).await)
        .await
        .unwrap();
    let after = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
    assert_eq!(Some(&after.owner_references()[0].uid), created.metadata.uid.as_ref());
}

#[tokio::test]
async fn test_scenario_c_remote_deletion_is_repaired() {
    let remote = MemoryRemote::new();
    let sync = RemoteSynchronizer::new(remote.target(FOREIGN), HOME);
    let source = SnapshotSource::new(scenario_nodes(), Vec::new());
    let adv = build_advertisement(&source, 50).await;

    sync.publish_credential(&credential()).await.unwrap();
    let first = sync.publish_advertisement(&adv).await.unwrap();

    // Someone else deletes the advertisement; the owned secret is collected
    remote.advertisements.delete(None, "adv-home").await.unwrap();
    assert!(remote.secrets.is_empty());

    sync.publish_credential(&credential()).await.unwrap();
    let second = sync.publish_advertisement(&adv).await.unwrap();

    assert_ne!(first.metadata.uid, second.metadata.uid);
    let secret = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
    assert_eq!(secret.owner_references().len(), 1);
    assert_eq!(Some(&secret.owner_references()[0].uid), second.metadata.uid.as_ref());
}

#[tokio::test]
async fn test_retract_without_advertisement_succeeds() {
    let remote = MemoryRemote::new();
    let sync = RemoteSynchronizer::new(remote.target(FOREIGN), HOME);
    tokio_test::assert_ok!(sync.retract_advertisement().await);
}

#[tokio::test]
async fn test_stale_version_conflict_is_retryable() {
    let remote = MemoryRemote::new();
    let sync = RemoteSynchronizer::new(remote.target(FOREIGN), HOME);
    let source = SnapshotSource::new(scenario_nodes(), Vec::new());
    let adv = build_advertisement(&source, 50).await;

    sync.publish_credential(&credential()).await.unwrap();
    sync.publish_advertisement(&adv).await.unwrap();
    remote.advertisements.fail_next(
        StoreOperation::Update,
        StoreError::Conflict {
            kind: "Advertisement",
            name: "adv-home".into(),
        },
    );

    let err = sync.publish_advertisement(&adv).await.unwrap_err();
    assert!(err.is_retryable());
    // Next attempt converges
    tokio_test::assert_ok!(sync.publish_advertisement(&adv).await);
}

#[tokio::test]
async fn test_control_loop_watches_once_and_retracts() {
    let remote = MemoryRemote::new();
    let source = Arc::new(SnapshotSource::new(scenario_nodes(), Vec::new()));
    let synchronizer = Arc::new(RemoteSynchronizer::new(remote.target(FOREIGN), HOME));
    let watcher = Arc::new(CountingWatcher::default());
    let minter = Arc::new(CountingMinter::default());
    let (config_tx, config_rx) = watch::channel(fast_config());

    let control = ControlLoop::new(
        ResourceAccountant::new(source.clone()),
        synchronizer,
        minter.clone(),
        "liqo",
        config_rx,
    )
    .with_watcher(watcher.clone());
    let status = control.status();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(control.run(cancel.clone()));

    // Several ticks, one watch
    let ticks = status.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while ticks.read().await.ticks_succeeded < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(watcher.started.load(Ordering::SeqCst), 1);
    assert!(minter.minted.load(Ordering::SeqCst) >= 2);

    // The refreshed credential is still owned by the advertisement
    let adv = remote.advertisements.peek(None, "adv-home").unwrap();
    let secret = remote.secrets.peek(Some("liqo"), "vk-secret-home").unwrap();
    assert_eq!(secret.owner_references().len(), 1);
    assert_eq!(Some(&secret.owner_references()[0].uid), adv.metadata.uid.as_ref());

    // A config change is picked up on the next tick
    let mut changed = fast_config();
    changed.sharing_percentage = 100;
    config_tx.send(changed).unwrap();
    let ads = remote.advertisements.clone();
    wait_for(|| {
        ads.peek(None, "adv-home")
            .map(|adv| adv.availability()["cpu"] == parse_quantity("4").unwrap())
            .unwrap_or(false)
    })
    .await;

    cancel.cancel();
    handle.await.unwrap();

    assert!(remote.advertisements.is_empty());
    assert!(remote.secrets.is_empty());
    assert_eq!(status.read().await.state, LoopState::Terminated);
    assert_eq!(watcher.started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_control_loop_backs_off_and_recovers() {
    let remote = MemoryRemote::new();
    let source = Arc::new(SnapshotSource::new(scenario_nodes(), Vec::new()));
    let synchronizer = Arc::new(RemoteSynchronizer::new(remote.target(FOREIGN), HOME));
    let watcher = Arc::new(CountingWatcher::default());
    let (_config_tx, config_rx) = watch::channel(fast_config());

    // First credential publish fails
    remote
        .secrets
        .fail_next(StoreOperation::Get, StoreError::Transport("unreachable".into()));

    let control = ControlLoop::new(
        ResourceAccountant::new(source),
        synchronizer,
        Arc::new(CountingMinter::default()),
        "liqo",
        config_rx,
    )
    .with_watcher(watcher.clone());
    let status = control.status();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(control.run(cancel.clone()));

    let progress = status.clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while progress.read().await.ticks_succeeded == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    {
        let status = status.read().await;
        assert_eq!(status.ticks_failed, 1);
        assert!(status.last_error.is_none());
        assert!(status.watch_started);
    }
    // No watch was started by the failed tick
    assert_eq!(watcher.started.load(Ordering::SeqCst), 1);

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_cancellation_before_first_tick_still_retracts() {
    let remote = MemoryRemote::new();
    let source = Arc::new(SnapshotSource::new(scenario_nodes(), Vec::new()));
    let synchronizer = Arc::new(RemoteSynchronizer::new(remote.target(FOREIGN), HOME));
    let (_config_tx, config_rx) = watch::channel(fast_config());

    // A leftover advertisement from a previous run
    let leftover = build_advertisement(&SnapshotSource::new(scenario_nodes(), Vec::new()), 50).await;
    remote.advertisements.insert_raw(leftover);

    let cancel = CancellationToken::new();
    cancel.cancel();
    ControlLoop::new(
        ResourceAccountant::new(source),
        synchronizer,
        Arc::new(CountingMinter::default()),
        "liqo",
        config_rx,
    )
    .run(cancel)
    .await;

    assert!(remote.advertisements.is_empty());
    assert_eq!(remote.advertisements.call_count(StoreOperation::Create), 0);
}
