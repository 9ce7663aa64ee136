//! Observation of the published advertisement on the foreign cluster
//!
//! The foreign cluster accepts or refuses the advertisement and creates a
//! virtual node for it. The broadcaster does not react to any of that; it
//! only reports what it sees. The watch is started once per advertisement
//! lifetime, guarded by [`WatchLatch`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::advertisement::{Advertisement, AdvertisementStatus};
use crate::remote::{StoreError, SyncTarget};

/// One-shot flag: the first `try_fire` wins, every later call loses
#[derive(Debug, Default)]
pub struct WatchLatch(AtomicBool);

impl WatchLatch {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns true exactly once
    pub fn try_fire(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the watcher noticed between two observations
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Appeared,
    StatusChanged(AdvertisementStatus),
    Disappeared,
    ReadFailed(String),
}

/// Last known state of the remote advertisement
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Observed {
    #[default]
    Unknown,
    Present(Option<AdvertisementStatus>),
    Absent,
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Fold one read of the advertisement into the observed state
pub fn observe(
    previous: &Observed,
    read: &Result<Advertisement, StoreError>,
) -> (Observed, Option<WatchEvent>) {
    match read {
        Ok(adv) => {
            let next = Observed::Present(adv.status.clone());
            let event = match (previous, &adv.status) {
                (Observed::Present(before), now) if before == now => None,
                (_, Some(status)) => Some(WatchEvent::StatusChanged(status.clone())),
                (Observed::Present(_), None) => None,
                (_, None) => Some(WatchEvent::Appeared),
            };
            (next, event)
        }
        Err(e) if e.is_not_found() => match previous {
            Observed::Absent => (Observed::Absent, None),
            _ => (Observed::Absent, Some(WatchEvent::Disappeared)),
        },
        Err(e) => (previous.clone(), Some(WatchEvent::ReadFailed(e.to_string()))),
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Long-running observer of one advertisement
#[async_trait]
pub trait AdvertisementWatcher: Send + Sync {
    /// Runs until `cancel` fires
    async fn watch(&self, target: SyncTarget, name: String, cancel: CancellationToken);
}

/// Reads the advertisement on a fixed interval and logs what changed
pub struct PollingWatcher {
    interval: Duration,
    events: Option<mpsc::UnboundedSender<WatchEvent>>,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            events: None,
        }
    }

    /// Also forward every event to `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<WatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn report(&self, target: &SyncTarget, name: &str, event: WatchEvent) {
        let foreign = target.foreign_cluster_id();
        match &event {
            WatchEvent::Appeared => debug!("Advertisement {} visible on foreign cluster {}", name, foreign),
            WatchEvent::StatusChanged(status) => info!(
                "Advertisement {} on foreign cluster {}: status={} virtualNode={}",
                name, foreign, status.advertisement_status, status.vk_created
            ),
            WatchEvent::Disappeared => {
                warn!("Advertisement {} disappeared from foreign cluster {}", name, foreign)
            }
            WatchEvent::ReadFailed(e) => {
                warn!("watch advertisement failed for foreign cluster {}: {}", foreign, e)
            }
        }
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl AdvertisementWatcher for PollingWatcher {
    async fn watch(&self, target: SyncTarget, name: String, cancel: CancellationToken) {
        info!(
            "Watching advertisement {} on foreign cluster {} every {:?}",
            name,
            target.foreign_cluster_id(),
            self.interval
        );
        let mut state = Observed::Unknown;

        loop {
            let read = target.advertisements().get(None, &name).await;
            let (next, event) = observe(&state, &read);
            state = next;
            if let Some(event) = event {
                self.report(&target, &name, event);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Advertisement watch stopped");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertisement::{AdvertisementBuilder, AdvertisementInputs};
    use crate::cluster::SecretReference;
    use crate::remote::MemoryRemote;
    use chrono::Utc;

    fn advertisement(status: Option<&str>) -> Advertisement {
        let mut adv = AdvertisementBuilder::new("home", SecretReference::default())
            .build(AdvertisementInputs::default(), Utc::now());
        adv.status = status.map(|s| AdvertisementStatus {
            advertisement_status: s.into(),
            vk_created: false,
        });
        adv
    }

    #[test]
    fn test_latch_fires_once() {
        let latch = WatchLatch::new();
        assert!(!latch.is_fired());
        assert!(latch.try_fire());
        assert!(!latch.try_fire());
        assert!(!latch.try_fire());
        assert!(latch.is_fired());
    }

    #[test]
    fn test_observe_transitions() {
        let (state, event) = observe(&Observed::Unknown, &Ok(advertisement(None)));
        assert_eq!(event, Some(WatchEvent::Appeared));

        let (state, event) = observe(&state, &Ok(advertisement(None)));
        assert_eq!(event, None);

        let (state, event) = observe(&state, &Ok(advertisement(Some("ACCEPTED"))));
        assert!(matches!(event, Some(WatchEvent::StatusChanged(ref s)) if s.advertisement_status == "ACCEPTED"));

        let (state, event) = observe(&state, &Err(StoreError::not_found("Advertisement", "adv-home")));
        assert_eq!(event, Some(WatchEvent::Disappeared));
        assert_eq!(state, Observed::Absent);

        let (state, event) = observe(&state, &Err(StoreError::not_found("Advertisement", "adv-home")));
        assert_eq!(event, None);

        let (state, event) = observe(&state, &Err(StoreError::Transport("reset".into())));
        assert!(matches!(event, Some(WatchEvent::ReadFailed(_))));
        assert_eq!(state, Observed::Absent);
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_polling_watcher_reports_changes() {
        let remote = MemoryRemote::new();
        remote.advertisements.insert_raw(advertisement(None));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = PollingWatcher::new(Duration::from_millis(10)).with_events(tx);
        let cancel = CancellationToken::new();
        let handle = {
            let target = remote.target("foreign");
            let cancel = cancel.clone();
            tokio::spawn(async move { watcher.watch(target, "adv-home".into(), cancel).await })
        };

        assert_eq!(next(&mut rx).await, WatchEvent::Appeared);
        remote.advertisements.insert_raw(advertisement(Some("REFUSED")));
        assert!(matches!(next(&mut rx).await, WatchEvent::StatusChanged(_)));
        remote.advertisements.remove_raw(None, "adv-home");
        assert_eq!(next(&mut rx).await, WatchEvent::Disappeared);

        cancel.cancel();
        handle.await.unwrap();
    }
}
