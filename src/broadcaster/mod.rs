//! # Broadcaster
//!
//! Everything that talks to the foreign cluster:
//!
//! - [`bootstrap`]: resolve the peer and connect to it, once, at startup,
//!   and mint the credential the peer uses to reach back
//! - [`sync`]: idempotent create-or-update of the advertisement and the
//!   credential secret
//! - [`control`]: the periodic cycle tying accounting to synchronization
//! - [`watch`]: observation of the published advertisement

pub mod bootstrap;
pub mod control;
pub mod sync;
pub mod watch;

pub use bootstrap::{
    render_credential, resolve_peering, BootstrapError, ClientBootstrapper, CredentialMinter,
    KubeConnector, PeeringDiscovery, PeeringInfo, RemoteConnector, ServiceAccountMinter,
};
pub use control::{create_shared_status, ControlLoop, LoopState, LoopStatus, SharedStatus};
pub use sync::{RemoteSynchronizer, SyncError};
pub use watch::{AdvertisementWatcher, PollingWatcher, WatchEvent, WatchLatch};
