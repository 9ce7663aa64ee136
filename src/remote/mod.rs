//! # Remote object store
//!
//! The broadcaster only needs four verbs per record kind against the
//! foreign cluster: get, create, update (guarded by the version token) and
//! delete. [`ResourceClient`] captures exactly that, so the synchronization
//! protocol can run against the real API server ([`kube_client`]) or an
//! in-memory stand-in ([`memory`]).

pub mod kube_client;
pub mod kubeconfig;
pub mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::advertisement::Advertisement;
use crate::cluster::Secret;

pub use kube_client::{KubeClusterSource, KubeResourceClient};
pub use kubeconfig::ClientConfigError;
pub use memory::{MemoryRemote, MemoryStore, StoreOperation};

/// Errors returned by a [`ResourceClient`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("{kind} '{name}' was modified concurrently (stale resource version)")]
    Conflict { kind: &'static str, name: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether trying the same operation again later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A record kind stored on the remote cluster
pub trait StoredResource:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    const KIND: &'static str;

    /// API handle for the collection holding this kind
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

// Cluster-scoped custom resource
impl StoredResource for Advertisement {
    const KIND: &'static str = "Advertisement";

    fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
        Api::all(client)
    }
}

impl StoredResource for Secret {
    const KIND: &'static str = "Secret";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        Api::namespaced(client, namespace.unwrap_or("default"))
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Typed get/create/update/delete for one record kind
#[async_trait]
pub trait ResourceClient<R: StoredResource>: Send + Sync {
    /// The stored object, carrying its version token in `metadata`
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError>;

    /// Fails with `AlreadyExists` if the name is taken
    async fn create(&self, object: &R) -> Result<R, StoreError>;

    /// Fails with `Conflict` if `object`'s resource version is stale
    async fn update(&self, object: &R) -> Result<R, StoreError>;

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;
}

/// Connection to the foreign cluster plus its identity
///
/// Built once by the bootstrapper and never modified afterwards.
#[derive(Clone)]
pub struct SyncTarget {
    foreign_cluster_id: String,
    advertisements: Arc<dyn ResourceClient<Advertisement>>,
    secrets: Arc<dyn ResourceClient<Secret>>,
}

impl SyncTarget {
    pub fn new(
        foreign_cluster_id: impl Into<String>,
        advertisements: Arc<dyn ResourceClient<Advertisement>>,
        secrets: Arc<dyn ResourceClient<Secret>>,
    ) -> Self {
        Self {
            foreign_cluster_id: foreign_cluster_id.into(),
            advertisements,
            secrets,
        }
    }

    pub fn foreign_cluster_id(&self) -> &str {
        &self.foreign_cluster_id
    }

    pub fn advertisements(&self) -> &dyn ResourceClient<Advertisement> {
        self.advertisements.as_ref()
    }

    pub fn secrets(&self) -> &dyn ResourceClient<Secret> {
        self.secrets.as_ref()
    }
}

impl std::fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTarget")
            .field("foreign_cluster_id", &self.foreign_cluster_id)
            .finish_non_exhaustive()
    }
}
