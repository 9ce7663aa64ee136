//! In-memory remote store
//!
//! Behaves like the API server for the parts the broadcaster relies on:
//! uid and resource version assignment, optimistic concurrency on update,
//! and garbage collection of objects owned by a deleted object. Failures
//! can be injected per operation to exercise the retry paths.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::{Resource, ResourceExt};
use tracing::debug;
use uuid::Uuid;

use super::{ResourceClient, StoreError, StoredResource, SyncTarget};
use crate::advertisement::Advertisement;
use crate::cluster::Secret;

/// The four store verbs, used for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Get,
    Create,
    Update,
    Delete,
}

/// Deletes objects whose owner went away
pub trait OwnedObjectCollector: Send + Sync {
    /// Remove every object owned by `owner_uid`; returns how many went
    fn collect_owned_by(&self, owner_uid: &str) -> usize;
}

type ObjectKey = (String, String);

fn key(namespace: Option<&str>, name: &str) -> ObjectKey {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

pub struct MemoryStore<R> {
    objects: DashMap<ObjectKey, R>,
    next_version: AtomicU64,
    calls: DashMap<StoreOperation, usize>,
    injected: DashMap<StoreOperation, StoreError>,
    dependents: RwLock<Vec<Arc<dyn OwnedObjectCollector>>>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: StoredResource> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_version: AtomicU64::new(1),
            calls: DashMap::new(),
            injected: DashMap::new(),
            dependents: RwLock::new(Vec::new()),
            _kind: PhantomData,
        }
    }

    /// Objects owned by records in this store get collected on delete
    pub fn add_dependents(&self, collector: Arc<dyn OwnedObjectCollector>) {
        if let Ok(mut dependents) = self.dependents.write() {
            dependents.push(collector);
        }
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: StoreOperation, error: StoreError) {
        self.injected.insert(operation, error);
    }

    pub fn call_count(&self, operation: StoreOperation) -> usize {
        self.calls.get(&operation).map(|c| *c).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Direct read, bypassing counters and injected failures
    pub fn peek(&self, namespace: Option<&str>, name: &str) -> Option<R> {
        self.objects.get(&key(namespace, name)).map(|r| r.clone())
    }

    /// Direct write, as if another actor changed the object
    pub fn insert_raw(&self, object: R) {
        let k = key(object.namespace().as_deref(), &object.name_any());
        self.objects.insert(k, object);
    }

    /// Direct delete, as if another actor removed the object
    pub fn remove_raw(&self, namespace: Option<&str>, name: &str) -> Option<R> {
        self.objects.remove(&key(namespace, name)).map(|(_, object)| object)
    }

    fn enter(&self, operation: StoreOperation) -> Result<(), StoreError> {
        *self.calls.entry(operation).or_insert(0) += 1;
        match self.injected.remove(&operation) {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }
}

impl<R: StoredResource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: StoredResource> OwnedObjectCollector for MemoryStore<R> {
    fn collect_owned_by(&self, owner_uid: &str) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, object| {
            !object
                .owner_references()
                .iter()
                .any(|owner| owner.uid == owner_uid)
        });
        before - self.objects.len()
    }
}

#[async_trait]
impl<R: StoredResource> ResourceClient<R> for MemoryStore<R> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError> {
        self.enter(StoreOperation::Get)?;
        self.objects
            .get(&key(namespace, name))
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::not_found(R::KIND, name))
    }

    async fn create(&self, object: &R) -> Result<R, StoreError> {
        self.enter(StoreOperation::Create)?;
        let name = object.name_any();
        let k = key(object.namespace().as_deref(), &name);

        match self.objects.entry(k) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                kind: R::KIND,
                name,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let mut stored = object.clone();
                stored.meta_mut().uid = Some(Uuid::new_v4().to_string());
                stored.meta_mut().resource_version = Some(self.bump_version());
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update(&self, object: &R) -> Result<R, StoreError> {
        self.enter(StoreOperation::Update)?;
        let name = object.name_any();
        let k = key(object.namespace().as_deref(), &name);

        let mut existing = self
            .objects
            .get_mut(&k)
            .ok_or_else(|| StoreError::not_found(R::KIND, &name))?;

        // An update without a version token is rejected, as the API server
        // does for replace.
        let meta = object.meta();
        let current = existing.meta();
        let uid_mismatch = meta.uid.is_some() && meta.uid != current.uid;
        if meta.resource_version.is_none()
            || meta.resource_version != current.resource_version
            || uid_mismatch
        {
            return Err(StoreError::Conflict { kind: R::KIND, name });
        }

        let mut stored = object.clone();
        stored.meta_mut().uid = current.uid.clone();
        stored.meta_mut().resource_version = Some(self.bump_version());
        *existing = stored.clone();
        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.enter(StoreOperation::Delete)?;
        let (_, removed) = self
            .objects
            .remove(&key(namespace, name))
            .ok_or_else(|| StoreError::not_found(R::KIND, name))?;

        let uid = removed.uid().unwrap_or_default();
        if let Ok(dependents) = self.dependents.read() {
            for collector in dependents.iter() {
                let collected = collector.collect_owned_by(&uid);
                if collected > 0 {
                    debug!("Garbage collected {} object(s) owned by {} {}", collected, R::KIND, name);
                }
            }
        }
        Ok(())
    }
}

/// Advertisement and secret stores wired for ownership garbage collection
#[derive(Clone)]
pub struct MemoryRemote {
    pub advertisements: Arc<MemoryStore<Advertisement>>,
    pub secrets: Arc<MemoryStore<Secret>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let advertisements = Arc::new(MemoryStore::new());
        let secrets = Arc::new(MemoryStore::new());
        advertisements.add_dependents(secrets.clone());
        Self {
            advertisements,
            secrets,
        }
    }

    pub fn target(&self, foreign_cluster_id: impl Into<String>) -> SyncTarget {
        SyncTarget::new(
            foreign_cluster_id,
            self.advertisements.clone(),
            self.secrets.clone(),
        )
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}
