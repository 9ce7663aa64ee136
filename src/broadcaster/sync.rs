//! Create-or-update of the advertisement and its credential secret on the
//! foreign cluster
//!
//! Every operation is idempotent: running it again after a failure at any
//! step converges to the same remote state. Operations of one synchronizer
//! never interleave.

use kube::ResourceExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::bootstrap::BootstrapError;
use crate::advertisement::{advertisement_name, Advertisement};
use crate::cluster::{clear_identity, AccountingError, OwnerReference, Secret};
use crate::remote::{StoreError, SyncTarget};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{operation} failed for foreign cluster {foreign_cluster_id}: {source}")]
    Remote {
        operation: &'static str,
        foreign_cluster_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to account local resources: {0}")]
    Accounting(#[from] AccountingError),

    #[error("Failed to refresh credential: {0}")]
    Credential(#[from] BootstrapError),
}

impl SyncError {
    /// Accounting failures are always worth retrying; remote ones depend on
    /// the store error
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { source, .. } => source.is_retryable(),
            SyncError::Accounting(_) | SyncError::Credential(_) => true,
        }
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            SyncError::Remote { source, .. } => Some(source),
            SyncError::Accounting(_) | SyncError::Credential(_) => None,
        }
    }
}

/// Owners already recorded on the stored object come first; local ones are
/// added when their uid is not present yet
fn merge_owner_references(
    stored: Option<Vec<OwnerReference>>,
    local: Option<Vec<OwnerReference>>,
) -> Option<Vec<OwnerReference>> {
    let mut merged = stored.unwrap_or_default();
    for owner in local.unwrap_or_default() {
        if !merged.iter().any(|known| known.uid == owner.uid) {
            merged.push(owner);
        }
    }
    (!merged.is_empty()).then_some(merged)
}

/// Publishes this cluster's records into one foreign cluster
pub struct RemoteSynchronizer {
    target: SyncTarget,
    home_cluster_id: String,
    critical: Mutex<()>,
}

impl RemoteSynchronizer {
    pub fn new(target: SyncTarget, home_cluster_id: impl Into<String>) -> Self {
        Self {
            target,
            home_cluster_id: home_cluster_id.into(),
            critical: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn foreign_cluster_id(&self) -> &str {
        self.target.foreign_cluster_id()
    }

    pub fn home_cluster_id(&self) -> &str {
        &self.home_cluster_id
    }

    pub fn advertisement_name(&self) -> String {
        advertisement_name(&self.home_cluster_id)
    }

    fn remote_error(&self, operation: &'static str, source: StoreError) -> SyncError {
        SyncError::Remote {
            operation,
            foreign_cluster_id: self.foreign_cluster_id().to_string(),
            source,
        }
    }

    /// Create the advertisement, or overwrite the existing one in place
    ///
    /// On creation the credential secret (which must already exist) is made
    /// a dependent of the new advertisement. Failing to link it is logged
    /// and does not fail the call.
    pub async fn publish_advertisement(
        &self,
        adv: &Advertisement,
    ) -> Result<Advertisement, SyncError> {
        let _guard = self.critical.lock().await;
        let advertisements = self.target.advertisements();

        match advertisements.get(None, adv.name()).await {
            Ok(existing) => {
                let mut updated = adv.clone();
                updated.metadata.uid = existing.metadata.uid;
                updated.metadata.resource_version = existing.metadata.resource_version;
                // Status belongs to the foreign cluster
                updated.status = existing.status;

                let stored = advertisements
                    .update(&updated)
                    .await
                    .map_err(|e| self.remote_error("update advertisement", e))?;
                debug!(
                    "Updated advertisement {} on foreign cluster {}",
                    stored.name(),
                    self.foreign_cluster_id()
                );
                Ok(stored)
            }
            Err(e) if e.is_not_found() => self.create_advertisement(adv).await,
            Err(e) => Err(self.remote_error("get advertisement", e)),
        }
    }

    /// Runs with the critical section held
    async fn create_advertisement(&self, adv: &Advertisement) -> Result<Advertisement, SyncError> {
        let secret_ref = &adv.spec.kube_config_ref;
        let mut secret = self
            .target
            .secrets()
            .get(
                secret_ref.namespace.as_deref(),
                secret_ref.name.as_deref().unwrap_or_default(),
            )
            .await
            .map_err(|e| self.remote_error("get credential secret", e))?;

        let mut fresh = adv.clone();
        clear_identity(&mut fresh.metadata);
        let created = self
            .target
            .advertisements()
            .create(&fresh)
            .await
            .map_err(|e| self.remote_error("create advertisement", e))?;
        info!(
            "Created advertisement {} on foreign cluster {}",
            created.name(),
            self.foreign_cluster_id()
        );

        let Some(owner) = created.owner_reference() else {
            warn!(
                "link credential ownership skipped for foreign cluster {}: advertisement {} has no uid",
                self.foreign_cluster_id(),
                created.name()
            );
            return Ok(created);
        };

        secret.metadata.owner_references = Some(vec![owner]);
        if let Err(e) = self.target.secrets().update(&secret).await {
            warn!(
                "link credential ownership failed for foreign cluster {}: secret {} will not be \
                 collected with advertisement {}: {}",
                self.foreign_cluster_id(),
                secret.name_any(),
                created.name(),
                e
            );
        }
        Ok(created)
    }

    /// Create the credential secret, or overwrite the existing one in place
    ///
    /// Owner references already on the stored secret are kept, so the link
    /// to the advertisement survives every refresh.
    pub async fn publish_credential(&self, secret: &Secret) -> Result<Secret, SyncError> {
        let _guard = self.critical.lock().await;
        let secrets = self.target.secrets();

        match secrets.get(secret.namespace().as_deref(), &secret.name_any()).await {
            Ok(existing) => {
                let mut updated = secret.clone();
                updated.metadata.uid = existing.metadata.uid;
                updated.metadata.resource_version = existing.metadata.resource_version;
                updated.metadata.owner_references = merge_owner_references(
                    existing.metadata.owner_references,
                    secret.metadata.owner_references.clone(),
                );
                secrets
                    .update(&updated)
                    .await
                    .map_err(|e| self.remote_error("update credential secret", e))
            }
            Err(e) if e.is_not_found() => {
                let mut fresh = secret.clone();
                clear_identity(&mut fresh.metadata);
                let created = secrets
                    .create(&fresh)
                    .await
                    .map_err(|e| self.remote_error("create credential secret", e))?;
                info!(
                    "Created credential secret {} on foreign cluster {}",
                    created.name_any(),
                    self.foreign_cluster_id()
                );
                Ok(created)
            }
            Err(e) => Err(self.remote_error("get credential secret", e)),
        }
    }

    /// Delete the advertisement; a missing one counts as deleted
    pub async fn retract_advertisement(&self) -> Result<(), SyncError> {
        let _guard = self.critical.lock().await;
        let name = self.advertisement_name();

        match self.target.advertisements().delete(None, &name).await {
            Ok(()) => {
                info!(
                    "Retracted advertisement {} from foreign cluster {}",
                    name,
                    self.foreign_cluster_id()
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Advertisement {} already absent", name);
                Ok(())
            }
            Err(e) => Err(self.remote_error("delete advertisement", e)),
        }
    }
}
