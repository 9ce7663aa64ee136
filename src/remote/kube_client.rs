//! API server access through the `kube` client
//!
//! - [`KubeResourceClient`] implements [`ResourceClient`] for the foreign
//!   cluster's advertisements and secrets
//! - [`KubeClusterSource`] lists the local cluster's nodes and pods and
//!   reads peering requests
//!
//! Both wrap a [`kube::Client`]; errors are folded into [`StoreError`] so
//! callers never see transport-specific types.

use std::marker::PhantomData;

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{ResourceClient, StoreError, StoredResource};
use crate::cluster::{AccountingError, ClusterSource, Node, PeeringRequest, Pod};

/// Field selector skipping pods that no longer hold resources
const NON_TERMINATED_PODS: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// Fold a client error into a store error naming the object involved
pub fn store_error(error: kube::Error, kind: &'static str, name: &str) -> StoreError {
    match error {
        kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
            (404, _) => StoreError::not_found(kind, name),
            (409, "AlreadyExists") => StoreError::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            (409, _) => StoreError::Conflict {
                kind,
                name: name.to_string(),
            },
            (code, _) => StoreError::Api {
                status: code,
                message: response.message,
            },
        },
        kube::Error::SerdeError(e) => StoreError::Decode(e.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

/// Authenticated request proving the server is reachable
pub async fn check_connection(client: &Client) -> Result<(), StoreError> {
    let version = client
        .apiserver_version()
        .await
        .map_err(|e| store_error(e, "Version", "apiserver"))?;
    debug!("Connected to API server {}", version.git_version);
    Ok(())
}

// ============================================================================
// Remote records
// ============================================================================

/// [`ResourceClient`] over [`kube::Api`]
pub struct KubeResourceClient<R> {
    client: Client,
    _kind: PhantomData<fn() -> R>,
}

impl<R: StoredResource> KubeResourceClient<R> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<R> {
        R::api(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<R: StoredResource> ResourceClient<R> for KubeResourceClient<R> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<R, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| store_error(e, R::KIND, name))
    }

    async fn create(&self, object: &R) -> Result<R, StoreError> {
        let name = object.name_any();
        self.api(object.namespace().as_deref())
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| store_error(e, R::KIND, &name))
    }

    async fn update(&self, object: &R) -> Result<R, StoreError> {
        let name = object.name_any();
        self.api(object.namespace().as_deref())
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| store_error(e, R::KIND, &name))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error(e, R::KIND, name))
    }
}

// ============================================================================
// Local cluster reads
// ============================================================================

/// Nodes, pods and peering requests of the local cluster
#[derive(Clone)]
pub struct KubeClusterSource {
    client: Client,
}

impl KubeClusterSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn get_peering_request(&self, name: &str) -> Result<PeeringRequest, StoreError> {
        Api::<PeeringRequest>::all(self.client.clone())
            .get(name)
            .await
            .map_err(|e| store_error(e, "PeeringRequest", name))
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn list_nodes(&self) -> Result<Vec<Node>, AccountingError> {
        let list = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(|e| AccountingError::list_failed("nodes", e.to_string()))?;
        Ok(list.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, AccountingError> {
        let list = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default().fields(NON_TERMINATED_PODS))
            .await
            .map_err(|e| AccountingError::list_failed("pods", e.to_string()))?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_store_error_mapping() {
        let not_found = store_error(api_error(404, "NotFound", ""), "Secret", "vk-secret-a");
        assert_eq!(not_found, StoreError::not_found("Secret", "vk-secret-a"));

        let exists = store_error(api_error(409, "AlreadyExists", "exists"), "Secret", "a");
        assert!(matches!(exists, StoreError::AlreadyExists { kind: "Secret", .. }));

        let conflict = store_error(api_error(409, "Conflict", ""), "Advertisement", "adv-a");
        assert!(conflict.is_conflict());

        let forbidden = store_error(api_error(403, "Forbidden", "denied"), "Secret", "a");
        assert_eq!(
            forbidden,
            StoreError::Api {
                status: 403,
                message: "denied".into()
            }
        );
        assert!(store_error(api_error(503, "ServiceUnavailable", ""), "Secret", "a").is_retryable());
    }

    #[test]
    fn test_decode_errors_are_not_retryable() {
        let serde_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error = store_error(kube::Error::SerdeError(serde_error), "Secret", "a");
        assert!(matches!(error, StoreError::Decode(_)));
        assert!(!error.is_retryable());
    }
}
