//! The Advertisement record published to the foreign cluster
//!
//! One Advertisement exists per (home cluster, foreign cluster) pair. Its
//! name is derived from the home cluster id, so every re-publication lands
//! on the same record. The resource is cluster-scoped on the foreign side.

pub mod builder;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};

use crate::cluster::{ContainerImage, OwnerReference, ResourceList, SecretReference};

pub use builder::{AdvertisementBuilder, AdvertisementInputs};

/// API group/version of the Advertisement custom resource
pub const ADVERTISEMENT_API_VERSION: &str = "sharing.liqo.io/v1alpha1";

pub const ADVERTISEMENT_KIND: &str = "Advertisement";

/// Prefix of the deterministic advertisement name
pub const ADVERTISEMENT_PREFIX: &str = "adv-";

/// Prefix of the credential secret created on the foreign cluster
pub const CREDENTIAL_SECRET_PREFIX: &str = "vk-secret-";

/// Data key holding the kubeconfig inside the credential secret
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Advertisement lifetime past its timestamp, in minutes
pub const ADVERTISEMENT_TTL_MINUTES: i64 = 30;

/// `adv-<home-cluster-id>`
pub fn advertisement_name(home_cluster_id: &str) -> String {
    format!("{}{}", ADVERTISEMENT_PREFIX, home_cluster_id)
}

/// `vk-secret-<home-cluster-id>`
pub fn credential_secret_name(home_cluster_id: &str) -> String {
    format!("{}{}", CREDENTIAL_SECRET_PREFIX, home_cluster_id)
}

/// Spare capacity offered to one foreign cluster. The status is written by
/// the foreign cluster, never by the broadcaster.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "sharing.liqo.io",
    version = "v1alpha1",
    kind = "Advertisement",
    status = "AdvertisementStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementSpec {
    pub cluster_id: String,

    #[serde(default)]
    pub images: Vec<ContainerImage>,

    pub limit_range: LimitRangeSpec,

    pub resource_quota: ResourceQuotaSpec,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Virtual node name → that node's allocatable resources
    #[serde(default)]
    pub neighbors: BTreeMap<String, ResourceList>,

    #[serde(default)]
    pub prices: BTreeMap<String, f64>,

    pub kube_config_ref: SecretReference,

    pub timestamp: DateTime<Utc>,

    pub time_to_live: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitRangeSpec {
    pub limits: Vec<LimitRangeItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitRangeItem {
    #[serde(default)]
    pub max: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuotaSpec {
    #[serde(default)]
    pub hard: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementStatus {
    /// ACCEPTED or REFUSED, set by the foreign cluster's policy
    #[serde(default)]
    pub advertisement_status: String,

    /// Whether the virtual node for this advertisement exists
    #[serde(default)]
    pub vk_created: bool,
}

impl Advertisement {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Owner reference pointing at this advertisement; `None` until the
    /// store has assigned a uid
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.owner_ref(&())
    }

    /// Max resources advertised through the limit range
    pub fn limits(&self) -> Option<&ResourceList> {
        self.spec.limit_range.limits.first().map(|item| &item.max)
    }

    /// Hard availability advertised through the resource quota
    pub fn availability(&self) -> &ResourceList {
        &self.spec.resource_quota.hard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(advertisement_name("home-1"), "adv-home-1");
        assert_eq!(credential_secret_name("home-1"), "vk-secret-home-1");
    }

    #[test]
    fn test_wire_shape() {
        let json = r#"{
            "apiVersion": "sharing.liqo.io/v1alpha1",
            "kind": "Advertisement",
            "metadata": {"name": "adv-home", "uid": "123", "resourceVersion": "4"},
            "spec": {
                "clusterId": "home",
                "images": [{"names": ["nginx"], "sizeBytes": 10}],
                "limitRange": {"limits": [{"max": {"cpu": "1"}}]},
                "resourceQuota": {"hard": {"cpu": "2", "memory": "4Gi"}},
                "labels": {"zone": "eu"},
                "neighbors": {"liqo-peer": {"cpu": "8"}},
                "prices": {"cpu": 1},
                "kubeConfigRef": {"namespace": "liqo", "name": "vk-secret-home"},
                "timestamp": "2024-01-01T00:00:00Z",
                "timeToLive": "2024-01-01T00:30:00Z"
            },
            "status": {"advertisementStatus": "ACCEPTED", "vkCreated": true}
        }"#;
        let adv: Advertisement = serde_json::from_str(json).unwrap();
        assert_eq!(adv.availability()["memory"].to_string(), "4Gi");
        assert_eq!(adv.limits().unwrap()["cpu"].value(), 1);
        assert_eq!(adv.spec.prices["cpu"], 1.0);
        assert_eq!(adv.status.as_ref().unwrap().advertisement_status, "ACCEPTED");

        let owner = adv.owner_reference().unwrap();
        assert_eq!(owner.uid, "123");
        assert_eq!(owner.kind, ADVERTISEMENT_KIND);
        assert_eq!(owner.api_version, ADVERTISEMENT_API_VERSION);
    }

    #[test]
    fn test_serialises_type_and_omits_empty_status() {
        let spec: AdvertisementSpec = serde_json::from_value(serde_json::json!({
            "clusterId": "home",
            "limitRange": {"limits": []},
            "resourceQuota": {"hard": {}},
            "kubeConfigRef": {"namespace": "liqo", "name": "vk-secret-home"},
            "timestamp": "2024-01-01T00:00:00Z",
            "timeToLive": "2024-01-01T00:30:00Z"
        }))
        .unwrap();
        let adv = Advertisement::new("adv-home", spec);
        assert!(adv.owner_reference().is_none());

        let json = serde_json::to_value(&adv).unwrap();
        assert_eq!(json["apiVersion"], ADVERTISEMENT_API_VERSION);
        assert_eq!(json["kind"], ADVERTISEMENT_KIND);
        assert!(json.get("status").is_none());
    }
}
