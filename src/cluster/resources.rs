//! Cluster objects the broadcaster reads locally and writes to the peer.
//!
//! Nodes, pods and secrets are the `k8s-openapi` types; the extension traits
//! below add the accessors and builders the accountant needs on top of their
//! all-optional fields. `PeeringRequest` is the Liqo discovery resource,
//! declared through `kube`'s custom resource derive.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeStatus, PodSpec, PodStatus, ResourceRequirements};
use k8s_openapi::ByteString;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

pub use k8s_openapi::api::core::v1::{Container, ContainerImage, Node, Pod, Secret, SecretReference};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use super::quantity::{from_api_list, to_api_list, ResourceList};
use super::{OUTGOING_OFFLOAD_LABEL, VIRTUAL_NODE_LABEL_VALUE, VIRTUAL_NODE_TYPE_LABEL};

/// Drop store-assigned identity so the object can be created fresh
pub fn clear_identity(meta: &mut ObjectMeta) {
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
}

pub fn secret_reference(namespace: impl Into<String>, name: impl Into<String>) -> SecretReference {
    SecretReference {
        namespace: Some(namespace.into()),
        name: Some(name.into()),
    }
}

/// Builder for labels on any API object
pub trait Labelled: kube::Resource + Sized {
    fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels_mut().insert(key.into(), value.into());
        self
    }
}

impl<K: kube::Resource> Labelled for K {}

// ============================================================================
// Nodes
// ============================================================================

pub fn new_node(name: impl Into<String>, allocatable: ResourceList) -> Node {
    let allocatable = to_api_list(&allocatable);
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            capacity: Some(allocatable.clone()),
            allocatable: Some(allocatable),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A peer-proxy node created by an earlier advertisement
pub fn new_virtual_node(name: impl Into<String>, allocatable: ResourceList) -> Node {
    new_node(name, allocatable).with_label(VIRTUAL_NODE_TYPE_LABEL, VIRTUAL_NODE_LABEL_VALUE)
}

pub trait NodeExt {
    fn is_virtual(&self) -> bool;

    /// Allocatable resources; unparseable entries are skipped
    fn allocatable(&self) -> ResourceList;

    fn images(&self) -> &[ContainerImage];

    fn with_image(self, name: impl Into<String>, size_bytes: i64) -> Self;
}

impl NodeExt for Node {
    fn is_virtual(&self) -> bool {
        self.labels().get(VIRTUAL_NODE_TYPE_LABEL).map(String::as_str) == Some(VIRTUAL_NODE_LABEL_VALUE)
    }

    fn allocatable(&self) -> ResourceList {
        from_api_list(self.status.as_ref().and_then(|s| s.allocatable.as_ref()))
    }

    fn images(&self) -> &[ContainerImage] {
        self.status
            .as_ref()
            .and_then(|s| s.images.as_deref())
            .unwrap_or_default()
    }

    fn with_image(mut self, name: impl Into<String>, size_bytes: i64) -> Self {
        self.status
            .get_or_insert_with(Default::default)
            .images
            .get_or_insert_with(Vec::new)
            .push(ContainerImage {
                names: Some(vec![name.into()]),
                size_bytes: Some(size_bytes),
            });
        self
    }
}

// ============================================================================
// Pods
// ============================================================================

/// Lifecycle phase as reported in `status.phase`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }

    fn from_api(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// A running pod in the `default` namespace bound to `node_name`
pub fn new_pod(name: impl Into<String>, node_name: impl Into<String>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.into()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(PodPhase::Running.as_str().to_string()),
            ..Default::default()
        }),
    }
}

pub trait PodExt {
    /// Node the pod is bound to; empty while unscheduled
    fn node_name(&self) -> &str;

    fn phase(&self) -> PodPhase;

    fn containers(&self) -> &[Container];

    fn init_containers(&self) -> &[Container];

    fn overhead(&self) -> ResourceList;

    fn is_terminated(&self) -> bool;

    /// Capacity already re-exported to another cluster
    fn is_outgoing_offload(&self) -> bool;

    fn with_container(self, requests: ResourceList, limits: ResourceList) -> Self;

    fn with_init_container(self, requests: ResourceList, limits: ResourceList) -> Self;

    fn with_phase(self, phase: PodPhase) -> Self;
}

fn container(name: String, requests: ResourceList, limits: ResourceList) -> Container {
    Container {
        name,
        resources: Some(ResourceRequirements {
            requests: Some(to_api_list(&requests)),
            limits: Some(to_api_list(&limits)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl PodExt for Pod {
    fn node_name(&self) -> &str {
        self.spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or_default()
    }

    fn phase(&self) -> PodPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::from_api)
            .unwrap_or_default()
    }

    fn containers(&self) -> &[Container] {
        self.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default()
    }

    fn init_containers(&self) -> &[Container] {
        self.spec
            .as_ref()
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or_default()
    }

    fn overhead(&self) -> ResourceList {
        from_api_list(self.spec.as_ref().and_then(|s| s.overhead.as_ref()))
    }

    fn is_terminated(&self) -> bool {
        matches!(self.phase(), PodPhase::Succeeded | PodPhase::Failed)
    }

    fn is_outgoing_offload(&self) -> bool {
        self.labels().contains_key(OUTGOING_OFFLOAD_LABEL)
    }

    fn with_container(mut self, requests: ResourceList, limits: ResourceList) -> Self {
        let spec = self.spec.get_or_insert_with(Default::default);
        let name = format!("c{}", spec.containers.len());
        spec.containers.push(container(name, requests, limits));
        self
    }

    fn with_init_container(mut self, requests: ResourceList, limits: ResourceList) -> Self {
        let init = self
            .spec
            .get_or_insert_with(Default::default)
            .init_containers
            .get_or_insert_with(Vec::new);
        let name = format!("init{}", init.len());
        init.push(container(name, requests, limits));
        self
    }

    fn with_phase(mut self, phase: PodPhase) -> Self {
        self.status.get_or_insert_with(Default::default).phase = Some(phase.as_str().to_string());
        self
    }
}

/// Requests and limits of one container
pub fn container_resources(container: &Container) -> (ResourceList, ResourceList) {
    let resources = container.resources.as_ref();
    (
        from_api_list(resources.and_then(|r| r.requests.as_ref())),
        from_api_list(resources.and_then(|r| r.limits.as_ref())),
    )
}

// ============================================================================
// Secrets
// ============================================================================

pub fn new_secret(namespace: impl Into<String>, name: impl Into<String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub trait SecretExt {
    fn with_data(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self;

    /// A data entry decoded as UTF-8
    fn data_string(&self, key: &str) -> Option<String>;

    fn reference(&self) -> SecretReference;
}

impl SecretExt for Secret {
    fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), ByteString(value.into()));
        self
    }

    fn data_string(&self, key: &str) -> Option<String> {
        self.data
            .as_ref()?
            .get(key)
            .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
    }

    fn reference(&self) -> SecretReference {
        SecretReference {
            namespace: self.namespace(),
            name: Some(self.name_any()),
        }
    }
}

// ============================================================================
// Peering requests
// ============================================================================

/// A peer that asked for resources. The peer's cluster id is the name.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "discovery.liqo.io",
    version = "v1alpha1",
    kind = "PeeringRequest",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringRequestSpec {
    /// Namespace on the foreign cluster where our records are written
    pub namespace: String,
    /// Local secret holding a kubeconfig for the foreign cluster
    pub kube_config_ref: SecretReference,
}

impl PeeringRequest {
    pub fn foreign_cluster_id(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
