//! Resource accounting for the advertisement
//!
//! Turns a snapshot of nodes and pods into the capacity this cluster is
//! willing to export:
//!
//! - nodes are split into physical and virtual by the node type label
//! - pods on virtual nodes, pods already offloaded elsewhere and terminated
//!   pods are filtered out before any summation
//! - availability per class is `allocatable * pct / 100 - requests`,
//!   clamped at zero
//! - limits are the sum of the surviving pods' limits
//! - images are collected from physical nodes, deduplicated by reference

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;
use tracing::debug;

use super::quantity::{add_resource_lists, max_resource_lists, Quantity, ResourceList};
use super::resources::{container_resources, ContainerImage, Node, NodeExt, Pod, PodExt};

/// Errors while reading the local cluster
#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("Failed to list {kind}: {message}")]
    ListFailed { kind: &'static str, message: String },
}

impl AccountingError {
    pub fn list_failed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::ListFailed {
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

/// Read access to the local cluster's nodes and pods
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, AccountingError>;

    /// Every pod in every namespace
    async fn list_pods(&self) -> Result<Vec<Pod>, AccountingError>;
}

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// Nodes split by the virtual node label
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    pub physical: Vec<Node>,
    pub virtual_nodes: Vec<Node>,
}

impl NodeSet {
    pub fn partition(nodes: Vec<Node>) -> Self {
        let (virtual_nodes, physical): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|node| node.is_virtual());
        Self {
            physical,
            virtual_nodes,
        }
    }

    pub fn virtual_names(&self) -> HashSet<&str> {
        self.virtual_nodes
            .iter()
            .filter_map(|node| node.metadata.name.as_deref())
            .collect()
    }

    /// Virtual node name → its allocatable resources
    pub fn neighbors(&self) -> BTreeMap<String, ResourceList> {
        self.virtual_nodes
            .iter()
            .map(|node| (node.name_any(), node.allocatable()))
            .collect()
    }
}

/// Summed requests and limits of a set of pods
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodConsumption {
    pub requests: ResourceList,
    pub limits: ResourceList,
}

/// Both envelopes carried by an advertisement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceEnvelope {
    /// Exportable capacity (resource quota `hard`)
    pub availability: ResourceList,
    /// Consumed limits (limit range `max`)
    pub limits: ResourceList,
}

/// Knobs for a single accounting pass
#[derive(Debug, Clone)]
pub struct AccountingOptions {
    /// Share of allocatable capacity eligible for export, 0-100
    pub sharing_percentage: u8,
    /// Image names starting with one of these are not advertised
    pub excluded_image_prefixes: Vec<String>,
}

impl Default for AccountingOptions {
    fn default() -> Self {
        Self {
            sharing_percentage: 50,
            excluded_image_prefixes: Vec::new(),
        }
    }
}

/// Everything accounting derives from one snapshot
#[derive(Debug, Clone, Default)]
pub struct AdvResources {
    pub nodes: NodeSet,
    pub envelope: ResourceEnvelope,
    pub images: Vec<ContainerImage>,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Effective requests and limits of one pod.
///
/// App containers run together, so they add up; init containers run one at
/// a time before them, so only the largest matters. Pod overhead is added
/// on top.
pub fn pod_requests_and_limits(pod: &Pod) -> PodConsumption {
    let mut requests = ResourceList::new();
    let mut limits = ResourceList::new();
    for container in pod.containers() {
        let (container_requests, container_limits) = container_resources(container);
        add_resource_lists(&mut requests, &container_requests);
        add_resource_lists(&mut limits, &container_limits);
    }

    for init in pod.init_containers() {
        let (init_requests, init_limits) = container_resources(init);
        requests = max_resource_lists(&requests, &init_requests);
        limits = max_resource_lists(&limits, &init_limits);
    }

    let overhead = pod.overhead();
    if !overhead.is_empty() {
        add_resource_lists(&mut requests, &overhead);
        // Overhead only counts towards limits that are actually set.
        for (name, quantity) in &overhead {
            if let Some(limit) = limits.get_mut(name) {
                *limit += *quantity;
            }
        }
    }

    PodConsumption { requests, limits }
}

/// Whether a pod's consumption belongs to this cluster's physical capacity
pub fn is_accounted(pod: &Pod, virtual_names: &HashSet<&str>) -> bool {
    !pod.is_terminated()
        && !pod.is_outgoing_offload()
        && !virtual_names.contains(pod.node_name())
}

/// Sum requests and limits over `pods`
pub fn total_consumption<'a, I>(pods: I) -> PodConsumption
where
    I: IntoIterator<Item = &'a Pod>,
{
    let mut total = PodConsumption::default();
    for pod in pods {
        let consumption = pod_requests_and_limits(pod);
        add_resource_lists(&mut total.requests, &consumption.requests);
        add_resource_lists(&mut total.limits, &consumption.limits);
    }
    total
}

/// Consumption of the pods that count against physical capacity
pub fn accounted_consumption(pods: &[Pod], nodes: &NodeSet) -> PodConsumption {
    let virtual_names = nodes.virtual_names();
    total_consumption(pods.iter().filter(|pod| is_accounted(pod, &virtual_names)))
}

/// Sum of the physical nodes' allocatable resources
pub fn physical_allocatable(nodes: &NodeSet) -> ResourceList {
    let mut allocatable = ResourceList::new();
    for node in &nodes.physical {
        add_resource_lists(&mut allocatable, &node.allocatable());
    }
    allocatable
}

/// `max(0, allocatable * pct / 100 - consumed)` for every allocatable class
pub fn compute_availability(
    allocatable: &ResourceList,
    consumed: &ResourceList,
    sharing_percentage: u8,
) -> ResourceList {
    let pct = sharing_percentage.min(100);
    allocatable
        .iter()
        .map(|(name, quantity)| {
            let used = consumed.get(name).copied().unwrap_or_else(Quantity::zero);
            let available = (quantity.scaled_percent(pct) - used).clamp_non_negative();
            (name.clone(), available)
        })
        .collect()
}

/// Images on physical nodes, first occurrence of each reference wins
pub fn collect_images(nodes: &NodeSet, excluded_prefixes: &[String]) -> Vec<ContainerImage> {
    let mut seen = BTreeSet::new();
    let mut images = Vec::new();

    for node in &nodes.physical {
        for image in node.images() {
            let Some(reference) = image.names.as_ref().and_then(|names| names.first()) else {
                continue;
            };
            if excluded_prefixes
                .iter()
                .any(|prefix| reference.starts_with(prefix.as_str()))
            {
                continue;
            }
            if seen.insert(reference.clone()) {
                images.push(image.clone());
            }
        }
    }

    images
}

/// Run a full accounting pass over a snapshot
pub fn compute_resources(nodes: Vec<Node>, pods: &[Pod], options: &AccountingOptions) -> AdvResources {
    let nodes = NodeSet::partition(nodes);
    let consumption = accounted_consumption(pods, &nodes);
    let allocatable = physical_allocatable(&nodes);
    let availability =
        compute_availability(&allocatable, &consumption.requests, options.sharing_percentage);
    let images = collect_images(&nodes, &options.excluded_image_prefixes);

    debug!(
        physical = nodes.physical.len(),
        virtual_nodes = nodes.virtual_nodes.len(),
        pods = pods.len(),
        images = images.len(),
        "Computed advertised resources"
    );

    AdvResources {
        nodes,
        envelope: ResourceEnvelope {
            availability,
            limits: consumption.limits,
        },
        images,
    }
}

// ============================================================================
// I/O wrapper
// ============================================================================

/// Reads a fresh snapshot from the cluster and accounts it
#[derive(Clone)]
pub struct ResourceAccountant {
    source: Arc<dyn ClusterSource>,
}

impl ResourceAccountant {
    pub fn new(source: Arc<dyn ClusterSource>) -> Self {
        Self { source }
    }

    pub async fn account(&self, options: &AccountingOptions) -> Result<AdvResources, AccountingError> {
        let nodes = self.source.list_nodes().await?;
        let pods = self.source.list_pods().await?;
        Ok(compute_resources(nodes, &pods, options))
    }
}
