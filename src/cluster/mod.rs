//! # Local cluster view
//!
//! Everything the broadcaster derives from the local cluster before it
//! talks to the peer:
//!
//! ```text
//!   nodes ─┬─► NodeSet ──► physical ──┬─► allocatable ─┐
//!          │                          ├─► images ──────┼─► pricing
//!          │                          └─► labels       │
//!          │              virtual ───► neighbors       ▼
//!   pods ──┴─► filter ──► requests / limits ──► ResourceEnvelope
//! ```
//!
//! All of it is pure computation over a snapshot read once per tick through
//! [`ClusterSource`].

pub mod accountant;
pub mod labels;
pub mod pricing;
pub mod quantity;
pub mod resources;

pub use accountant::{
    compute_resources, AccountingError, AccountingOptions, AdvResources, ClusterSource, NodeSet,
    PodConsumption, ResourceAccountant, ResourceEnvelope,
};
pub use labels::{compute_labels, LabelAggregation, LabelPolicy};
pub use pricing::{FlatPricing, ImageSizePricing, PricingConfig, PricingPolicy};
pub use quantity::{
    from_api_list, parse_quantity, resource_list, to_api_list, Quantity, QuantityError,
    ResourceList,
};
pub use resources::{
    clear_identity, new_node, new_pod, new_secret, new_virtual_node, secret_reference, Container,
    ContainerImage, Labelled, Node, NodeExt, ObjectMeta, OwnerReference, PeeringRequest,
    PeeringRequestSpec, Pod, PodExt, PodPhase, Secret, SecretExt, SecretReference,
};

/// Node label distinguishing virtual nodes from physical ones
pub const VIRTUAL_NODE_TYPE_LABEL: &str = "liqo.io/type";

/// Value of [`VIRTUAL_NODE_TYPE_LABEL`] on virtual nodes
pub const VIRTUAL_NODE_LABEL_VALUE: &str = "virtual-node";

/// Pod label set on pods whose capacity is already exported elsewhere
pub const OUTGOING_OFFLOAD_LABEL: &str = "liqo.io/outgoing";

/// Image registries never advertised by default
pub const DEFAULT_EXCLUDED_IMAGE_PREFIXES: [&str; 2] = ["k8s.gcr.io", "registry.k8s.io"];
