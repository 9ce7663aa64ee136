//! Assembles an [`Advertisement`] from the accounting results

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::{
    advertisement_name, Advertisement, AdvertisementSpec, LimitRangeItem, LimitRangeSpec,
    ResourceQuotaSpec, ADVERTISEMENT_TTL_MINUTES,
};
use crate::cluster::{
    compute_labels, AdvResources, ContainerImage, LabelPolicy, PricingPolicy, ResourceEnvelope,
    ResourceList, SecretReference,
};

/// Everything an advertisement is built from
#[derive(Debug, Clone, Default)]
pub struct AdvertisementInputs {
    pub envelope: ResourceEnvelope,
    pub images: Vec<ContainerImage>,
    pub labels: BTreeMap<String, String>,
    pub prices: BTreeMap<String, f64>,
    pub neighbors: BTreeMap<String, ResourceList>,
}

impl AdvertisementInputs {
    /// Run the label and pricing policies over an accounting result
    pub fn from_resources(
        resources: AdvResources,
        label_policies: &[LabelPolicy],
        pricing: &dyn PricingPolicy,
    ) -> Self {
        let labels = compute_labels(&resources.nodes.physical, label_policies);
        let prices = pricing.compute_prices(&resources.images);
        let neighbors = resources.nodes.neighbors();
        Self {
            envelope: resources.envelope,
            images: resources.images,
            labels,
            prices,
            neighbors,
        }
    }
}

/// Builds advertisements for one home cluster
#[derive(Debug, Clone)]
pub struct AdvertisementBuilder {
    home_cluster_id: String,
    secret_ref: SecretReference,
    ttl: Duration,
}

impl AdvertisementBuilder {
    pub fn new(home_cluster_id: impl Into<String>, secret_ref: SecretReference) -> Self {
        Self {
            home_cluster_id: home_cluster_id.into(),
            secret_ref,
            ttl: Duration::minutes(ADVERTISEMENT_TTL_MINUTES),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn name(&self) -> String {
        advertisement_name(&self.home_cluster_id)
    }

    /// Pure: the same inputs and `now` give the same advertisement
    pub fn build(&self, inputs: AdvertisementInputs, now: DateTime<Utc>) -> Advertisement {
        Advertisement::new(
            &self.name(),
            AdvertisementSpec {
                cluster_id: self.home_cluster_id.clone(),
                images: inputs.images,
                limit_range: LimitRangeSpec {
                    limits: vec![LimitRangeItem {
                        max: inputs.envelope.limits,
                    }],
                },
                resource_quota: ResourceQuotaSpec {
                    hard: inputs.envelope.availability,
                },
                labels: inputs.labels,
                neighbors: inputs.neighbors,
                prices: inputs.prices,
                kube_config_ref: self.secret_ref.clone(),
                timestamp: now,
                time_to_live: now + self.ttl,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{
        compute_resources, new_node, new_virtual_node, resource_list, secret_reference,
        AccountingOptions, FlatPricing, Labelled, NodeExt,
    };

    fn secret_ref() -> SecretReference {
        secret_reference("liqo", "vk-secret-home")
    }

    #[test]
    fn test_build_sets_name_and_ttl() {
        let now = Utc::now();
        let adv = AdvertisementBuilder::new("home", secret_ref()).build(AdvertisementInputs::default(), now);

        assert_eq!(adv.name(), "adv-home");
        assert_eq!(adv.spec.cluster_id, "home");
        assert_eq!(adv.spec.timestamp, now);
        assert_eq!(adv.spec.time_to_live - now, Duration::minutes(30));
        assert_eq!(adv.spec.kube_config_ref, secret_ref());
        assert_eq!(adv.spec.limit_range.limits.len(), 1);
        assert!(adv.metadata.uid.is_none());
        assert!(adv.status.is_none());
    }

    #[test]
    fn test_build_from_resources() {
        let nodes = vec![
            new_node("worker-1", resource_list([("cpu", "4"), ("memory", "8Gi")]).unwrap())
                .with_label("zone", "eu")
                .with_image("nginx:1.25", 10),
            new_virtual_node("liqo-peer", resource_list([("cpu", "16")]).unwrap()),
        ];
        let resources = compute_resources(nodes, &[], &AccountingOptions::default());
        let inputs = AdvertisementInputs::from_resources(
            resources,
            &[LabelPolicy::new("zone")],
            &FlatPricing::default(),
        );
        let adv = AdvertisementBuilder::new("home", secret_ref()).build(inputs, Utc::now());

        assert_eq!(adv.availability()["cpu"].value(), 2);
        assert_eq!(adv.spec.neighbors["liqo-peer"]["cpu"].value(), 16);
        assert_eq!(adv.spec.labels["zone"], "eu");
        assert_eq!(adv.spec.prices["nginx:1.25"], 5.0);
        assert!(adv.limits().unwrap().is_empty());
    }

    #[test]
    fn test_custom_ttl() {
        let now = Utc::now();
        let adv = AdvertisementBuilder::new("home", secret_ref())
            .with_ttl(Duration::minutes(5))
            .build(AdvertisementInputs::default(), now);
        assert_eq!(adv.spec.time_to_live, now + Duration::minutes(5));
    }
}
