//! Price annotations for advertised resources
//!
//! Pricing is a policy decision, so it sits behind [`PricingPolicy`]. Both
//! shipped policies are pure functions of the image inventory and return a
//! `BTreeMap`, so identical input always yields a byte-identical price map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resources::ContainerImage;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Computes a price per resource class from the image inventory
pub trait PricingPolicy: Send + Sync {
    fn compute_prices(&self, images: &[ContainerImage]) -> BTreeMap<String, f64>;
}

/// Fixed prices for cpu and memory, and the same price for every image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlatPricing {
    pub cpu: f64,
    pub memory: f64,
    pub per_image: f64,
}

impl Default for FlatPricing {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 0.002,
            per_image: 5.0,
        }
    }
}

impl PricingPolicy for FlatPricing {
    fn compute_prices(&self, images: &[ContainerImage]) -> BTreeMap<String, f64> {
        let mut prices = BTreeMap::new();
        prices.insert("cpu".to_string(), self.cpu);
        prices.insert("memory".to_string(), self.memory);
        for image in images {
            for name in image.names.iter().flatten() {
                prices.insert(name.clone(), self.per_image);
            }
        }
        prices
    }
}

/// Images are priced by size: pulling a large image remotely is costly, so
/// having it locally is worth more
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageSizePricing {
    pub cpu: f64,
    pub memory: f64,
    pub base_image_price: f64,
    pub price_per_gib: f64,
}

impl Default for ImageSizePricing {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 0.002,
            base_image_price: 1.0,
            price_per_gib: 4.0,
        }
    }
}

impl PricingPolicy for ImageSizePricing {
    fn compute_prices(&self, images: &[ContainerImage]) -> BTreeMap<String, f64> {
        let mut prices = BTreeMap::new();
        prices.insert("cpu".to_string(), self.cpu);
        prices.insert("memory".to_string(), self.memory);
        for image in images {
            let gib = image.size_bytes.unwrap_or_default().max(0) as f64 / BYTES_PER_GIB;
            let price = self.base_image_price + gib * self.price_per_gib;
            for name in image.names.iter().flatten() {
                prices.insert(name.clone(), price);
            }
        }
        prices
    }
}

/// Pricing policy as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum PricingConfig {
    Flat(FlatPricing),
    ImageSize(ImageSizePricing),
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig::Flat(FlatPricing::default())
    }
}

impl PricingPolicy for PricingConfig {
    fn compute_prices(&self, images: &[ContainerImage]) -> BTreeMap<String, f64> {
        match self {
            PricingConfig::Flat(policy) => policy.compute_prices(images),
            PricingConfig::ImageSize(policy) => policy.compute_prices(images),
        }
    }
}
