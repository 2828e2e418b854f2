//! Catalog configuration: namespace, vocabulary, retry policy and caps.
//!
//! Loaded from defaults, a JSON document, or `SEMSHOP_*` environment
//! variables layered over the defaults.

use std::collections::BTreeSet;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CatalogError, Result};

/// Names of the classes, relations and attributes the catalog reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Vocabulary {
    pub customer_class: String,
    pub premium_customer_class: String,
    pub new_customer_class: String,
    pub brand_class: String,
    pub platform_class: String,
    pub product_class: String,
    pub smartphone_class: String,
    pub laptop_class: String,
    pub tablet_class: String,
    pub accessory_class: String,

    pub preferred_brand: String,
    pub preferred_platform: String,
    pub recommended_product: String,
    pub has_brand: String,
    pub in_category: String,
    pub compatible_with: String,
    pub incompatible_with: String,
    pub has_feature: String,
    pub placed_order: String,
    pub contains_product: String,

    pub name: String,
    pub price: String,
    pub stock: String,
    pub description: String,
    pub budget_min: String,
    pub budget_max: String,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            customer_class: "Customer".into(),
            premium_customer_class: "PremiumCustomer".into(),
            new_customer_class: "NewCustomer".into(),
            brand_class: "Brand".into(),
            platform_class: "Platform".into(),
            product_class: "Product".into(),
            smartphone_class: "Smartphone".into(),
            laptop_class: "Laptop".into(),
            tablet_class: "Tablet".into(),
            accessory_class: "Accessory".into(),

            preferred_brand: "preferredBrand".into(),
            preferred_platform: "preferredPlatform".into(),
            recommended_product: "recommendedProduct".into(),
            has_brand: "hasBrand".into(),
            in_category: "inCategory".into(),
            compatible_with: "compatibleWith".into(),
            incompatible_with: "incompatibleWith".into(),
            has_feature: "hasFeature".into(),
            placed_order: "placedOrder".into(),
            contains_product: "containsProduct".into(),

            name: "name".into(),
            price: "price".into(),
            stock: "stock".into(),
            description: "description".into(),
            budget_min: "budgetMin".into(),
            budget_max: "budgetMax".into(),
        }
    }
}

impl Vocabulary {
    fn terms(&self) -> [(&'static str, &String); 26] {
        [
            ("customerClass", &self.customer_class),
            ("premiumCustomerClass", &self.premium_customer_class),
            ("newCustomerClass", &self.new_customer_class),
            ("brandClass", &self.brand_class),
            ("platformClass", &self.platform_class),
            ("productClass", &self.product_class),
            ("smartphoneClass", &self.smartphone_class),
            ("laptopClass", &self.laptop_class),
            ("tabletClass", &self.tablet_class),
            ("accessoryClass", &self.accessory_class),
            ("preferredBrand", &self.preferred_brand),
            ("preferredPlatform", &self.preferred_platform),
            ("recommendedProduct", &self.recommended_product),
            ("hasBrand", &self.has_brand),
            ("inCategory", &self.in_category),
            ("compatibleWith", &self.compatible_with),
            ("incompatibleWith", &self.incompatible_with),
            ("hasFeature", &self.has_feature),
            ("placedOrder", &self.placed_order),
            ("containsProduct", &self.contains_product),
            ("name", &self.name),
            ("price", &self.price),
            ("stock", &self.stock),
            ("description", &self.description),
            ("budgetMin", &self.budget_min),
            ("budgetMax", &self.budget_max),
        ]
    }
}

/// Fixed-delay retry for the catalog fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            ..Default::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogConfig {
    /// IRI prefix for individuals in pattern queries.
    pub namespace: String,
    pub vocabulary: Vocabulary,
    pub retry: RetryPolicy,
    /// Default search page size.
    pub page_size: usize,
    /// Maximum products in a personalised recommendation.
    pub recommendation_cap: usize,
    /// Size of the popularity fallback.
    pub fallback_cap: usize,
    /// Size of the general recommendation list.
    pub general_cap: usize,
    /// Accepted brand preference values. `None` accepts any valid id.
    pub allowed_brands: Option<BTreeSet<String>>,
    /// Accepted platform preference values. `None` accepts any valid id.
    pub allowed_platforms: Option<BTreeSet<String>>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            namespace: "http://semshop.example/onto#".into(),
            vocabulary: Vocabulary::default(),
            retry: RetryPolicy::default(),
            page_size: 12,
            recommendation_cap: 20,
            fallback_cap: 10,
            general_cap: 12,
            allowed_brands: None,
            allowed_platforms: None,
        }
    }
}

impl CatalogConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CatalogError::Config(format!("invalid catalog config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `SEMSHOP_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`CatalogConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ns) = lookup("SEMSHOP_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(v) = lookup("SEMSHOP_PAGE_SIZE") {
            config.page_size = parse_var("SEMSHOP_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("SEMSHOP_RECOMMENDATION_CAP") {
            config.recommendation_cap = parse_var("SEMSHOP_RECOMMENDATION_CAP", &v)?;
        }
        if let Some(v) = lookup("SEMSHOP_RETRY_ATTEMPTS") {
            config.retry.attempts = parse_var("SEMSHOP_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SEMSHOP_RETRY_DELAY_MS") {
            config.retry.delay_ms = parse_var("SEMSHOP_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("SEMSHOP_ALLOWED_BRANDS") {
            config.allowed_brands = Some(split_list(&v));
        }
        if let Some(v) = lookup("SEMSHOP_ALLOWED_PLATFORMS") {
            config.allowed_platforms = Some(split_list(&v));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.namespace.ends_with('#') || self.namespace.ends_with('/')) {
            return Err(CatalogError::Config(format!(
                "namespace {:?} must end with '#' or '/'",
                self.namespace
            )));
        }
        if self.page_size == 0 {
            return Err(CatalogError::Config("pageSize must be positive".into()));
        }
        if self.retry.attempts == 0 {
            return Err(CatalogError::Config("retry.attempts must be at least 1".into()));
        }
        if let Some((field, _)) = self
            .vocabulary
            .terms()
            .into_iter()
            .find(|(_, term)| term.trim().is_empty())
        {
            return Err(CatalogError::Config(format!("vocabulary.{field} is empty")));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CatalogError::Config(format!("{key}={value:?}: {e}")))
}

fn split_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
