//! Recommendation composition.
//!
//! Candidates come from independent signals: products the reasoner
//! recommends, the brand preference, the platform keyword and the budget.
//! They are merged, filtered to in-stock items, deduplicated and ranked by
//! price. With no signal at all, or when inference fails, the popularity
//! fallback is served instead.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semshop::{Assertion, DerivedFacts, KnowledgeBase};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::product::{fetch_with_retry, Product, ProductKind, ProductSource};
use crate::{CatalogError, Result};

/// A reason a product made it into a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// Products the reasoner linked through the recommendation relation.
    Inferred { count: usize },
    Brand { brand: String },
    Platform { platform: String },
    Budget { min: f64, max: f64 },
    /// The entity is entailed to be a premium customer.
    PremiumTier,
    /// Nothing personal matched; popular in-stock products instead.
    Fallback,
}

/// Why a result is less than fully personalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "degradation", content = "detail", rename_all = "snake_case")]
pub enum Degradation {
    /// Recomputation failed; only the fallback was served.
    InferenceFailure(String),
    /// The last snapshot entailed a contradiction.
    EngineInconsistency,
    /// The product list could not be fetched.
    CatalogUnavailable(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResult {
    pub entity_id: String,
    pub entity_name: String,
    pub products: Vec<Product>,
    pub justification: String,
    pub signals: Vec<Signal>,
    pub total: usize,
    pub degradations: Vec<Degradation>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerTier {
    Premium,
    New,
    Regular,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSummary {
    pub id: String,
    pub name: String,
    pub tier: CustomerTier,
    pub preferred_brand: Option<String>,
    pub preferences: Vec<String>,
    pub order_count: usize,
    pub recommended: BTreeSet<String>,
}

/// Preferences as currently asserted for an entity.
#[derive(Debug, Default)]
struct Preferences {
    name: Option<String>,
    brand: Option<String>,
    platform: Option<String>,
    budget_min: Option<f64>,
    budget_max: Option<f64>,
}

pub struct RecommendationComposer {
    kb: Arc<KnowledgeBase>,
    source: Arc<dyn ProductSource>,
    config: Arc<CatalogConfig>,
}

impl RecommendationComposer {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        source: Arc<dyn ProductSource>,
        config: Arc<CatalogConfig>,
    ) -> Self {
        Self { kb, source, config }
    }

    /// Personalised recommendations for `entity_id`.
    pub fn compose_for(&self, entity_id: &str) -> Result<RecommendationResult> {
        let prefs = self.preferences(entity_id)?;
        let mut degradations = Vec::new();

        let derived = match self.kb.ensure_fresh() {
            Ok(derived) => Some(derived),
            Err(e) => {
                warn!(entity = entity_id, error = %e, "serving fallback recommendations");
                degradations.push(Degradation::InferenceFailure(e.to_string()));
                None
            }
        };
        if let Some(d) = &derived {
            if !d.is_consistent() {
                warn!(entity = entity_id, "recommending from an inconsistent snapshot");
                degradations.push(Degradation::EngineInconsistency);
            }
        }

        let products = self.fetch(&mut degradations);
        let mut signals = Vec::new();
        let candidates = match &derived {
            Some(derived) => {
                self.personal_candidates(entity_id, &prefs, derived, &products, &mut signals)
            }
            None => Vec::new(),
        };

        let candidates = if candidates.is_empty() {
            signals.retain(|s| *s == Signal::PremiumTier);
            signals.push(Signal::Fallback);
            self.fallback(&products)
        } else {
            candidates
        };

        let ranked = rank(candidates, self.config.recommendation_cap);
        let inference_failed = degradations
            .iter()
            .any(|d| matches!(d, Degradation::InferenceFailure(_)));
        let justification = justify(&signals, inference_failed);
        info!(
            entity = entity_id,
            products = ranked.len(),
            signals = signals.len(),
            degraded = !degradations.is_empty(),
            "recommendations composed"
        );

        Ok(RecommendationResult {
            entity_id: entity_id.to_string(),
            entity_name: prefs.name.unwrap_or_else(|| entity_id.to_string()),
            total: ranked.len(),
            products: ranked,
            justification,
            signals,
            degradations,
            generated_at: Utc::now(),
        })
    }

    /// In-stock accessories compatible with `product_id`.
    pub fn accessories_for(&self, product_id: &str) -> Result<Vec<Product>> {
        let product = self
            .source
            .product(product_id)?
            .ok_or_else(|| CatalogError::UnknownProduct(product_id.to_string()))?;
        let products = fetch_with_retry(self.source.as_ref(), &self.config.retry)?;
        Ok(accessories_compatible_with(&product, &products))
    }

    /// Accessories compatible with anything the entity has ordered.
    pub fn history_based(&self, entity_id: &str) -> Result<Vec<Product>> {
        self.require_customer(entity_id)?;
        let v = &self.config.vocabulary;
        let derived = self.kb.derived()?;

        let purchased: BTreeSet<String> = derived
            .relation_values(entity_id, &v.placed_order)
            .iter()
            .flat_map(|order| derived.relation_values(order, &v.contains_product))
            .collect();
        if purchased.is_empty() {
            return Ok(Vec::new());
        }

        let products = fetch_with_retry(self.source.as_ref(), &self.config.retry)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for bought in products.iter().filter(|p| purchased.contains(&p.id)) {
            for accessory in accessories_compatible_with(bought, &products) {
                if seen.insert(accessory.id.clone()) {
                    out.push(accessory);
                }
            }
        }
        debug!(
            entity = entity_id,
            purchased = purchased.len(),
            accessories = out.len(),
            "history recommendations"
        );
        Ok(out)
    }

    /// In-stock products by stock, then price, both descending.
    pub fn general(&self) -> Result<Vec<Product>> {
        let mut products: Vec<Product> = fetch_with_retry(self.source.as_ref(), &self.config.retry)?
            .into_iter()
            .filter(Product::in_stock)
            .collect();
        products.sort_by(|a, b| {
            b.stock
                .unwrap_or(0)
                .cmp(&a.stock.unwrap_or(0))
                .then_with(|| price_of(b).total_cmp(&price_of(a)))
        });
        products.truncate(self.config.general_cap);
        Ok(products)
    }

    pub fn customer_summary(&self, entity_id: &str) -> Result<CustomerSummary> {
        self.require_customer(entity_id)?;
        let derived = self.kb.derived()?;
        self.summarize(entity_id, &derived)
    }

    /// Every known customer, ordered by name.
    pub fn customers(&self) -> Result<Vec<CustomerSummary>> {
        let derived = self.kb.derived()?;
        let class = &self.config.vocabulary.customer_class;
        let mut ids = derived.instances_of(class);
        ids.extend(self.kb.asserted_instances_of(class)?);

        let mut out = ids
            .iter()
            .map(|id| self.summarize(id, &derived))
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn summarize(&self, id: &str, derived: &DerivedFacts) -> Result<CustomerSummary> {
        let v = &self.config.vocabulary;
        let classes = derived.classes_of(id);
        let tier = if classes.contains(&v.premium_customer_class) {
            CustomerTier::Premium
        } else if classes.contains(&v.new_customer_class) {
            CustomerTier::New
        } else {
            CustomerTier::Regular
        };
        let name = self
            .kb
            .data_attribute(id, &v.name)?
            .map(|l| l.to_string())
            .unwrap_or_else(|| id.to_string());

        Ok(CustomerSummary {
            id: id.to_string(),
            name,
            tier,
            preferred_brand: derived.relation_values(id, &v.preferred_brand).into_iter().next(),
            preferences: derived
                .relation_values(id, &v.preferred_platform)
                .into_iter()
                .collect(),
            order_count: derived.relation_values(id, &v.placed_order).len(),
            recommended: derived.relation_values(id, &v.recommended_product),
        })
    }

    fn require_customer(&self, entity_id: &str) -> Result<()> {
        let class = &self.config.vocabulary.customer_class;
        let known = self.kb.asserted_instances_of(class)?.contains(entity_id)
            || self.kb.classes_of(entity_id)?.contains(class);
        if known {
            Ok(())
        } else {
            Err(CatalogError::UnknownEntity(entity_id.to_string()))
        }
    }

    /// Asserted preferences. These are live, unlike entailed relations.
    fn preferences(&self, entity_id: &str) -> Result<Preferences> {
        self.require_customer(entity_id)?;
        let v = &self.config.vocabulary;
        let mut prefs = Preferences::default();
        for assertion in self.kb.assertions_about(entity_id)? {
            match assertion {
                Assertion::ObjectRelation { relation, object, .. } => {
                    if relation == v.preferred_brand && prefs.brand.is_none() {
                        prefs.brand = Some(object);
                    } else if relation == v.preferred_platform && prefs.platform.is_none() {
                        prefs.platform = Some(object);
                    }
                }
                Assertion::DataAttribute { attribute, value, .. } => {
                    if attribute == v.name {
                        prefs.name = Some(value.to_string());
                    } else if attribute == v.budget_min {
                        prefs.budget_min = value.as_f64();
                    } else if attribute == v.budget_max {
                        prefs.budget_max = value.as_f64();
                    }
                }
                Assertion::ClassMembership { .. } => {}
            }
        }
        Ok(prefs)
    }

    fn fetch(&self, degradations: &mut Vec<Degradation>) -> Vec<Product> {
        match fetch_with_retry(self.source.as_ref(), &self.config.retry) {
            Ok(products) => products,
            Err(e) => {
                degradations.push(Degradation::CatalogUnavailable(e.to_string()));
                Vec::new()
            }
        }
    }

    fn personal_candidates(
        &self,
        entity_id: &str,
        prefs: &Preferences,
        derived: &DerivedFacts,
        products: &[Product],
        signals: &mut Vec<Signal>,
    ) -> Vec<Product> {
        let v = &self.config.vocabulary;
        let by_id: BTreeMap<&str, &Product> = products.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut candidates: Vec<Product> = Vec::new();

        let inferred: Vec<Product> = derived
            .relation_values(entity_id, &v.recommended_product)
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|p| (*p).clone()))
            .collect();
        if !inferred.is_empty() {
            signals.push(Signal::Inferred {
                count: inferred.len(),
            });
            candidates.extend(inferred);
        }

        if let Some(brand) = &prefs.brand {
            let matching: Vec<Product> = products
                .iter()
                .filter(|p| p.brand.as_deref().is_some_and(|b| b.eq_ignore_ascii_case(brand)))
                .cloned()
                .collect();
            if !matching.is_empty() {
                signals.push(Signal::Brand {
                    brand: brand.clone(),
                });
                candidates.extend(matching);
            }
        }

        if let Some(platform) = &prefs.platform {
            let keyword = platform.to_lowercase();
            let matching: Vec<Product> = products
                .iter()
                .filter(|p| {
                    p.name.to_lowercase().contains(&keyword)
                        || p.category
                            .as_deref()
                            .is_some_and(|c| c.to_lowercase().contains(&keyword))
                })
                .cloned()
                .collect();
            if !matching.is_empty() {
                signals.push(Signal::Platform {
                    platform: platform.clone(),
                });
                candidates.extend(matching);
            }
        }

        if let (Some(min), Some(max)) = (prefs.budget_min, prefs.budget_max) {
            let matching: Vec<Product> = products
                .iter()
                .filter(|p| p.price.is_some_and(|price| price >= min && price <= max))
                .cloned()
                .collect();
            if !matching.is_empty() {
                signals.push(Signal::Budget { min, max });
                candidates.extend(matching);
            }
        }

        if derived
            .classes_of(entity_id)
            .contains(&v.premium_customer_class)
        {
            signals.push(Signal::PremiumTier);
        }

        candidates
    }

    /// In-stock products, most expensive first.
    fn fallback(&self, products: &[Product]) -> Vec<Product> {
        let mut popular: Vec<Product> = products.iter().filter(|p| p.in_stock()).cloned().collect();
        popular.sort_by(|a, b| price_of(b).total_cmp(&price_of(a)));
        popular.truncate(self.config.fallback_cap);
        popular
    }
}

fn price_of(p: &Product) -> f64 {
    p.price.unwrap_or(0.0)
}

fn accessories_compatible_with(product: &Product, products: &[Product]) -> Vec<Product> {
    products
        .iter()
        .filter(|p| p.kind == ProductKind::Accessory)
        .filter(|p| product.compatible.contains(&p.id))
        .filter(|p| p.in_stock())
        .cloned()
        .collect()
}

/// Drop out-of-stock items, keep the first of each id, sort by price
/// descending (stable) and cap.
fn rank(candidates: Vec<Product>, cap: usize) -> Vec<Product> {
    let mut seen = HashSet::new();
    let mut ranked: Vec<Product> = candidates
        .into_iter()
        .filter(Product::in_stock)
        .filter(|p| seen.insert(p.id.clone()))
        .collect();
    ranked.sort_by(|a, b| price_of(b).total_cmp(&price_of(a)));
    ranked.truncate(cap);
    ranked
}

fn justify(signals: &[Signal], inference_failed: bool) -> String {
    if signals.contains(&Signal::Fallback) {
        return if inference_failed {
            "Popular products in stock; personalised picks are temporarily unavailable".into()
        } else {
            "Popular products in stock".into()
        };
    }

    let reasons: Vec<String> = signals
        .iter()
        .filter_map(|s| match s {
            Signal::Inferred { .. } => Some("they match your customer profile".to_string()),
            Signal::Brand { brand } => Some(format!("you like {brand}")),
            Signal::Platform { platform } => Some(format!("you use {platform}")),
            Signal::Budget { min, max } => Some(format!("they fit your budget of {min} to {max}")),
            Signal::PremiumTier | Signal::Fallback => None,
        })
        .collect();

    let mut text = match reasons.split_last() {
        Some((last, [])) => format!("Recommended because {last}"),
        Some((last, rest)) => format!("Recommended because {} and {last}", rest.join(", ")),
        None => "Recommended for you".to_string(),
    };
    if signals.contains(&Signal::PremiumTier) {
        text.push_str(". As a premium customer you get early access to exclusive products");
    }
    text
}
