//! Product projections over the knowledge base.
//!
//! A [`Product`] is rebuilt from the last derived snapshot plus live data
//! attributes every time it is requested; nothing here is cached.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use semshop::{DerivedFacts, KnowledgeBase};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{RetryPolicy, Vocabulary};
use crate::Result;

/// Most specific product class, resolved once per projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "class", rename_all = "snake_case")]
pub enum ProductKind {
    Smartphone,
    Laptop,
    Tablet,
    Accessory,
    Other(String),
}

impl ProductKind {
    pub fn resolve(classes: &BTreeSet<String>, vocab: &Vocabulary) -> Self {
        if classes.contains(&vocab.smartphone_class) {
            ProductKind::Smartphone
        } else if classes.contains(&vocab.laptop_class) {
            ProductKind::Laptop
        } else if classes.contains(&vocab.tablet_class) {
            ProductKind::Tablet
        } else if classes.contains(&vocab.accessory_class) {
            ProductKind::Accessory
        } else {
            let other = classes
                .iter()
                .find(|c| **c != vocab.product_class && c.as_str() != "Thing")
                .unwrap_or(&vocab.product_class);
            ProductKind::Other(other.clone())
        }
    }

    /// Human-readable label, also matched by free-text search.
    pub fn label(&self) -> &str {
        match self {
            ProductKind::Smartphone => "Smartphone",
            ProductKind::Laptop => "Laptop",
            ProductKind::Tablet => "Tablet",
            ProductKind::Accessory => "Accessory",
            ProductKind::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub brand: Option<String>,
    pub category: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i64>,
    pub description: Option<String>,
    pub kind: ProductKind,
    pub features: BTreeSet<String>,
    pub compatible: BTreeSet<String>,
    pub incompatible: BTreeSet<String>,
}

impl Product {
    /// Stock above zero. A missing stock counts as zero.
    pub fn in_stock(&self) -> bool {
        self.stock.unwrap_or(0) > 0
    }
}

/// Where the search pipeline and composer get their product list.
pub trait ProductSource: Send + Sync {
    /// Every product, ordered by name.
    fn products(&self) -> Result<Vec<Product>>;

    fn product(&self, id: &str) -> Result<Option<Product>>;
}

/// [`ProductSource`] reading straight from the knowledge base.
pub struct KnowledgeCatalog {
    kb: Arc<KnowledgeBase>,
    vocab: Vocabulary,
}

impl KnowledgeCatalog {
    pub fn new(kb: Arc<KnowledgeBase>, vocab: Vocabulary) -> Self {
        Self { kb, vocab }
    }

    fn project(&self, derived: &DerivedFacts, id: &str) -> Result<Product> {
        let v = &self.vocab;
        let kb = &self.kb;
        let first = |relation: &str| derived.relation_values(id, relation).into_iter().next();

        let name = kb
            .data_attribute(id, &v.name)?
            .map(|l| l.to_string())
            .unwrap_or_else(|| id.to_string());

        Ok(Product {
            id: id.to_string(),
            name,
            brand: first(&v.has_brand),
            category: first(&v.in_category),
            price: kb.data_attribute(id, &v.price)?.and_then(|l| l.as_f64()),
            stock: kb.data_attribute(id, &v.stock)?.and_then(|l| l.as_i64()),
            description: kb.data_attribute(id, &v.description)?.map(|l| l.to_string()),
            kind: ProductKind::resolve(&derived.classes_of(id), v),
            features: derived.relation_values(id, &v.has_feature),
            compatible: derived.relation_values(id, &v.compatible_with),
            incompatible: derived.relation_values(id, &v.incompatible_with),
        })
    }
}

impl ProductSource for KnowledgeCatalog {
    fn products(&self) -> Result<Vec<Product>> {
        let derived = self.kb.derived()?;
        let mut products = derived
            .instances_of(&self.vocab.product_class)
            .iter()
            .map(|id| self.project(&derived, id))
            .collect::<Result<Vec<_>>>()?;
        products.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(products)
    }

    fn product(&self, id: &str) -> Result<Option<Product>> {
        let derived = self.kb.derived()?;
        if !derived.classes_of(id).contains(&self.vocab.product_class) {
            return Ok(None);
        }
        self.project(&derived, id).map(Some)
    }
}

/// Fetch the full product list, retrying with a fixed delay.
///
/// Sleeps between attempts with no lock held. Returns the last error once
/// every attempt has failed.
pub fn fetch_with_retry(source: &dyn ProductSource, policy: &RetryPolicy) -> Result<Vec<Product>> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match source.products() {
            Ok(products) => {
                if attempt > 1 {
                    debug!(attempt, "catalog fetch succeeded after retry");
                }
                return Ok(products);
            }
            Err(e) if attempt >= attempts => {
                warn!(attempts, error = %e, "catalog fetch failed after retries");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = policy.delay_ms,
                    error = %e,
                    "catalog fetch failed, retrying"
                );
                thread::sleep(policy.delay());
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CatalogError;
    use semshop::{Assertion, ChangeSet, NoInference};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn kb_with_phone() -> Arc<KnowledgeBase> {
        let kb = KnowledgeBase::open_in_memory(NoInference).unwrap();
        kb.apply(
            &ChangeSet::new()
                .assert(Assertion::class_membership("phone1", "Product"))
                .assert(Assertion::class_membership("phone1", "Smartphone"))
                .assert(Assertion::object_relation("phone1", "hasBrand", "Acme"))
                .assert(Assertion::object_relation("phone1", "compatibleWith", "case1"))
                .assert(Assertion::data_attribute("phone1", "name", "Acme One"))
                .assert(Assertion::data_attribute("phone1", "price", "799.90"))
                .assert(Assertion::data_attribute("phone1", "stock", 3_i64)),
        )
        .unwrap();
        kb.ensure_fresh().unwrap();
        Arc::new(kb)
    }

    #[test]
    fn projection_reads_entailed_and_asserted_facts() {
        let catalog = KnowledgeCatalog::new(kb_with_phone(), Vocabulary::default());
        let phone = catalog.product("phone1").unwrap().unwrap();

        assert_eq!(phone.name, "Acme One");
        assert_eq!(phone.brand.as_deref(), Some("Acme"));
        assert_eq!(phone.price, Some(799.90));
        assert_eq!(phone.stock, Some(3));
        assert_eq!(phone.kind, ProductKind::Smartphone);
        assert!(phone.compatible.contains("case1"));
        assert!(phone.in_stock());
        assert!(catalog.product("Acme").unwrap().is_none());
    }

    #[test]
    fn kind_falls_back_to_most_specific_other_class() {
        let vocab = Vocabulary::default();
        let classes = BTreeSet::from(["Product".to_string(), "Smartwatch".to_string()]);
        assert_eq!(
            ProductKind::resolve(&classes, &vocab),
            ProductKind::Other("Smartwatch".into())
        );
        let plain = BTreeSet::from(["Product".to_string()]);
        assert_eq!(ProductKind::resolve(&plain, &vocab).label(), "Product");
    }

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
    }

    impl ProductSource for Flaky {
        fn products(&self) -> Result<Vec<Product>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(CatalogError::Kb(semshop::KbError::Storage("disk busy".into())));
            }
            Ok(Vec::new())
        }

        fn product(&self, _id: &str) -> Result<Option<Product>> {
            Ok(None)
        }
    }

    #[test]
    fn retry_recovers_within_attempt_budget() {
        let source = Flaky {
            calls: AtomicU32::new(0),
            failures: 2,
        };
        let policy = RetryPolicy {
            attempts: 3,
            delay_ms: 1,
        };
        assert!(fetch_with_retry(&source, &policy).is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_gives_up_after_last_attempt() {
        let source = Flaky {
            calls: AtomicU32::new(0),
            failures: u32::MAX,
        };
        let policy = RetryPolicy {
            attempts: 3,
            delay_ms: 1,
        };
        assert!(fetch_with_retry(&source, &policy).is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
