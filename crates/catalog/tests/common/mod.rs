#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use semshop::{
    Assertion, ChangeSet, EngineFailure, Entailments, FactSnapshot, InferenceEngine,
    KnowledgeBase,
};
use semshop_catalog::{CatalogError, Product, ProductSource};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small rule reasoner standing in for the external OWL engine.
///
/// - customers are recommended every product of their preferred brand;
/// - a customer with `budgetMax >= 1000` is a `PremiumCustomer`;
/// - a customer with no orders is a `NewCustomer`;
/// - `compatibleWith` is symmetric.
#[derive(Default)]
pub struct RuleEngine {
    pub fail: AtomicBool,
    pub inconsistent: AtomicBool,
    pub delay_ms: AtomicU32,
}

impl RuleEngine {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl InferenceEngine for RuleEngine {
    fn infer(&self, facts: &FactSnapshot) -> Result<Entailments, EngineFailure> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(u64::from(delay)));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineFailure("reasoner unavailable".into()));
        }

        let mut customers = BTreeSet::new();
        let mut with_orders = BTreeSet::new();
        let mut preferred: BTreeMap<&str, &str> = BTreeMap::new();
        let mut by_brand: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut out = Entailments::new();

        for assertion in facts.assertions() {
            match assertion {
                Assertion::ClassMembership { individual, class } if class == "Customer" => {
                    customers.insert(individual.as_str());
                }
                Assertion::ObjectRelation {
                    subject,
                    relation,
                    object,
                } => match relation.as_str() {
                    "preferredBrand" => {
                        preferred.insert(subject.as_str(), object.as_str());
                    }
                    "hasBrand" => by_brand
                        .entry(object.as_str())
                        .or_default()
                        .push(subject.as_str()),
                    "placedOrder" => {
                        with_orders.insert(subject.as_str());
                    }
                    "compatibleWith" => out.add_relation(object, "compatibleWith", subject),
                    _ => {}
                },
                Assertion::DataAttribute {
                    individual,
                    attribute,
                    value,
                } if attribute == "budgetMax" => {
                    if value.as_f64().is_some_and(|max| max >= 1000.0) {
                        out.add_class(individual, "PremiumCustomer");
                    }
                }
                _ => {}
            }
        }

        for customer in &customers {
            if !with_orders.contains(customer) {
                out.add_class(*customer, "NewCustomer");
            }
            if let Some(brand) = preferred.get(customer) {
                for product in by_brand.get(brand).into_iter().flatten() {
                    out.add_relation(*customer, "recommendedProduct", *product);
                }
            }
        }

        if self.inconsistent.load(Ordering::SeqCst) {
            out.consistent = false;
        }
        Ok(out)
    }
}

/// Wraps a source and fails its first `failures` full fetches.
pub struct FlakySource {
    pub inner: Arc<dyn ProductSource>,
    pub failures: u32,
    pub calls: AtomicU32,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn ProductSource>, failures: u32) -> Self {
        Self {
            inner,
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProductSource for FlakySource {
    fn products(&self) -> semshop_catalog::Result<Vec<Product>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(CatalogError::Kb(semshop::KbError::Storage(
                "catalog backend timed out".into(),
            )));
        }
        self.inner.products()
    }

    fn product(&self, id: &str) -> semshop_catalog::Result<Option<Product>> {
        self.inner.product(id)
    }
}

/// One catalog row to seed.
pub struct Item<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub brand: &'a str,
    pub category: &'a str,
    pub price: Option<f64>,
    pub stock: i64,
}

pub fn item<'a>(id: &'a str, brand: &'a str, price: f64, stock: i64) -> Item<'a> {
    Item {
        id,
        name: id,
        brand,
        category: "Phones",
        price: Some(price),
        stock,
    }
}

/// Assert products, their brands and categories, then recompute.
pub fn seed(kb: &KnowledgeBase, items: &[Item<'_>]) {
    let mut changes = ChangeSet::new();
    for it in items {
        changes = changes
            .assert(Assertion::class_membership(it.id, "Product"))
            .assert(Assertion::class_membership(it.brand, "Brand"))
            .assert(Assertion::object_relation(it.id, "hasBrand", it.brand))
            .assert(Assertion::object_relation(it.id, "inCategory", it.category))
            .assert(Assertion::data_attribute(it.id, "name", it.name))
            .assert(Assertion::data_attribute(it.id, "stock", it.stock));
        if let Some(price) = it.price {
            changes = changes.assert(Assertion::data_attribute(it.id, "price", price));
        }
    }
    kb.apply(&changes).unwrap();
    kb.ensure_fresh().unwrap();
}

pub fn ids(products: &[Product]) -> Vec<&str> {
    products.iter().map(|p| p.id.as_str()).collect()
}
