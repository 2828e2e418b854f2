//! Storefront catalog on top of the SemShop knowledge base.
//!
//! [`Catalog`] is the surface request handlers call: compatibility and stock
//! checks, search with facets, personalised recommendations and profile
//! synchronization.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use semshop::{KnowledgeBase, NoInference};
//! use semshop_catalog::{Catalog, CatalogConfig, EntityProfile, SearchQuery};
//!
//! let kb = Arc::new(KnowledgeBase::open("./shop.semshop", NoInference).unwrap());
//! let catalog = Catalog::new(kb, CatalogConfig::from_env().unwrap());
//!
//! catalog.sync_entity(&EntityProfile::new("alice").with_brand("Acme"));
//! let picks = catalog.recommend_for("alice").unwrap();
//! let page = catalog.search(SearchQuery::default().brand("Acme").available_only());
//! ```

pub mod analytics;
pub mod config;
pub mod product;
pub mod profile;
pub mod recommend;
pub mod search;
pub mod sync;

use std::sync::Arc;

use semshop::{KbError, KnowledgeBase, PatternEngine, QueryGateway, Row};
use tracing::info;

pub use analytics::Analytics;
pub use config::{CatalogConfig, RetryPolicy, Vocabulary};
pub use product::{KnowledgeCatalog, Product, ProductKind, ProductSource};
pub use profile::{DirectoryError, EntityDirectory, EntityProfile, InMemoryDirectory};
pub use recommend::{
    CustomerSummary, CustomerTier, Degradation, RecommendationComposer, RecommendationResult,
    Signal,
};
pub use search::{CatalogSearch, Direction, PriceRange, SearchQuery, SearchResult, SortField};
pub use sync::{EntitySynchronizer, SyncOutcome};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Kb(#[from] KbError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("unknown product: {0}")]
    UnknownProduct(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Everything a storefront needs, sharing one knowledge base.
pub struct Catalog {
    kb: Arc<KnowledgeBase>,
    config: Arc<CatalogConfig>,
    source: Arc<dyn ProductSource>,
    synchronizer: EntitySynchronizer,
    composer: RecommendationComposer,
    search: CatalogSearch,
    gateway: Option<QueryGateway>,
}

impl Catalog {
    /// Catalog whose products are projected straight from `kb`.
    ///
    /// With the `sparql` feature a SPARQL pattern engine is wired in.
    pub fn new(kb: Arc<KnowledgeBase>, config: CatalogConfig) -> Self {
        let source: Arc<dyn ProductSource> = Arc::new(KnowledgeCatalog::new(
            Arc::clone(&kb),
            config.vocabulary.clone(),
        ));
        #[allow(unused_mut)]
        let mut catalog = Self::with_source(kb, config, source);
        #[cfg(feature = "sparql")]
        {
            let engine = semshop::OxigraphEngine::new(catalog.config.namespace.clone());
            catalog = catalog.with_pattern_engine(engine);
        }
        catalog
    }

    /// Catalog reading products from a custom source.
    pub fn with_source(
        kb: Arc<KnowledgeBase>,
        config: CatalogConfig,
        source: Arc<dyn ProductSource>,
    ) -> Self {
        let config = Arc::new(config);
        info!(namespace = %config.namespace, "catalog ready");
        Self {
            synchronizer: EntitySynchronizer::new(Arc::clone(&kb), Arc::clone(&config)),
            composer: RecommendationComposer::new(
                Arc::clone(&kb),
                Arc::clone(&source),
                Arc::clone(&config),
            ),
            search: CatalogSearch::new(Arc::clone(&source), Arc::clone(&config)),
            kb,
            config,
            source,
            gateway: None,
        }
    }

    pub fn with_pattern_engine(mut self, engine: impl PatternEngine + 'static) -> Self {
        self.gateway = Some(QueryGateway::new(Box::new(engine)));
        self
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Recompute entailments if anything changed since the last run.
    pub fn refresh(&self) -> Result<()> {
        self.kb.ensure_fresh()?;
        Ok(())
    }

    // -- compatibility and stock ------------------------------------------

    /// Whether `a` is entailed to be compatible with `b`. Unknown ids are not.
    pub fn check_compatible(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self
            .kb
            .relation_values(a, &self.config.vocabulary.compatible_with)?
            .contains(b))
    }

    /// Asserted stock count, if the product has one.
    pub fn check_stock(&self, product_id: &str) -> Result<Option<i64>> {
        Ok(self
            .kb
            .data_attribute(product_id, &self.config.vocabulary.stock)?
            .and_then(|l| l.as_i64()))
    }

    pub fn product(&self, product_id: &str) -> Result<Option<Product>> {
        self.source.product(product_id)
    }

    pub fn compatible_products(&self, product_id: &str) -> Result<Vec<Product>> {
        self.related_products(product_id, |p| &p.compatible)
    }

    pub fn incompatible_products(&self, product_id: &str) -> Result<Vec<Product>> {
        self.related_products(product_id, |p| &p.incompatible)
    }

    fn related_products(
        &self,
        product_id: &str,
        related: impl Fn(&Product) -> &std::collections::BTreeSet<String>,
    ) -> Result<Vec<Product>> {
        let product = self
            .source
            .product(product_id)?
            .ok_or_else(|| CatalogError::UnknownProduct(product_id.to_string()))?;
        let mut out = Vec::new();
        for id in related(&product) {
            if let Some(p) = self.source.product(id)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    // -- search -------------------------------------------------------------

    pub fn search(&self, query: SearchQuery) -> SearchResult {
        self.search.search(query)
    }

    pub fn categories(&self) -> Vec<String> {
        self.search.categories()
    }

    pub fn brands(&self) -> Vec<String> {
        self.search.brands()
    }

    pub fn price_range(&self) -> Option<PriceRange> {
        self.search.price_range()
    }

    pub fn suggestions(&self, text: &str, limit: usize) -> Vec<String> {
        self.search.suggestions(text, limit)
    }

    // -- recommendations ----------------------------------------------------

    pub fn recommend_for(&self, entity_id: &str) -> Result<RecommendationResult> {
        self.composer.compose_for(entity_id)
    }

    pub fn accessories_for(&self, product_id: &str) -> Result<Vec<Product>> {
        self.composer.accessories_for(product_id)
    }

    pub fn general_recommendations(&self) -> Result<Vec<Product>> {
        self.composer.general()
    }

    pub fn history_based(&self, entity_id: &str) -> Result<Vec<Product>> {
        self.composer.history_based(entity_id)
    }

    pub fn customer_summary(&self, entity_id: &str) -> Result<CustomerSummary> {
        self.composer.customer_summary(entity_id)
    }

    pub fn customers(&self) -> Result<Vec<CustomerSummary>> {
        self.composer.customers()
    }

    // -- synchronization ----------------------------------------------------

    pub fn sync_entity(&self, profile: &EntityProfile) -> SyncOutcome {
        self.synchronizer.sync_entity(profile)
    }

    pub fn sync_all(&self, directory: &dyn EntityDirectory) -> Result<Vec<(String, SyncOutcome)>> {
        self.synchronizer.sync_all(directory)
    }

    pub fn is_synced(&self, entity_id: &str) -> Result<bool> {
        self.synchronizer.is_synced(entity_id)
    }

    // -- pattern queries ----------------------------------------------------

    fn gateway(&self) -> Result<&QueryGateway> {
        self.gateway.as_ref().ok_or_else(|| {
            CatalogError::Kb(KbError::QueryExecution(
                "no pattern engine configured".into(),
            ))
        })
    }

    pub fn run_query(&self, query: &str) -> Result<Vec<Row>> {
        Ok(self.gateway()?.run_query(&self.kb, query)?)
    }

    pub fn analytics(&self) -> Result<Analytics<'_>> {
        Ok(Analytics::new(self.gateway()?, &self.kb, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semshop::{Assertion, ChangeSet, NoInference};

    fn catalog() -> Catalog {
        let kb = KnowledgeBase::open_in_memory(NoInference).unwrap();
        let mut changes = ChangeSet::new();
        for (id, name, price, stock) in [
            ("phone1", "Acme One", 799.0, 4_i64),
            ("case1", "Acme Case", 19.0, 0),
            ("charger1", "Acme Charger", 29.0, 10),
        ] {
            changes = changes
                .assert(Assertion::class_membership(id, "Product"))
                .assert(Assertion::object_relation(id, "hasBrand", "Acme"))
                .assert(Assertion::data_attribute(id, "name", name))
                .assert(Assertion::data_attribute(id, "price", price))
                .assert(Assertion::data_attribute(id, "stock", stock));
        }
        changes = changes
            .assert(Assertion::class_membership("case1", "Accessory"))
            .assert(Assertion::class_membership("charger1", "Accessory"))
            .assert(Assertion::object_relation("phone1", "compatibleWith", "case1"))
            .assert(Assertion::object_relation("phone1", "compatibleWith", "charger1"))
            .assert(Assertion::object_relation("phone1", "incompatibleWith", "ghost"));
        kb.apply(&changes).unwrap();
        kb.ensure_fresh().unwrap();
        Catalog::new(Arc::new(kb), CatalogConfig::default())
    }

    #[test]
    fn compatibility_follows_derived_relations() {
        let catalog = catalog();
        assert!(catalog.check_compatible("phone1", "case1").unwrap());
        assert!(!catalog.check_compatible("case1", "phone1").unwrap());
        assert!(!catalog.check_compatible("nobody", "phone1").unwrap());
    }

    #[test]
    fn stock_is_read_from_asserted_facts() {
        let catalog = catalog();
        assert_eq!(catalog.check_stock("phone1").unwrap(), Some(4));
        assert_eq!(catalog.check_stock("case1").unwrap(), Some(0));
        assert_eq!(catalog.check_stock("nobody").unwrap(), None);
    }

    #[test]
    fn related_products_skip_unknown_ids() {
        let catalog = catalog();
        let compatible: Vec<String> = catalog
            .compatible_products("phone1")
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(compatible, vec!["case1", "charger1"]);
        assert!(catalog.incompatible_products("phone1").unwrap().is_empty());
        assert!(matches!(
            catalog.compatible_products("ghost"),
            Err(CatalogError::UnknownProduct(_))
        ));
    }

    #[test]
    fn accessories_exclude_out_of_stock() {
        let catalog = catalog();
        let ids: Vec<String> = catalog
            .accessories_for("phone1")
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["charger1"]);
    }

    #[test]
    fn facets_come_from_the_source() {
        let catalog = catalog();
        assert_eq!(catalog.brands(), vec!["Acme"]);
        let range = catalog.price_range().unwrap();
        assert_eq!((range.min, range.max), (19.0, 799.0));
    }

    #[test]
    fn refresh_picks_up_new_facts() {
        let catalog = catalog();
        let kb = catalog.knowledge_base();
        kb.assert(Assertion::class_membership("tab1", "Product")).unwrap();
        assert!(catalog.product("tab1").unwrap().is_none());

        catalog.refresh().unwrap();
        assert!(catalog.product("tab1").unwrap().is_some());
    }

    #[cfg(not(feature = "sparql"))]
    #[test]
    fn queries_need_a_pattern_engine() {
        let catalog = Catalog::new(
            Arc::new(KnowledgeBase::open_in_memory(NoInference).unwrap()),
            CatalogConfig::default(),
        );
        let err = catalog.run_query("SELECT ?s WHERE { ?s ?p ?o }").unwrap_err();
        assert!(err.to_string().contains("no pattern engine configured"));
        assert!(catalog.analytics().is_err());
    }
}
