//! Canned analytics queries run through the pattern gateway.
//!
//! Query text is built from the configured namespace and vocabulary, so the
//! same reports work against a renamed ontology.

use semshop::{KnowledgeBase, QueryGateway, Row};

use crate::config::CatalogConfig;
use crate::Result;

pub struct Analytics<'a> {
    gateway: &'a QueryGateway,
    kb: &'a KnowledgeBase,
    config: &'a CatalogConfig,
}

impl<'a> Analytics<'a> {
    pub fn new(gateway: &'a QueryGateway, kb: &'a KnowledgeBase, config: &'a CatalogConfig) -> Self {
        Self {
            gateway,
            kb,
            config,
        }
    }

    fn prefix(&self) -> String {
        format!("PREFIX : <{}>\n", self.config.namespace)
    }

    /// In-stock products with at most `threshold` units left, lowest first.
    pub fn low_stock_query(&self, threshold: i64) -> String {
        let v = &self.config.vocabulary;
        format!(
            "{prefix}SELECT ?product ?name ?stock ?price WHERE {{\n  \
             ?product a :{product} ; :{name} ?name ; :{stock} ?stock .\n  \
             OPTIONAL {{ ?product :{price} ?price }}\n  \
             FILTER(?stock <= {threshold} && ?stock > 0)\n\
             }} ORDER BY ?stock",
            prefix = self.prefix(),
            product = v.product_class,
            name = v.name,
            stock = v.stock,
            price = v.price,
        )
    }

    /// Products priced within `[min, max]`, cheapest first.
    pub fn price_range_query(&self, min: f64, max: f64) -> String {
        let v = &self.config.vocabulary;
        format!(
            "{prefix}SELECT ?product ?name ?price ?brand WHERE {{\n  \
             ?product a :{product} ; :{name} ?name ; :{price} ?price .\n  \
             OPTIONAL {{ ?product :{has_brand} ?brand }}\n  \
             FILTER(?price >= {min:?} && ?price <= {max:?})\n\
             }} ORDER BY ?price",
            prefix = self.prefix(),
            product = v.product_class,
            name = v.name,
            price = v.price,
            has_brand = v.has_brand,
        )
    }

    /// Premium customers with their order counts, busiest first.
    pub fn premium_customers_query(&self) -> String {
        let v = &self.config.vocabulary;
        format!(
            "{prefix}SELECT ?customer ?name (COUNT(?order) AS ?orders) WHERE {{\n  \
             ?customer a :{premium} .\n  \
             OPTIONAL {{ ?customer :{name} ?name }}\n  \
             OPTIONAL {{ ?customer :{placed_order} ?order }}\n\
             }} GROUP BY ?customer ?name ORDER BY DESC(?orders) ?customer",
            prefix = self.prefix(),
            premium = v.premium_customer_class,
            name = v.name,
            placed_order = v.placed_order,
        )
    }

    /// Product count per brand, largest first.
    pub fn products_per_brand_query(&self) -> String {
        let v = &self.config.vocabulary;
        format!(
            "{prefix}SELECT ?brand (COUNT(?product) AS ?products) WHERE {{\n  \
             ?product a :{product} ; :{has_brand} ?brand .\n\
             }} GROUP BY ?brand ORDER BY DESC(?products) ?brand",
            prefix = self.prefix(),
            product = v.product_class,
            has_brand = v.has_brand,
        )
    }

    pub fn low_stock(&self, threshold: i64) -> Result<Vec<Row>> {
        self.run(&self.low_stock_query(threshold))
    }

    pub fn products_in_price_range(&self, min: f64, max: f64) -> Result<Vec<Row>> {
        self.run(&self.price_range_query(min, max))
    }

    pub fn premium_customers(&self) -> Result<Vec<Row>> {
        self.run(&self.premium_customers_query())
    }

    pub fn products_per_brand(&self) -> Result<Vec<Row>> {
        self.run(&self.products_per_brand_query())
    }

    fn run(&self, query: &str) -> Result<Vec<Row>> {
        Ok(self.gateway.run_query(self.kb, query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semshop::{
        Bindings, FactSnapshot, NoInference, PatternEngine, PatternEngineError, PatternQuery,
    };
    use std::sync::{Arc, Mutex};

    /// Records every query it receives and answers with no rows.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl PatternEngine for Recorder {
        fn execute(
            &self,
            query: &PatternQuery,
            _facts: &FactSnapshot,
        ) -> std::result::Result<Vec<Bindings>, PatternEngineError> {
            self.seen.lock().unwrap().push(query.text().to_string());
            Ok(Vec::new())
        }
    }

    #[test]
    fn canned_queries_pass_gateway_validation() {
        let recorder = Arc::new(Recorder::default());
        let gateway = QueryGateway::new(Box::new(Arc::clone(&recorder)));
        let kb = KnowledgeBase::open_in_memory(NoInference).unwrap();
        let config = CatalogConfig::default();
        let analytics = Analytics::new(&gateway, &kb, &config);

        analytics.low_stock(5).unwrap();
        analytics.products_in_price_range(100.0, 200.0).unwrap();
        analytics.premium_customers().unwrap();
        analytics.products_per_brand().unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].contains("FILTER(?stock <= 5 && ?stock > 0)"));
        assert!(seen[1].contains("?price >= 100.0 && ?price <= 200.0"));
        assert!(seen[2].contains("a :PremiumCustomer"));
        assert!(seen
            .iter()
            .all(|q| q.starts_with("PREFIX : <http://semshop.example/onto#>")));
    }

    #[test]
    fn queries_follow_configured_vocabulary() {
        let recorder = Arc::new(Recorder::default());
        let gateway = QueryGateway::new(Box::new(Arc::clone(&recorder)));
        let kb = KnowledgeBase::open_in_memory(NoInference).unwrap();
        let mut config = CatalogConfig::default();
        config.vocabulary.product_class = "Producto".into();
        config.vocabulary.has_brand = "tieneMarca".into();

        let q = Analytics::new(&gateway, &kb, &config).products_per_brand_query();
        assert!(q.contains("?product a :Producto ; :tieneMarca ?brand"));
    }
}
