//! Catalog search: filter, sort and paginate product projections.
//!
//! The product list is fetched through the retrying fetch. When every
//! attempt fails the search answers over an empty catalog rather than
//! erroring.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::config::CatalogConfig;
use crate::product::{fetch_with_retry, Product, ProductSource};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Price,
    #[default]
    Name,
    Stock,
}

impl SortField {
    /// Unknown names sort by name.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "price" | "precio" => SortField::Price,
            "stock" | "popularidad" | "popularity" => SortField::Stock,
            _ => SortField::Name,
        }
    }
}

impl<'de> Deserialize<'de> for SortField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| Self::parse_lenient(&s)).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Anything but `desc` is ascending.
    pub fn parse_lenient(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("desc") {
            Direction::Desc
        } else {
            Direction::Asc
        }
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| Self::parse_lenient(&s)).unwrap_or_default())
    }
}

/// Search request. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchQuery {
    #[serde(alias = "q")]
    pub text: Option<String>,
    #[serde(alias = "categoria")]
    pub category: Option<String>,
    #[serde(alias = "marca")]
    pub brand: Option<String>,
    #[serde(alias = "precioMin")]
    pub price_min: Option<f64>,
    #[serde(alias = "precioMax")]
    pub price_max: Option<f64>,
    #[serde(alias = "disponible")]
    pub available_only: bool,
    #[serde(alias = "ordenarPor")]
    pub sort_by: SortField,
    #[serde(alias = "direccion")]
    pub direction: Direction,
    #[serde(alias = "pagina")]
    pub page: i64,
    /// Values of zero or less fall back to the configured page size.
    #[serde(alias = "tamanio")]
    pub size: i64,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            text: None,
            category: None,
            brand: None,
            price_min: None,
            price_max: None,
            available_only: false,
            sort_by: SortField::Name,
            direction: Direction::Asc,
            page: 0,
            size: 12,
        }
    }
}

impl SearchQuery {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub fn price_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.price_min = min;
        self.price_max = max;
        self
    }

    pub fn available_only(mut self) -> Self {
        self.available_only = true;
        self
    }

    pub fn sort(mut self, field: SortField, direction: Direction) -> Self {
        self.sort_by = field;
        self.direction = direction;
        self
    }

    pub fn page(mut self, page: i64, size: i64) -> Self {
        self.page = page;
        self.size = size;
        self
    }

    /// Blank strings become `None`; a non-positive size becomes `default_size`.
    fn normalized(mut self, default_size: usize) -> Self {
        for field in [&mut self.text, &mut self.category, &mut self.brand] {
            if field.as_deref().is_some_and(|s| s.trim().is_empty()) {
                *field = None;
            }
        }
        if self.size <= 0 {
            self.size = default_size.max(1) as i64;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub products: Vec<Product>,
    pub page: i64,
    pub size: i64,
    /// Matches after filtering, before pagination.
    pub total_elements: usize,
    pub total_pages: usize,
    pub first: bool,
    pub last: bool,
    pub sort_by: SortField,
    pub direction: Direction,
    /// The query as applied, after normalisation.
    pub filters: SearchQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

/// Filter, sort and paginate `products` for `query`.
pub fn run_pipeline(query: SearchQuery, products: Vec<Product>, default_size: usize) -> SearchResult {
    let query = query.normalized(default_size);
    let needle = query.text.as_ref().map(|t| t.trim().to_lowercase());

    let mut matches: Vec<Product> = products
        .into_iter()
        .filter(|p| needle.as_deref().map_or(true, |n| matches_text(p, n)))
        .filter(|p| matches_exact(p.category.as_deref(), query.category.as_deref()))
        .filter(|p| matches_exact(p.brand.as_deref(), query.brand.as_deref()))
        .filter(|p| in_price_range(p.price, query.price_min, query.price_max))
        .filter(|p| !query.available_only || p.in_stock())
        .collect();

    matches.sort_by(|a, b| {
        let ord = compare(a, b, query.sort_by);
        match query.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });

    let total_elements = matches.len();
    let size = query.size as usize;
    let total_pages = total_elements.div_ceil(size);
    let products = if query.page < 0 {
        Vec::new()
    } else {
        let start = (query.page as usize).saturating_mul(size);
        matches.into_iter().skip(start).take(size).collect()
    };

    SearchResult {
        products,
        page: query.page,
        size: query.size,
        total_elements,
        total_pages,
        first: query.page == 0,
        last: query.page < 0 || (query.page as usize) + 1 >= total_pages,
        sort_by: query.sort_by,
        direction: query.direction,
        filters: query,
    }
}

fn matches_text(p: &Product, needle: &str) -> bool {
    let fields = [
        Some(p.name.as_str()),
        p.brand.as_deref(),
        p.category.as_deref(),
        p.description.as_deref(),
        Some(p.kind.label()),
    ];
    fields
        .into_iter()
        .flatten()
        .any(|f| f.to_lowercase().contains(needle))
}

fn matches_exact(value: Option<&str>, wanted: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(w) => value.is_some_and(|v| v.eq_ignore_ascii_case(w.trim())),
    }
}

/// A product without a price never matches a price filter.
fn in_price_range(price: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(price) = price else {
        return false;
    };
    min.map_or(true, |m| price >= m) && max.map_or(true, |m| price <= m)
}

fn compare(a: &Product, b: &Product, field: SortField) -> Ordering {
    match field {
        SortField::Price => a.price.unwrap_or(0.0).total_cmp(&b.price.unwrap_or(0.0)),
        SortField::Stock => a.stock.unwrap_or(0).cmp(&b.stock.unwrap_or(0)),
        SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    }
}

/// Search and facet queries over a [`ProductSource`].
pub struct CatalogSearch {
    source: Arc<dyn ProductSource>,
    config: Arc<CatalogConfig>,
}

impl CatalogSearch {
    pub fn new(source: Arc<dyn ProductSource>, config: Arc<CatalogConfig>) -> Self {
        Self { source, config }
    }

    /// Product list, or an empty one once retries are exhausted.
    fn products(&self) -> Vec<Product> {
        fetch_with_retry(self.source.as_ref(), &self.config.retry).unwrap_or_else(|e| {
            warn!(error = %e, "catalog unavailable; answering over an empty catalog");
            Vec::new()
        })
    }

    pub fn search(&self, query: SearchQuery) -> SearchResult {
        let result = run_pipeline(query, self.products(), self.config.page_size);
        debug!(
            total = result.total_elements,
            page = result.page,
            returned = result.products.len(),
            "search finished"
        );
        result
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        distinct_sorted(self.products().into_iter().filter_map(|p| p.category))
    }

    /// Distinct brands, sorted.
    pub fn brands(&self) -> Vec<String> {
        distinct_sorted(self.products().into_iter().filter_map(|p| p.brand))
    }

    /// Lowest and highest known price. `None` when no product has a price.
    pub fn price_range(&self) -> Option<PriceRange> {
        self.products()
            .iter()
            .filter_map(|p| p.price)
            .fold(None, |acc, price| match acc {
                None => Some(PriceRange {
                    min: price,
                    max: price,
                }),
                Some(r) => Some(PriceRange {
                    min: r.min.min(price),
                    max: r.max.max(price),
                }),
            })
    }

    /// Up to `limit` distinct product names containing `text`, sorted.
    pub fn suggestions(&self, text: &str, limit: usize) -> Vec<String> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut seen = BTreeSet::new();
        let mut names: Vec<String> = self
            .products()
            .into_iter()
            .map(|p| p.name)
            .filter(|n| n.to_lowercase().contains(&needle))
            .filter(|n| seen.insert(n.clone()))
            .take(limit)
            .collect();
        names.sort();
        names
    }
}

fn distinct_sorted(values: impl Iterator<Item = String>) -> Vec<String> {
    values.collect::<BTreeSet<_>>().into_iter().collect()
}
