//! SemShop knowledge base: a durable fact store with cached entailments.
//!
//! The core primitive is an [`Assertion`]: a class membership, an object
//! relation or a data attribute about a named individual. Assertions live in
//! a durable [`FactStore`]. An external [`InferenceEngine`] turns them into
//! [`DerivedFacts`], which are expensive to compute and therefore cached.
//!
//! **Asserted reads** ([`KnowledgeBase::data_attribute`]) see every write
//! immediately. **Entailed reads** ([`KnowledgeBase::classes_of`],
//! [`KnowledgeBase::relation_values`]) answer from the last computed
//! snapshot and only move forward when [`KnowledgeBase::ensure_fresh`] runs.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use semshop::{Assertion, KnowledgeBase, NoInference};
//!
//! let kb = KnowledgeBase::open("catalog.semshop", NoInference).unwrap();
//!
//! kb.assert(Assertion::class_membership("phone1", "Product")).unwrap();
//! kb.assert(Assertion::object_relation("phone1", "hasBrand", "Acme")).unwrap();
//!
//! // Entailed reads lag until the next recomputation.
//! assert!(kb.classes_of("phone1").unwrap().is_empty());
//! kb.ensure_fresh().unwrap();
//! assert!(kb.classes_of("phone1").unwrap().contains("Product"));
//! ```

pub mod assertion;
pub mod fact_store;
pub mod inference;
pub mod pattern;
#[cfg(feature = "sparql")]
pub mod sparql;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

pub use assertion::{Assertion, Literal};
pub use fact_store::{ChangeSet, ChangeSummary, FactSnapshot, FactStore};
pub use inference::{
    CacheState, DerivedFacts, EngineFailure, Entailments, InferenceEngine, InferenceLifecycle,
    NoInference,
};
pub use pattern::{
    Binding, Bindings, PatternEngine, PatternEngineError, PatternQuery, QueryForm, QueryGateway, Row,
};
#[cfg(feature = "sparql")]
pub use sparql::OxigraphEngine;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("malformed assertion: {0}")]
    MalformedAssertion(String),
    #[error("inference failure: {0}")]
    InferenceFailure(String),
    #[error("query execution error: {0}")]
    QueryExecution(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for KbError {
    fn from(e: redb::DatabaseError) -> Self {
        KbError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for KbError {
    fn from(e: redb::TransactionError) -> Self {
        KbError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for KbError {
    fn from(e: redb::TableError) -> Self {
        KbError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for KbError {
    fn from(e: redb::StorageError) -> Self {
        KbError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for KbError {
    fn from(e: redb::CommitError) -> Self {
        KbError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KbError>;

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

/// Counts reported by [`KnowledgeBase::info`].
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseInfo {
    pub assertions: usize,
    pub individuals: usize,
    pub classes: usize,
    pub revision: u64,
    pub derived_revision: u64,
    pub state: CacheState,
    pub consistent: bool,
}

/// A fact store paired with the lifecycle of its derived entailments.
///
/// Owned explicitly (usually behind an `Arc`) and shared by every request
/// handler; there is no process-wide instance. `Send + Sync`.
pub struct KnowledgeBase {
    store: FactStore,
    lifecycle: InferenceLifecycle,
}

impl KnowledgeBase {
    /// Open or create a knowledge base at the given path.
    pub fn open(path: &str, engine: impl InferenceEngine + 'static) -> Result<Self> {
        let store = FactStore::open(path)?;
        info!(path, assertions = store.len()?, "knowledge base opened");
        Ok(Self::with_store(store, engine))
    }

    /// Create an in-memory knowledge base (no file I/O).
    pub fn open_in_memory(engine: impl InferenceEngine + 'static) -> Result<Self> {
        Ok(Self::with_store(FactStore::open_in_memory()?, engine))
    }

    fn with_store(store: FactStore, engine: impl InferenceEngine + 'static) -> Self {
        Self {
            store,
            lifecycle: InferenceLifecycle::new(Box::new(engine)),
        }
    }

    /// Shut the knowledge base down. Pending writes are already committed.
    pub fn close(self) -> Result<()> {
        let assertions = self.store.len()?;
        info!(
            assertions,
            recomputations = self.lifecycle.recomputations(),
            "knowledge base closed"
        );
        Ok(())
    }

    /// Add one assertion. Returns `false` when it was already present.
    ///
    /// A new fact marks the derived cache stale.
    pub fn assert(&self, assertion: Assertion) -> Result<bool> {
        let summary = self.apply(&ChangeSet::new().assert(assertion))?;
        Ok(summary.asserted > 0)
    }

    /// Remove one assertion. Returns `false` when it was not present.
    pub fn retract(&self, assertion: Assertion) -> Result<bool> {
        let summary = self.apply(&ChangeSet::new().retract(assertion))?;
        Ok(summary.retracted > 0)
    }

    /// Apply a batch atomically: one redb transaction, one revision bump.
    pub fn apply(&self, changes: &ChangeSet) -> Result<ChangeSummary> {
        let mut facts = self.store.write()?;
        let summary = self.store.apply_locked(&mut facts, changes)?;
        if summary.changed() {
            // Still under the fact-set write lock.
            self.lifecycle.invalidate()?;
            debug!(
                asserted = summary.asserted,
                retracted = summary.retracted,
                revision = summary.revision,
                "facts changed"
            );
        }
        Ok(summary)
    }

    /// Recompute entailments unless the cache is already fresh.
    ///
    /// Blocks for the duration of a recomputation, including one started by
    /// another caller.
    pub fn ensure_fresh(&self) -> Result<Arc<DerivedFacts>> {
        self.lifecycle.ensure_fresh(&self.store)
    }

    pub fn state(&self) -> Result<CacheState> {
        self.lifecycle.state()
    }

    /// Last-known derived snapshot, without recomputing.
    pub fn derived(&self) -> Result<Arc<DerivedFacts>> {
        self.lifecycle.derived()
    }

    pub fn recomputations(&self) -> u64 {
        self.lifecycle.recomputations()
    }

    /// Entailed classes of `individual`. Empty for unknown individuals.
    pub fn classes_of(&self, individual: &str) -> Result<BTreeSet<String>> {
        Ok(self.derived()?.classes_of(individual))
    }

    /// Entailed targets of `relation` from `individual`.
    pub fn relation_values(&self, individual: &str, relation: &str) -> Result<BTreeSet<String>> {
        Ok(self.derived()?.relation_values(individual, relation))
    }

    /// Entailed instances of `class`.
    pub fn instances_of(&self, class: &str) -> Result<BTreeSet<String>> {
        Ok(self.derived()?.instances_of(class))
    }

    /// First asserted value of `attribute`. Data attributes are not inferred.
    pub fn data_attribute(&self, individual: &str, attribute: &str) -> Result<Option<Literal>> {
        self.store.data_attribute(individual, attribute)
    }

    /// `false` when the last recomputation entailed a contradiction.
    pub fn consistency_check(&self) -> Result<bool> {
        Ok(self.derived()?.is_consistent())
    }

    pub fn assertions_about(&self, individual: &str) -> Result<Vec<Assertion>> {
        self.store.assertions_about(individual)
    }

    pub fn asserted_instances_of(&self, class: &str) -> Result<BTreeSet<String>> {
        self.store.asserted_instances_of(class)
    }

    /// Copy of the asserted facts, for pattern queries and exports.
    pub fn fact_snapshot(&self) -> Result<FactSnapshot> {
        self.store.snapshot()
    }

    /// Asserted facts plus the last derived entailments, deduplicated.
    ///
    /// This is what pattern queries run against. The revision is the
    /// asserted one.
    pub fn query_snapshot(&self) -> Result<FactSnapshot> {
        let (revision, mut keys, mut assertions) = {
            let facts = self.store.read()?;
            (
                facts.revision,
                facts.assertions.keys().cloned().collect::<BTreeSet<_>>(),
                facts.assertions.values().cloned().collect::<Vec<_>>(),
            )
        };
        for assertion in self.derived()?.entailed_assertions() {
            if keys.insert(assertion.key()?) {
                assertions.push(assertion);
            }
        }
        Ok(FactSnapshot::new(revision, assertions))
    }

    /// Classes with at least one entailed instance, sorted.
    pub fn class_names(&self) -> Result<Vec<String>> {
        Ok(self.derived()?.class_names())
    }

    /// Entailed instances of `class`, sorted.
    pub fn individual_names(&self, class: &str) -> Result<Vec<String>> {
        Ok(self.instances_of(class)?.into_iter().collect())
    }

    pub fn info(&self) -> Result<KnowledgeBaseInfo> {
        let (assertions, revision) = {
            let facts = self.store.read()?;
            (facts.assertions.len(), facts.revision)
        };
        let derived = self.derived()?;
        Ok(KnowledgeBaseInfo {
            assertions,
            individuals: derived.individual_count(),
            classes: derived.class_names().len(),
            revision,
            derived_revision: derived.revision(),
            state: self.state()?,
            consistent: derived.is_consistent(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
