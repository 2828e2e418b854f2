//! Inference lifecycle: when to recompute entailments, and who may.
//!
//! The external engine is expensive and non-incremental, so its output is
//! cached as a [`DerivedFacts`] snapshot guarded by a small state machine:
//!
//! ```text
//!            assert / retract
//!   Fresh ─────────────────────▶ Stale ◀──── failure ───┐
//!     ▲                            │                     │
//!     └──────── success ──── Computing ◀─ ensure_fresh ──┘
//! ```
//!
//! Only one recomputation runs at a time. Callers arriving while one is in
//! flight block on it and then see its result instead of starting another.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::assertion::Assertion;
use crate::fact_store::{FactSnapshot, FactStore};
use crate::{KbError, Result};

/// Failure reported by an [`InferenceEngine`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineFailure(pub String);

/// Black-box reasoner over a fact snapshot.
///
/// Implementations may return only the facts they newly entail: the
/// lifecycle unions the snapshot's asserted memberships and relations into
/// every result.
pub trait InferenceEngine: Send + Sync {
    fn infer(&self, facts: &FactSnapshot) -> std::result::Result<Entailments, EngineFailure>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Arc<E> {
    fn infer(&self, facts: &FactSnapshot) -> std::result::Result<Entailments, EngineFailure> {
        (**self).infer(facts)
    }
}

/// Raw engine output.
#[derive(Debug, Clone, PartialEq)]
pub struct Entailments {
    /// individual → entailed classes.
    pub classes: BTreeMap<String, BTreeSet<String>>,
    /// subject → relation → entailed targets.
    pub relations: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// `false` when the engine derived a contradiction.
    pub consistent: bool,
}

impl Default for Entailments {
    fn default() -> Self {
        Self::new()
    }
}

impl Entailments {
    /// An empty, consistent result.
    pub fn new() -> Self {
        Self {
            classes: BTreeMap::new(),
            relations: BTreeMap::new(),
            consistent: true,
        }
    }

    pub fn add_class(&mut self, individual: impl Into<String>, class: impl Into<String>) {
        self.classes
            .entry(individual.into())
            .or_default()
            .insert(class.into());
    }

    pub fn add_relation(
        &mut self,
        subject: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) {
        self.relations
            .entry(subject.into())
            .or_default()
            .entry(relation.into())
            .or_default()
            .insert(object.into());
    }
}

/// Engine that entails nothing beyond what is asserted.
///
/// Useful when no reasoner is wired in: class and relation queries then
/// answer from asserted facts, still through the same freshness rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInference;

impl InferenceEngine for NoInference {
    fn infer(&self, _facts: &FactSnapshot) -> std::result::Result<Entailments, EngineFailure> {
        Ok(Entailments::new())
    }
}

/// Where the derived cache is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Stale,
    Computing,
    Fresh,
}

/// Materialised entailments for one store revision.
#[derive(Debug, Clone)]
pub struct DerivedFacts {
    revision: u64,
    computed_at: Option<DateTime<Utc>>,
    consistent: bool,
    classes: BTreeMap<String, BTreeSet<String>>,
    relations: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    instances: BTreeMap<String, BTreeSet<String>>,
}

impl DerivedFacts {
    /// Placeholder before the first recomputation.
    fn empty() -> Self {
        Self {
            revision: 0,
            computed_at: None,
            consistent: true,
            classes: BTreeMap::new(),
            relations: BTreeMap::new(),
            instances: BTreeMap::new(),
        }
    }

    fn build(snapshot: &FactSnapshot, entailments: Entailments, at: DateTime<Utc>) -> Self {
        let Entailments {
            mut classes,
            mut relations,
            consistent,
        } = entailments;

        for assertion in snapshot.assertions() {
            match assertion {
                Assertion::ClassMembership { individual, class } => {
                    classes
                        .entry(individual.clone())
                        .or_default()
                        .insert(class.clone());
                }
                Assertion::ObjectRelation {
                    subject,
                    relation,
                    object,
                } => {
                    relations
                        .entry(subject.clone())
                        .or_default()
                        .entry(relation.clone())
                        .or_default()
                        .insert(object.clone());
                }
                Assertion::DataAttribute { .. } => {}
            }
        }

        let mut instances: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (individual, set) in &classes {
            for class in set {
                instances
                    .entry(class.clone())
                    .or_default()
                    .insert(individual.clone());
            }
        }

        Self {
            revision: snapshot.revision(),
            computed_at: Some(at),
            consistent,
            classes,
            relations,
            instances,
        }
    }

    /// Store revision this snapshot was computed from.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// `None` until the first successful recomputation.
    pub fn computed_at(&self) -> Option<DateTime<Utc>> {
        self.computed_at
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent
    }

    pub fn classes_of(&self, individual: &str) -> BTreeSet<String> {
        self.classes.get(individual).cloned().unwrap_or_default()
    }

    pub fn relation_values(&self, individual: &str, relation: &str) -> BTreeSet<String> {
        self.relations
            .get(individual)
            .and_then(|r| r.get(relation))
            .cloned()
            .unwrap_or_default()
    }

    pub fn instances_of(&self, class: &str) -> BTreeSet<String> {
        self.instances.get(class).cloned().unwrap_or_default()
    }

    /// Every class with at least one entailed instance, sorted.
    pub fn class_names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn individual_count(&self) -> usize {
        self.classes.len()
    }

    /// Every entailed membership and relation, asserted ones included.
    pub fn entailed_assertions(&self) -> impl Iterator<Item = Assertion> + '_ {
        let classes = self.classes.iter().flat_map(|(individual, set)| {
            set.iter()
                .map(move |class| Assertion::class_membership(individual.clone(), class.clone()))
        });
        let relations = self.relations.iter().flat_map(|(subject, by_relation)| {
            by_relation.iter().flat_map(move |(relation, targets)| {
                targets.iter().map(move |object| {
                    Assertion::object_relation(subject.clone(), relation.clone(), object.clone())
                })
            })
        });
        classes.chain(relations)
    }
}

struct CacheSlot {
    state: CacheState,
    derived: Arc<DerivedFacts>,
}

/// Owns the derived-fact cache and every transition of its state.
pub struct InferenceLifecycle {
    engine: Box<dyn InferenceEngine>,
    /// Held for the whole duration of a recomputation.
    recompute: Mutex<()>,
    slot: RwLock<CacheSlot>,
    runs: AtomicU64,
}

impl InferenceLifecycle {
    pub fn new(engine: Box<dyn InferenceEngine>) -> Self {
        Self {
            engine,
            recompute: Mutex::new(()),
            slot: RwLock::new(CacheSlot {
                state: CacheState::Stale,
                derived: Arc::new(DerivedFacts::empty()),
            }),
            runs: AtomicU64::new(0),
        }
    }

    fn slot_read(&self) -> Result<RwLockReadGuard<'_, CacheSlot>> {
        self.slot
            .read()
            .map_err(|_| KbError::Internal("derived cache lock poisoned".into()))
    }

    fn slot_write(&self) -> Result<RwLockWriteGuard<'_, CacheSlot>> {
        self.slot
            .write()
            .map_err(|_| KbError::Internal("derived cache lock poisoned".into()))
    }

    pub fn state(&self) -> Result<CacheState> {
        Ok(self.slot_read()?.state)
    }

    /// Last-known snapshot, fresh or not. Never blocks on a recomputation.
    pub fn derived(&self) -> Result<Arc<DerivedFacts>> {
        Ok(Arc::clone(&self.slot_read()?.derived))
    }

    /// Number of engine runs started so far, successful or not.
    pub fn recomputations(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Mark the cache stale. The caller must hold the fact-set write guard so
    /// that no reader sees the new facts paired with a `Fresh` state.
    pub(crate) fn invalidate(&self) -> Result<()> {
        let mut slot = self.slot_write()?;
        slot.state = CacheState::Stale;
        Ok(())
    }

    /// Bring the cache up to date with `store`, recomputing if needed.
    ///
    /// On engine failure the previous snapshot stays in place, the state
    /// returns to `Stale`, and [`KbError::InferenceFailure`] is returned.
    pub fn ensure_fresh(&self, store: &FactStore) -> Result<Arc<DerivedFacts>> {
        {
            let slot = self.slot_read()?;
            if slot.state == CacheState::Fresh {
                return Ok(Arc::clone(&slot.derived));
            }
        }

        let _flight = self
            .recompute
            .lock()
            .map_err(|_| KbError::Internal("recompute lock poisoned".into()))?;

        // Lock order everywhere: fact set, then cache slot.
        let snapshot = {
            let facts = store.read()?;
            let mut slot = self.slot_write()?;
            if slot.state == CacheState::Fresh {
                // Someone else finished while we waited.
                return Ok(Arc::clone(&slot.derived));
            }
            slot.state = CacheState::Computing;
            facts.snapshot()
        };

        let revision = snapshot.revision();
        let started = Instant::now();
        info!(revision, assertions = snapshot.len(), "recomputing entailments");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.engine.infer(&snapshot)))
            .unwrap_or_else(|_| Err(EngineFailure("inference engine panicked".into())));
        self.runs.fetch_add(1, Ordering::SeqCst);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let facts = store.read()?;
        let mut slot = self.slot_write()?;
        match outcome {
            Ok(entailments) => {
                let derived = Arc::new(DerivedFacts::build(&snapshot, entailments, Utc::now()));
                slot.derived = Arc::clone(&derived);
                slot.state = if facts.revision == revision {
                    CacheState::Fresh
                } else {
                    CacheState::Stale
                };
                let state = slot.state;
                drop(slot);
                drop(facts);

                if !derived.is_consistent() {
                    error!(
                        revision,
                        "knowledge base is logically inconsistent; serving best available entailments"
                    );
                }
                info!(revision, elapsed_ms, ?state, "recomputation finished");
                Ok(derived)
            }
            Err(e) => {
                slot.state = CacheState::Stale;
                drop(slot);
                drop(facts);
                warn!(revision, elapsed_ms, error = %e, "recomputation failed; keeping last-known-good snapshot");
                Err(KbError::InferenceFailure(e.0))
            }
        }
    }
}
