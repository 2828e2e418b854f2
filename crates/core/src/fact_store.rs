//! Durable assertion storage.
//!
//! `redb` is the source of truth. An ordered in-memory mirror of every row is
//! rebuilt on open and updated after each successful commit, so reads never
//! open a transaction. Every committed change bumps the store revision, which
//! the inference lifecycle uses to tell whether a derived snapshot is current.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::assertion::{Assertion, Literal, KEY_SEPARATOR};
use crate::{KbError, Result};

/// Canonical assertion key → JSON-encoded [`Assertion`].
const ASSERTIONS: TableDefinition<&str, &str> = TableDefinition::new("assertions");

/// In-memory mirror of the `assertions` table.
pub(crate) struct FactSet {
    pub(crate) assertions: BTreeMap<String, Assertion>,
    pub(crate) revision: u64,
}

impl FactSet {
    fn about<'a>(&'a self, individual: &str) -> impl Iterator<Item = &'a Assertion> + 'a {
        let prefix = format!("{individual}{KEY_SEPARATOR}");
        self.assertions
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, a)| a)
    }

    pub(crate) fn snapshot(&self) -> FactSnapshot {
        FactSnapshot {
            revision: self.revision,
            assertions: self.assertions.values().cloned().collect(),
        }
    }
}

/// An immutable copy of the asserted facts at one revision.
///
/// This is what external engines see; they never touch the live store.
#[derive(Debug, Clone)]
pub struct FactSnapshot {
    revision: u64,
    assertions: Vec<Assertion>,
}

impl FactSnapshot {
    pub fn new(revision: u64, assertions: Vec<Assertion>) -> Self {
        Self {
            revision,
            assertions,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }
}

/// A batch of retractions and assertions applied atomically.
///
/// Retractions are applied first, so a fact present in both lists ends up
/// asserted.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub retract: Vec<Assertion>,
    pub assert: Vec<Assertion>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assert(mut self, assertion: Assertion) -> Self {
        self.assert.push(assertion);
        self
    }

    pub fn retract(mut self, assertion: Assertion) -> Self {
        self.retract.push(assertion);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.retract.is_empty() && self.assert.is_empty()
    }
}

/// What a [`ChangeSet`] actually did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    /// Rows that were not present before.
    pub asserted: usize,
    /// Rows that were present and are now gone.
    pub retracted: usize,
    /// Store revision after the change.
    pub revision: u64,
}

impl ChangeSummary {
    pub fn changed(&self) -> bool {
        self.asserted > 0 || self.retracted > 0
    }
}

/// Assertion store backed by `redb`.
pub struct FactStore {
    db: Database,
    facts: RwLock<FactSet>,
}

impl FactStore {
    /// Open or create a fact store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory fact store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(ASSERTIONS)?;
            write_txn.commit()?;
        }
        let assertions = Self::load_from_db(&db)?;
        debug!(rows = assertions.len(), "fact store loaded");
        Ok(Self {
            db,
            facts: RwLock::new(FactSet {
                assertions,
                revision: 0,
            }),
        })
    }

    /// Read every persisted row and rebuild the in-memory mirror.
    fn load_from_db(db: &Database) -> Result<BTreeMap<String, Assertion>> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ASSERTIONS)?;
        let mut assertions = BTreeMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let assertion: Assertion = serde_json::from_str(v.value())?;
            assertions.insert(k.value().to_string(), assertion);
        }
        Ok(assertions)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, FactSet>> {
        self.facts
            .read()
            .map_err(|_| KbError::Internal("fact set lock poisoned".into()))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, FactSet>> {
        self.facts
            .write()
            .map_err(|_| KbError::Internal("fact set lock poisoned".into()))
    }

    /// Apply `changes` while the caller holds the write guard.
    ///
    /// Every assertion is validated before anything is written; a malformed
    /// one rejects the whole batch. The revision only moves when a row was
    /// actually inserted or removed.
    pub(crate) fn apply_locked(
        &self,
        facts: &mut FactSet,
        changes: &ChangeSet,
    ) -> Result<ChangeSummary> {
        // Desired end state per touched key: `None` = absent.
        let mut plan: BTreeMap<String, Option<&Assertion>> = BTreeMap::new();
        for assertion in &changes.retract {
            assertion.validate()?;
            plan.insert(assertion.key()?, None);
        }
        for assertion in &changes.assert {
            assertion.validate()?;
            plan.insert(assertion.key()?, Some(assertion));
        }

        let mut to_remove = Vec::new();
        let mut to_insert = Vec::new();
        for (key, wanted) in plan {
            match (facts.assertions.contains_key(&key), wanted) {
                (true, None) => to_remove.push(key),
                (false, Some(assertion)) => {
                    let json = serde_json::to_string(assertion)?;
                    to_insert.push((key, assertion.clone(), json));
                }
                _ => {}
            }
        }

        if to_remove.is_empty() && to_insert.is_empty() {
            return Ok(ChangeSummary {
                asserted: 0,
                retracted: 0,
                revision: facts.revision,
            });
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ASSERTIONS)?;
            for key in &to_remove {
                table.remove(key.as_str())?;
            }
            for (key, _, json) in &to_insert {
                table.insert(key.as_str(), json.as_str())?;
            }
        }
        write_txn.commit()?;

        // Mirror after the durable commit.
        for key in &to_remove {
            facts.assertions.remove(key);
        }
        let asserted = to_insert.len();
        for (key, assertion, _) in to_insert {
            facts.assertions.insert(key, assertion);
        }
        facts.revision += 1;

        Ok(ChangeSummary {
            asserted,
            retracted: to_remove.len(),
            revision: facts.revision,
        })
    }

    /// Copy the current assertion set.
    pub fn snapshot(&self) -> Result<FactSnapshot> {
        Ok(self.read()?.snapshot())
    }

    pub fn revision(&self) -> Result<u64> {
        Ok(self.read()?.revision)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.assertions.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// First asserted value of `attribute` on `individual`. No inference.
    pub fn data_attribute(&self, individual: &str, attribute: &str) -> Result<Option<Literal>> {
        let facts = self.read()?;
        let value = facts.about(individual).find_map(|a| match a {
            Assertion::DataAttribute {
                attribute: name,
                value,
                ..
            } if name == attribute => Some(value.clone()),
            _ => None,
        });
        Ok(value)
    }

    /// Every asserted fact whose subject is `individual`.
    pub fn assertions_about(&self, individual: &str) -> Result<Vec<Assertion>> {
        let facts = self.read()?;
        Ok(facts.about(individual).cloned().collect())
    }

    /// Individuals with an asserted (not inferred) membership in `class`.
    pub fn asserted_instances_of(&self, class: &str) -> Result<BTreeSet<String>> {
        let facts = self.read()?;
        Ok(facts
            .assertions
            .values()
            .filter_map(|a| match a {
                Assertion::ClassMembership {
                    individual,
                    class: c,
                } if c == class => Some(individual.clone()),
                _ => None,
            })
            .collect())
    }
}
