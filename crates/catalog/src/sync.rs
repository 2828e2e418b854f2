//! Keeps customer individuals in the knowledge base in step with entity
//! profiles.
//!
//! Each sync computes the full set of assertions a profile implies, diffs it
//! against what was written for that entity last time, and applies the
//! difference as one change set. Re-syncing an unchanged profile is a no-op;
//! a changed preference replaces the old relation instead of adding to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use semshop::{Assertion, ChangeSet, KbError, KnowledgeBase};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CatalogConfig;
use crate::profile::{EntityDirectory, EntityProfile};
use crate::Result;

/// How far a sync got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reasons", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every implied fact is written and entailments are fresh.
    Complete,
    /// Facts are written, but some relations were skipped or the
    /// recomputation failed.
    Partial(Vec<String>),
    /// Nothing was written.
    Failed(String),
}

impl SyncOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, SyncOutcome::Complete)
    }
}

/// Assertion key → assertion.
type Written = BTreeMap<String, Assertion>;

pub struct EntitySynchronizer {
    kb: Arc<KnowledgeBase>,
    config: Arc<CatalogConfig>,
    /// Per-entity record of the managed assertions last written.
    written: Mutex<HashMap<String, Written>>,
}

struct Target {
    managed: Vec<Assertion>,
    /// Canonical Brand / Platform memberships. Shared, never retracted.
    canonical: Vec<Assertion>,
    skipped: Vec<String>,
}

impl EntitySynchronizer {
    pub fn new(kb: Arc<KnowledgeBase>, config: Arc<CatalogConfig>) -> Self {
        Self {
            kb,
            config,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Write the facts implied by `profile`, then bring entailments up to date.
    pub fn sync_entity(&self, profile: &EntityProfile) -> SyncOutcome {
        let id = profile.id.trim();
        if id.is_empty() {
            return SyncOutcome::Failed("entity id is empty".into());
        }

        let target = match self.target(id, profile) {
            Ok(t) => t,
            Err(e) => return SyncOutcome::Failed(e.to_string()),
        };
        let mut reasons = target.skipped;

        // Tracker lock is held across diff and write so two syncs of the same
        // entity cannot interleave.
        {
            let mut written = match self.written.lock() {
                Ok(w) => w,
                Err(_) => return SyncOutcome::Failed("sync tracker lock poisoned".into()),
            };
            let previous = match written.get(id) {
                Some(p) => p.clone(),
                None => match self.seed(id) {
                    Ok(p) => p,
                    Err(e) => return SyncOutcome::Failed(e.to_string()),
                },
            };

            let mut next = Written::new();
            for assertion in target.managed {
                match assertion.key() {
                    Ok(key) => {
                        next.insert(key, assertion);
                    }
                    Err(e) => return SyncOutcome::Failed(e.to_string()),
                }
            }

            let mut changes = ChangeSet::new();
            for (key, old) in &previous {
                if !next.contains_key(key) {
                    changes = changes.retract(old.clone());
                }
            }
            for assertion in next.values().chain(target.canonical.iter()) {
                changes = changes.assert(assertion.clone());
            }

            match self.kb.apply(&changes) {
                Ok(summary) => {
                    info!(
                        entity = id,
                        asserted = summary.asserted,
                        retracted = summary.retracted,
                        "entity synchronized"
                    );
                }
                Err(e) => {
                    warn!(entity = id, error = %e, "entity sync failed");
                    return SyncOutcome::Failed(e.to_string());
                }
            }
            written.insert(id.to_string(), next);
        }

        if let Err(e) = self.kb.ensure_fresh() {
            reasons.push(e.to_string());
        }

        if reasons.is_empty() {
            SyncOutcome::Complete
        } else {
            SyncOutcome::Partial(reasons)
        }
    }

    /// Sync every profile the directory lists, in its order.
    pub fn sync_all(&self, directory: &dyn EntityDirectory) -> Result<Vec<(String, SyncOutcome)>> {
        let ids = directory.entity_ids()?;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = match directory.profile(&id)? {
                Some(profile) => self.sync_entity(&profile),
                None => SyncOutcome::Failed(format!("profile {id} disappeared during sync")),
            };
            outcomes.push((id, outcome));
        }
        let complete = outcomes.iter().filter(|(_, o)| o.is_complete()).count();
        info!(total = outcomes.len(), complete, "directory synchronized");
        Ok(outcomes)
    }

    /// Whether `entity_id` has an asserted membership in the customer class.
    pub fn is_synced(&self, entity_id: &str) -> Result<bool> {
        Ok(self
            .kb
            .asserted_instances_of(&self.config.vocabulary.customer_class)?
            .contains(entity_id))
    }

    fn target(&self, id: &str, profile: &EntityProfile) -> Result<Target> {
        let v = &self.config.vocabulary;
        let mut target = Target {
            managed: Vec::new(),
            canonical: Vec::new(),
            skipped: Vec::new(),
        };

        target
            .managed
            .push(Assertion::class_membership(id, v.customer_class.as_str()));

        let name = profile
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(id);
        target
            .managed
            .push(Assertion::data_attribute(id, v.name.as_str(), name));
        for (attribute, value) in [
            (&v.budget_min, profile.budget_min),
            (&v.budget_max, profile.budget_max),
        ] {
            match value {
                Some(amount) if amount.is_finite() => target
                    .managed
                    .push(Assertion::data_attribute(id, attribute.as_str(), amount)),
                Some(amount) => {
                    warn!(entity = id, attribute = %attribute, "skipping non-finite budget");
                    target
                        .skipped
                        .push(format!("{attribute} has non-finite value {amount}"));
                }
                None => {}
            }
        }

        let preferences = [
            (
                "brand",
                profile.preferred_brand.as_deref(),
                &v.preferred_brand,
                &v.brand_class,
                self.config.allowed_brands.as_ref(),
            ),
            (
                "platform",
                profile.preferred_platform.as_deref(),
                &v.preferred_platform,
                &v.platform_class,
                self.config.allowed_platforms.as_ref(),
            ),
        ];
        for (what, value, relation, class, allowed) in preferences {
            let Some(value) = value.filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            match self.canonical(value, class, allowed) {
                Ok((individual, exists)) => {
                    if !exists {
                        target
                            .canonical
                            .push(Assertion::class_membership(individual.as_str(), class.as_str()));
                    }
                    target.managed.push(Assertion::object_relation(
                        id,
                        relation.as_str(),
                        individual,
                    ));
                }
                Err(reason) => {
                    warn!(entity = id, what, value, "skipping unrecognized preference");
                    target
                        .skipped
                        .push(format!("unrecognized {what} preference {value:?}: {reason}"));
                }
            }
        }

        Ok(target)
    }

    /// Resolve a preference value to a canonical individual of `class`.
    ///
    /// Returns the id and whether it already has an asserted membership.
    fn canonical(
        &self,
        value: &str,
        class: &str,
        allowed: Option<&BTreeSet<String>>,
    ) -> std::result::Result<(String, bool), String> {
        let value = value.trim();
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '#' | '/' | ':'))
        {
            return Err("not a valid individual id".into());
        }
        if let Some(allowed) = allowed {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
                return Err("not in the allow-list".into());
            }
        }
        let existing = self
            .kb
            .asserted_instances_of(class)
            .map_err(|e| e.to_string())?;
        match existing.iter().find(|e| e.eq_ignore_ascii_case(value)) {
            Some(id) => Ok((id.clone(), true)),
            None => Ok((value.to_string(), false)),
        }
    }

    /// Managed assertions already in the store for an entity not seen yet.
    fn seed(&self, id: &str) -> std::result::Result<Written, KbError> {
        let v = &self.config.vocabulary;
        let mut seeded = Written::new();
        for assertion in self.kb.assertions_about(id)? {
            let managed = match &assertion {
                Assertion::ClassMembership { class, .. } => *class == v.customer_class,
                Assertion::DataAttribute { attribute, .. } => {
                    *attribute == v.name || *attribute == v.budget_min || *attribute == v.budget_max
                }
                Assertion::ObjectRelation { relation, .. } => {
                    *relation == v.preferred_brand || *relation == v.preferred_platform
                }
            };
            if managed {
                seeded.insert(assertion.key()?, assertion);
            }
        }
        Ok(seeded)
    }
}
