//! Entity profiles as read from the relational user store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Read-only projection of a user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityProfile {
    /// Individual id in the knowledge base.
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub preferred_brand: Option<String>,
    #[serde(default)]
    pub preferred_platform: Option<String>,
    #[serde(default)]
    pub budget_min: Option<f64>,
    #[serde(default)]
    pub budget_max: Option<f64>,
}

impl EntityProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            preferred_brand: None,
            preferred_platform: None,
            budget_min: None,
            budget_max: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.preferred_brand = Some(brand.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.preferred_platform = Some(platform.into());
        self
    }

    pub fn with_budget(mut self, min: f64, max: f64) -> Self {
        self.budget_min = Some(min);
        self.budget_max = Some(max);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("entity directory unavailable: {0}")]
    Unavailable(String),
}

/// Source of entity profiles.
pub trait EntityDirectory: Send + Sync {
    fn profile(&self, id: &str) -> Result<Option<EntityProfile>, DirectoryError>;

    /// Every entity id the directory knows, in a stable order.
    fn entity_ids(&self) -> Result<Vec<String>, DirectoryError>;
}

/// Map-backed directory for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    profiles: RwLock<BTreeMap<String, EntityProfile>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the profile for `profile.id`.
    pub fn upsert(&self, profile: EntityProfile) -> Result<(), DirectoryError> {
        self.profiles
            .write()
            .map_err(|_| DirectoryError::Unavailable("profile lock poisoned".into()))?
            .insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Option<EntityProfile>, DirectoryError> {
        Ok(self
            .profiles
            .write()
            .map_err(|_| DirectoryError::Unavailable("profile lock poisoned".into()))?
            .remove(id))
    }
}

impl EntityDirectory for InMemoryDirectory {
    fn profile(&self, id: &str) -> Result<Option<EntityProfile>, DirectoryError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| DirectoryError::Unavailable("profile lock poisoned".into()))?;
        Ok(profiles.get(id).cloned())
    }

    fn entity_ids(&self) -> Result<Vec<String>, DirectoryError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| DirectoryError::Unavailable("profile lock poisoned".into()))?;
        Ok(profiles.keys().cloned().collect())
    }
}
