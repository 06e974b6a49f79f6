//! In-memory index of registered artifacts.
//!
//! The registry keeps a small summary of every registered definition so
//! lookups never load full definitions. Entries iterate in artifact id order,
//! which is creation order for ULIDs.

use std::collections::BTreeMap;
use std::sync::RwLock;

use vista_core::definition::{ArtifactDefinition, Consumer};
use vista_core::error::{Error, Result};
use vista_core::fingerprint::Fingerprint;
use vista_core::id::ArtifactId;

use crate::identity::{CacheKey, MatchRank, Requestor};

/// Lookup summary of one registered artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Artifact id.
    pub artifact: ArtifactId,
    /// Source table.
    pub table: String,
    /// Sharing scope.
    pub scope: String,
    /// Structural fingerprint.
    pub fingerprint: Fingerprint,
    /// Registrations, in registration order.
    pub consumers: Vec<Consumer>,
}

impl RegistryEntry {
    /// Summarizes `definition`.
    #[must_use]
    pub fn from_definition(definition: &ArtifactDefinition) -> Self {
        Self {
            artifact: definition.id,
            table: definition.table().to_string(),
            scope: definition.sharing.scope.clone(),
            fingerprint: definition.sharing.fingerprint.clone(),
            consumers: definition.consumers().to_vec(),
        }
    }
}

/// Result of resolving a cache key for a requestor.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Resolved artifact.
    pub artifact: ArtifactId,
    /// Registration that matched.
    pub registration: Consumer,
    /// How it matched.
    pub rank: MatchRank,
}

/// Registered artifacts, keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<ArtifactId, RegistryEntry>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or refreshes the entry for `definition`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn upsert(&self, definition: &ArtifactDefinition) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(definition.id, RegistryEntry::from_definition(definition));
        Ok(())
    }

    /// Removes an artifact, returning its entry.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn remove(&self, artifact: ArtifactId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.write().map_err(|_| poisoned())?.remove(&artifact))
    }

    /// Entry of `artifact`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn get(&self, artifact: ArtifactId) -> Result<Option<RegistryEntry>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .get(&artifact)
            .cloned())
    }

    /// Returns true if `artifact` is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn contains(&self, artifact: ArtifactId) -> Result<bool> {
        Ok(self.entries.read().map_err(|_| poisoned())?.contains_key(&artifact))
    }

    /// Number of registered artifacts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(|_| poisoned())?.len())
    }

    /// Returns true when nothing is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Resolves `key` for `requestor`.
    ///
    /// Only artifacts over `key.table` with a registration named
    /// `key.consumer` are considered. The best [`MatchRank`] wins; among
    /// equal ranks the earliest artifact, then the earliest registration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn resolve(&self, key: &CacheKey, requestor: &Requestor) -> Result<Option<Resolution>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut best: Option<Resolution> = None;
        for entry in entries.values().filter(|e| e.table == key.table) {
            for registration in entry.consumers.iter().filter(|c| c.name == key.consumer) {
                let Some(rank) = requestor.match_rank(&registration.principal) else {
                    continue;
                };
                if best.as_ref().is_none_or(|b| rank < b.rank) {
                    best = Some(Resolution {
                        artifact: entry.artifact,
                        registration: registration.clone(),
                        rank,
                    });
                }
            }
        }
        Ok(best)
    }

    /// Artifacts in `scope` with `fingerprint`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn with_fingerprint(
        &self,
        scope: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<ArtifactId>> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|e| e.scope == scope && &e.fingerprint == fingerprint)
            .map(|e| e.artifact)
            .collect())
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "registry lock poisoned".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_core::definition::Principal;
    use vista_test_utils::{SALES_TABLE, sales_definition};

    fn registered(consumers: Vec<Consumer>) -> ArtifactDefinition {
        let mut def = sales_definition("scope");
        for consumer in consumers {
            def.register(consumer);
        }
        def
    }

    #[test]
    fn exact_match_beats_group_beats_role() {
        let registry = Registry::new();
        let by_role = registered(vec![Consumer::new("dash", Principal::role("viewer"))]);
        let by_group = registered(vec![Consumer::new("dash", Principal::group("analysts"))]);
        let by_user = registered(vec![Consumer::new("dash", Principal::user("ann"))]);
        for def in [&by_role, &by_group, &by_user] {
            registry.upsert(def).unwrap();
        }
        let key = CacheKey::new(SALES_TABLE, "dash");

        let ann = Requestor::user("ann").with_groups(["analysts"]).with_roles(["viewer"]);
        let hit = registry.resolve(&key, &ann).unwrap().unwrap();
        assert_eq!((hit.artifact, hit.rank), (by_user.id, MatchRank::Exact));

        let bo = Requestor::user("bo").with_groups(["analysts"]).with_roles(["viewer"]);
        let hit = registry.resolve(&key, &bo).unwrap().unwrap();
        assert_eq!((hit.artifact, hit.rank), (by_group.id, MatchRank::Group));

        let cy = Requestor::user("cy").with_roles(["viewer"]);
        let hit = registry.resolve(&key, &cy).unwrap().unwrap();
        assert_eq!((hit.artifact, hit.rank), (by_role.id, MatchRank::Role));

        assert!(registry.resolve(&key, &Requestor::user("dee")).unwrap().is_none());
    }

    #[test]
    fn first_registered_artifact_wins_ties() {
        let registry = Registry::new();
        let a = registered(vec![Consumer::new("dash", Principal::group("g"))]);
        let b = registered(vec![Consumer::new("dash", Principal::group("g"))]);
        registry.upsert(&b).unwrap();
        registry.upsert(&a).unwrap();

        let hit = registry
            .resolve(&CacheKey::new(SALES_TABLE, "dash"), &Requestor::user("u").with_groups(["g"]))
            .unwrap()
            .unwrap();
        assert_eq!(hit.artifact, a.id.min(b.id));
    }

    #[test]
    fn table_and_consumer_must_match() {
        let registry = Registry::new();
        let def = registered(vec![Consumer::new("dash", Principal::user("ann"))]);
        registry.upsert(&def).unwrap();
        let ann = Requestor::user("ann");

        assert!(registry.resolve(&CacheKey::new("orders", "dash"), &ann).unwrap().is_none());
        assert!(registry.resolve(&CacheKey::new(SALES_TABLE, "report"), &ann).unwrap().is_none());

        registry.remove(def.id).unwrap();
        assert!(registry.resolve(&CacheKey::new(SALES_TABLE, "dash"), &ann).unwrap().is_none());
    }
}
