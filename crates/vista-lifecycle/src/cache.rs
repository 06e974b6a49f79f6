//! Bounded in-process definition cache.
//!
//! Definitions are cached per artifact together with the revision they were
//! read at. Every lookup checks the stored revision first and reloads from
//! the [`DefinitionStore`] when it moved, so writes by other nodes are picked
//! up on the next access. The cache holds at most `capacity` definitions;
//! evicting one calls the eviction listener, and the next lookup reloads it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use vista_core::definition::ArtifactDefinition;
use vista_core::error::{Error, Result};
use vista_core::id::ArtifactId;

use crate::definition_store::DefinitionStore;

/// Called with the id of every definition evicted for capacity.
pub type EvictionListener = Arc<dyn Fn(ArtifactId) + Send + Sync>;

struct CachedDefinition {
    definition: Arc<ArtifactDefinition>,
    revision: String,
}

/// LRU cache of artifact definitions.
pub struct DefinitionCache {
    entries: Mutex<LruCache<ArtifactId, CachedDefinition>>,
    on_evict: Option<EvictionListener>,
}

impl std::fmt::Debug for DefinitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionCache")
            .field("len", &self.len().unwrap_or_default())
            .finish_non_exhaustive()
    }
}

impl DefinitionCache {
    /// Creates a cache holding up to `capacity` definitions (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            on_evict: None,
        }
    }

    /// Registers the eviction listener.
    #[must_use]
    pub fn with_eviction_listener(mut self, listener: EvictionListener) -> Self {
        self.on_evict = Some(listener);
        self
    }

    /// Returns the current definition of `artifact`, reloading it when the
    /// stored revision moved. Returns `None` once the definition is gone.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn get(
        &self,
        store: &dyn DefinitionStore,
        artifact: ArtifactId,
    ) -> Result<Option<Arc<ArtifactDefinition>>> {
        let Some(current) = store.revision(artifact).await? else {
            self.invalidate(artifact)?;
            return Ok(None);
        };
        if let Some(hit) = self.lookup(artifact, &current.revision)? {
            return Ok(Some(hit));
        }

        let Some(stored) = store.get(artifact).await? else {
            self.invalidate(artifact)?;
            return Ok(None);
        };
        tracing::debug!(%artifact, revision = %stored.revision, "definition loaded");
        let definition = Arc::new(stored.definition);
        self.insert(artifact, Arc::clone(&definition), stored.revision)?;
        Ok(Some(definition))
    }

    /// Stores a definition that was just written at `revision`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the cache lock is poisoned.
    pub fn insert(
        &self,
        artifact: ArtifactId,
        definition: Arc<ArtifactDefinition>,
        revision: String,
    ) -> Result<()> {
        let evicted = {
            let mut entries = self.entries.lock().map_err(|_| poisoned())?;
            entries.push(
                artifact,
                CachedDefinition {
                    definition,
                    revision,
                },
            )
        };
        if let Some((evicted, _)) = evicted.filter(|(id, _)| *id != artifact) {
            tracing::debug!(artifact = %evicted, "definition evicted");
            if let Some(listener) = &self.on_evict {
                listener(evicted);
            }
        }
        Ok(())
    }

    /// Drops the cached copy of `artifact`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the cache lock is poisoned.
    pub fn invalidate(&self, artifact: ArtifactId) -> Result<()> {
        self.entries.lock().map_err(|_| poisoned())?.pop(&artifact);
        Ok(())
    }

    /// Number of cached definitions.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the cache lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().map_err(|_| poisoned())?.len())
    }

    /// Returns true when nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the cache lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lookup(
        &self,
        artifact: ArtifactId,
        revision: &str,
    ) -> Result<Option<Arc<ArtifactDefinition>>> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries
            .get(&artifact)
            .filter(|cached| cached.revision == revision)
            .map(|cached| Arc::clone(&cached.definition)))
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "definition cache lock poisoned".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition_store::StorageDefinitionStore;
    use vista_test_utils::{OpKind, TracingMemoryBackend, sales_definition};

    fn setup() -> (Arc<TracingMemoryBackend>, StorageDefinitionStore) {
        let storage = Arc::new(TracingMemoryBackend::new());
        let store = StorageDefinitionStore::new(storage.clone());
        (storage, store)
    }

    #[tokio::test]
    async fn unchanged_revision_is_served_from_cache() {
        let (storage, store) = setup();
        let def = sales_definition("scope");
        store.put(&def).await.unwrap();
        let cache = DefinitionCache::new(4);

        cache.get(&store, def.id).await.unwrap().unwrap();
        storage.clear_operations();
        cache.get(&store, def.id).await.unwrap().unwrap();
        assert!(storage.operations_of(OpKind::Get).is_empty());
    }

    #[tokio::test]
    async fn moved_revision_reloads() {
        let (_, store) = setup();
        let mut def = sales_definition("scope");
        store.put(&def).await.unwrap();
        let cache = DefinitionCache::new(4);
        cache.get(&store, def.id).await.unwrap().unwrap();

        def.name = "changed elsewhere".into();
        store.put(&def).await.unwrap();
        let reloaded = cache.get(&store, def.id).await.unwrap().unwrap();
        assert_eq!(reloaded.name, "changed elsewhere");
    }

    #[tokio::test]
    async fn removed_definition_is_dropped() {
        let (_, store) = setup();
        let def = sales_definition("scope");
        store.put(&def).await.unwrap();
        let cache = DefinitionCache::new(4);
        cache.get(&store, def.id).await.unwrap().unwrap();

        store.remove(def.id).await.unwrap();
        assert!(cache.get(&store, def.id).await.unwrap().is_none());
        assert!(cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn eviction_notifies_listener_and_reloads_later() {
        let (_, store) = setup();
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = DefinitionCache::new(1)
            .with_eviction_listener(Arc::new(move |id| sink.lock().unwrap().push(id)));

        let a = sales_definition("scope");
        let b = sales_definition("scope");
        store.put(&a).await.unwrap();
        store.put(&b).await.unwrap();

        cache.get(&store, a.id).await.unwrap().unwrap();
        cache.get(&store, b.id).await.unwrap().unwrap();
        assert_eq!(*evicted.lock().unwrap(), vec![a.id]);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get(&store, a.id).await.unwrap().unwrap().id, a.id);
    }
}
