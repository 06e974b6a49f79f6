//! Definition Store: persisted artifact definitions.
//!
//! Records carry a revision token (the storage object version) that changes
//! on every write; the in-process cache compares revisions to decide whether
//! its copy is still current.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vista_core::definition::ArtifactDefinition;
use vista_core::error::{Error, Result};
use vista_core::id::ArtifactId;
use vista_core::paths::ArtifactPaths;
use vista_core::storage::{StorageBackend, write_json};

/// A definition as read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDefinition {
    /// The definition.
    pub definition: ArtifactDefinition,
    /// Revision token; changes on every write.
    pub revision: String,
    /// Time of the last write, when the store reports it.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Revision of a stored record without its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Revision token.
    pub revision: String,
    /// Time of the last write.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Persistence for artifact definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync + 'static {
    /// Reads a definition.
    async fn get(&self, artifact: ArtifactId) -> Result<Option<StoredDefinition>>;

    /// Reads only the revision of a definition.
    async fn revision(&self, artifact: ArtifactId) -> Result<Option<Revision>>;

    /// Writes a definition, returning the new revision.
    async fn put(&self, definition: &ArtifactDefinition) -> Result<String>;

    /// Removes a definition. Removing a missing definition succeeds.
    async fn remove(&self, artifact: ArtifactId) -> Result<()>;

    /// Every stored artifact.
    async fn list(&self) -> Result<Vec<ArtifactId>>;
}

/// Definition store over the artifact storage layout
/// (`artifacts/{id}/definition.json`).
#[derive(Clone)]
pub struct StorageDefinitionStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageDefinitionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDefinitionStore").finish_non_exhaustive()
    }
}

impl StorageDefinitionStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DefinitionStore for StorageDefinitionStore {
    async fn get(&self, artifact: ArtifactId) -> Result<Option<StoredDefinition>> {
        let path = ArtifactPaths::definition(artifact);
        let Some(meta) = self.storage.head(&path).await? else {
            return Ok(None);
        };
        let bytes = match self.storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let definition: ArtifactDefinition = serde_json::from_slice(&bytes)?;
        if definition.id != artifact {
            return Err(Error::InvalidInput(format!(
                "definition at {path} belongs to {}",
                definition.id
            )));
        }
        Ok(Some(StoredDefinition {
            definition,
            revision: meta.version,
            last_modified: meta.last_modified,
        }))
    }

    async fn revision(&self, artifact: ArtifactId) -> Result<Option<Revision>> {
        Ok(self
            .storage
            .head(&ArtifactPaths::definition(artifact))
            .await?
            .map(|meta| Revision {
                revision: meta.version,
                last_modified: meta.last_modified,
            }))
    }

    async fn put(&self, definition: &ArtifactDefinition) -> Result<String> {
        write_json(
            self.storage.as_ref(),
            &ArtifactPaths::definition(definition.id),
            definition,
        )
        .await
    }

    async fn remove(&self, artifact: ArtifactId) -> Result<()> {
        self.storage.delete(&ArtifactPaths::definition(artifact)).await
    }

    async fn list(&self) -> Result<Vec<ArtifactId>> {
        let mut ids: Vec<ArtifactId> = self
            .storage
            .list(ArtifactPaths::ROOT)
            .await?
            .into_iter()
            .filter_map(|meta| {
                let rest = meta.path.strip_prefix(ArtifactPaths::ROOT)?;
                let (id, file) = rest.split_once('/')?;
                (file == "definition.json").then(|| id.parse().ok()).flatten()
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}
