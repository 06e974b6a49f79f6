//! Storage backend abstraction for the block and definition substrate.
//!
//! The contract is the narrow one the build and lifecycle layers rely on:
//! - Conditional writes with preconditions (used by the publish lock)
//! - Object metadata including `last_modified` (drives cache invalidation and GC)
//! - Atomic rename (used to make a generation visible in one step)
//!
//! The version token is an opaque `String`; backends interpret it according
//! to their own semantics (numeric generation, `ETag`, ...).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true for [`WriteResult::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for blocks, definitions and manifests.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads entire object.
    ///
    /// Returns `Error::NotFound` if object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if precondition not met.
    /// Never returns error for precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Results are returned in arbitrary order; callers requiring
    /// deterministic order must sort them.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Atomically moves `from` to `to`, replacing any object at `to`.
    ///
    /// Readers observe either the old object at `to` or the new one, never a
    /// missing or partial object. Returns `Error::NotFound` if `from` does
    /// not exist.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Reads and deserializes a JSON object, returning `None` when it is absent.
///
/// # Errors
///
/// Returns storage errors other than not-found, or a serialization error when
/// the stored bytes are not valid JSON for `T`.
pub async fn read_json<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    path: &str,
) -> Result<Option<T>> {
    match storage.get(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Serializes `value` as pretty JSON and writes it unconditionally.
///
/// # Errors
///
/// Returns a serialization or storage error.
pub async fn write_json<T: Serialize + Sync>(
    storage: &dyn StorageBackend,
    path: &str,
    value: &T,
) -> Result<String> {
    let bytes = serde_json::to_vec_pretty(value)?;
    match storage
        .put(path, Bytes::from(bytes), WritePrecondition::None)
        .await?
    {
        WriteResult::Success { version } => Ok(version),
        WriteResult::PreconditionFailed { current_version } => Err(Error::PreconditionFailed {
            message: format!("unconditional write to {path} rejected at version {current_version}"),
        }),
    }
}

/// In-memory storage backend for tests and single-process deployments.
///
/// Thread-safe via `RwLock`. Uses numeric versions internally (stored as
/// strings).
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
            last_modified: Some(self.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the map lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.objects.read().map_err(|_| poisoned())?.len())
    }

    /// Returns true when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the map lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy of every stored object, keyed by path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the map lock is poisoned.
    pub fn snapshot(&self) -> Result<HashMap<String, Bytes>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .map(|(k, v)| (k.clone(), v.data.clone()))
            .collect())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| obj.meta(path))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let source = objects
            .remove(from)
            .ok_or_else(|| Error::NotFound(format!("rename source not found: {from}")))?;
        let version = objects.get(to).map_or(1, |o| o.version + 1);
        objects.insert(
            to.to_string(),
            StoredObject {
                data: source.data,
                version,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }
}
