//! Test storage with operation tracing and fault injection.
//!
//! Wraps the core [`MemoryBackend`] so semantics (versions, CAS, rename) stay
//! identical to what production tests exercise, while recording every call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use vista_core::error::{Error, Result};
use vista_core::storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Kind of storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `list`
    List,
    /// `head`
    Head,
    /// `rename`
    Rename,
}

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone)]
pub enum StorageOp {
    /// Get operation.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Head operation.
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Put operation.
    Put {
        /// Path that was written.
        path: String,
        /// Size of data written.
        size: usize,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Delete operation.
    Delete {
        /// Path that was deleted.
        path: String,
    },
    /// List operation.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
    /// Rename operation.
    Rename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },
}

impl StorageOp {
    /// Kind of this operation.
    #[must_use]
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Get { .. } => OpKind::Get,
            Self::Head { .. } => OpKind::Head,
            Self::Put { .. } => OpKind::Put,
            Self::Delete { .. } => OpKind::Delete,
            Self::List { .. } => OpKind::List,
            Self::Rename { .. } => OpKind::Rename,
        }
    }

    /// Primary path of the operation (destination for renames).
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path } => path,
            Self::List { prefix } => prefix,
            Self::Rename { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    prefix: String,
    kind: Option<OpKind>,
}

/// In-memory storage backend with operation tracing.
#[derive(Debug, Clone, Default)]
pub struct TracingMemoryBackend {
    inner: MemoryBackend,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    latency: Option<Duration>,
}

impl TracingMemoryBackend {
    /// Creates a new empty tracing storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage with simulated latency on every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Recorded operations of one kind.
    #[must_use]
    pub fn operations_of(&self, kind: OpKind) -> Vec<StorageOp> {
        self.operations()
            .into_iter()
            .filter(|op| op.kind() == kind)
            .collect()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Fails every call touching a path with the given prefix.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.faults.lock().expect("lock").push(Fault {
            prefix: prefix.into(),
            kind: None,
        });
    }

    /// Fails calls of `kind` touching a path with the given prefix.
    pub fn inject_failure_on(&self, kind: OpKind, prefix: impl Into<String>) {
        self.faults.lock().expect("lock").push(Fault {
            prefix: prefix.into(),
            kind: Some(kind),
        });
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.faults.lock().expect("lock").clear();
    }

    /// Returns all stored paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.snapshot().expect("snapshot").into_keys().collect();
        paths.sort();
        paths
    }

    /// Stored paths under `prefix`, sorted.
    #[must_use]
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        self.paths()
            .into_iter()
            .filter(|p| p.starts_with(prefix))
            .collect()
    }

    /// Copy of every object under `prefix`, sorted by path.
    #[must_use]
    pub fn snapshot_under(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let mut objects: Vec<(String, Bytes)> = self
            .inner
            .snapshot()
            .expect("snapshot")
            .into_iter()
            .filter(|(p, _)| p.starts_with(prefix))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, kind: OpKind, path: &str) -> Result<()> {
        let faults = self.faults.lock().expect("lock");
        if faults
            .iter()
            .any(|f| path.starts_with(&f.prefix) && f.kind.is_none_or(|k| k == kind))
        {
            return Err(Error::storage(format!("injected {kind:?} failure for path: {path}")));
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.maybe_delay().await;
        self.check_failure(OpKind::Get, path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_failure(OpKind::Put, path)?;
        self.record(StorageOp::Put {
            path: path.to_string(),
            size: data.len(),
            precondition: precondition.clone(),
        });
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_delay().await;
        self.check_failure(OpKind::Delete, path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
        });
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(OpKind::List, prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.maybe_delay().await;
        self.check_failure(OpKind::Head, path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.maybe_delay().await;
        self.check_failure(OpKind::Rename, from)?;
        self.check_failure(OpKind::Rename, to)?;
        self.record(StorageOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        });
        self.inner.rename(from, to).await
    }
}
