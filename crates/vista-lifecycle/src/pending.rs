//! Pending-build registry: the single-flight gate.
//!
//! Admission is an atomic check-and-insert under one mutex. The caller that
//! inserts receives a [`BuildReporter`] and must run the build; every other
//! caller for the same [`BuildKey`] joins the existing [`BuildHandle`]. The
//! entry is removed when the reporter finishes or is dropped, so a failed or
//! panicked build never leaves the key blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vista_core::error::{Error, Result};
use vista_core::id::ArtifactId;

use crate::identity::BuildKey;

/// Final state of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    /// A generation was published.
    Published {
        /// Published generation.
        sequence: u64,
        /// Rows the build added.
        rows: u64,
    },
    /// The build observed cancellation; nothing changed.
    Cancelled,
    /// The build failed; the prior generation is still served.
    Failed {
        /// Failure description.
        message: String,
    },
}

/// Shared view of one in-flight build.
#[derive(Clone)]
pub struct BuildHandle {
    key: BuildKey,
    ticket: u64,
    cancel: CancellationToken,
    status: watch::Receiver<Option<BuildStatus>>,
}

impl std::fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHandle")
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .field("status", &self.status())
            .finish()
    }
}

impl BuildHandle {
    /// Key the build runs under.
    #[must_use]
    pub const fn key(&self) -> &BuildKey {
        &self.key
    }

    /// Artifact being built.
    #[must_use]
    pub const fn artifact(&self) -> ArtifactId {
        self.key.artifact
    }

    /// Admission ticket; distinct for every started build.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Final status, once the build finished.
    #[must_use]
    pub fn status(&self) -> Option<BuildStatus> {
        self.status.borrow().clone()
    }

    /// Returns true once the build finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the build observes.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the build to finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the build was abandoned without a status.
    pub async fn wait(&self) -> Result<BuildStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::internal(format!("build {} ended without a status", self.key)))?;
        status
            .clone()
            .ok_or_else(|| Error::internal(format!("build {} has no status", self.key)))
    }
}

/// Outcome of asking to start a build.
#[derive(Debug)]
pub enum Admission {
    /// This caller inserted the entry and must run the build.
    Started {
        /// Handle to hand out.
        handle: BuildHandle,
        /// Reports the outcome and releases the entry.
        reporter: BuildReporter,
    },
    /// A build for the key was already running.
    Joined(BuildHandle),
}

impl Admission {
    /// The handle, whichever way admission went.
    #[must_use]
    pub fn handle(&self) -> &BuildHandle {
        match self {
            Self::Started { handle, .. } | Self::Joined(handle) => handle,
        }
    }
}

type Entries = Arc<Mutex<HashMap<BuildKey, BuildHandle>>>;

/// Releases a pending entry and publishes the build status.
pub struct BuildReporter {
    entries: Entries,
    key: BuildKey,
    ticket: u64,
    tx: watch::Sender<Option<BuildStatus>>,
    finished: bool,
}

impl std::fmt::Debug for BuildReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildReporter")
            .field("key", &self.key)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

impl BuildReporter {
    /// Removes the pending entry, then publishes `status` to every waiter.
    pub fn finish(mut self, status: BuildStatus) {
        self.release(status);
    }

    fn release(&mut self, status: BuildStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Ok(mut entries) = self.entries.lock() {
            if entries.get(&self.key).is_some_and(|h| h.ticket == self.ticket) {
                entries.remove(&self.key);
            }
        }
        self.tx.send_replace(Some(status));
    }
}

impl Drop for BuildReporter {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(key = %self.key, "build ended without reporting a status");
            self.release(BuildStatus::Failed {
                message: "build task ended without reporting a status".into(),
            });
        }
    }
}

/// In-flight builds by key.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: Entries,
    next_ticket: AtomicU64,
}

impl PendingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a build for `key`, or joins the one already running.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn admit(&self, key: BuildKey) -> Result<Admission> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        if let Some(existing) = entries.get(&key).filter(|h| !h.is_finished()) {
            vista_core::metrics::record_single_flight_hit();
            tracing::debug!(%key, ticket = existing.ticket, "joined in-flight build");
            return Ok(Admission::Joined(existing.clone()));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let handle = BuildHandle {
            key: key.clone(),
            ticket,
            cancel: CancellationToken::new(),
            status: rx,
        };
        entries.insert(key.clone(), handle.clone());
        Ok(Admission::Started {
            handle,
            reporter: BuildReporter {
                entries: Arc::clone(&self.entries),
                key,
                ticket,
                tx,
                finished: false,
            },
        })
    }

    /// The in-flight build for `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn get(&self, key: &BuildKey) -> Result<Option<BuildHandle>> {
        Ok(self.entries.lock().map_err(|_| poisoned())?.get(key).cloned())
    }

    /// In-flight builds of `artifact`, under any identity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn for_artifact(&self, artifact: ArtifactId) -> Result<Vec<BuildHandle>> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| poisoned())?
            .values()
            .filter(|h| h.artifact() == artifact)
            .cloned()
            .collect())
    }

    /// Number of in-flight builds.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().map_err(|_| poisoned())?.len())
    }

    /// Returns true when no build is in flight.
    ///
    /// # Errors
    ///
    /// Returns `Error::Internal` if the registry lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "pending registry lock poisoned".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vista_core::definition::Principal;

    fn key() -> BuildKey {
        BuildKey {
            artifact: ArtifactId::generate(),
            requestor: Principal::user("ann"),
        }
    }

    #[tokio::test]
    async fn second_admission_joins_the_first() {
        let pending = PendingRegistry::new();
        let key = key();

        let Admission::Started { handle, reporter } = pending.admit(key.clone()).unwrap() else {
            panic!("first admission starts");
        };
        let Admission::Joined(joined) = pending.admit(key.clone()).unwrap() else {
            panic!("second admission joins");
        };
        assert_eq!(joined.ticket(), handle.ticket());

        reporter.finish(BuildStatus::Published { sequence: 1, rows: 5 });
        assert_eq!(
            joined.wait().await.unwrap(),
            BuildStatus::Published { sequence: 1, rows: 5 }
        );
        assert!(pending.is_empty().unwrap());
    }

    #[tokio::test]
    async fn finished_key_admits_a_new_build() {
        let pending = PendingRegistry::new();
        let key = key();
        let Admission::Started { handle, reporter } = pending.admit(key.clone()).unwrap() else {
            panic!("starts");
        };
        reporter.finish(BuildStatus::Cancelled);

        let next = pending.admit(key).unwrap();
        assert!(matches!(next, Admission::Started { .. }));
        assert_ne!(next.handle().ticket(), handle.ticket());
    }

    #[tokio::test]
    async fn dropped_reporter_releases_the_key_as_failed() {
        let pending = PendingRegistry::new();
        let key = key();
        let admission = pending.admit(key.clone()).unwrap();
        let handle = admission.handle().clone();
        drop(admission);

        assert!(matches!(handle.wait().await.unwrap(), BuildStatus::Failed { .. }));
        assert!(pending.get(&key).unwrap().is_none());
    }

    #[test]
    fn cancel_reaches_the_build_token() {
        let pending = PendingRegistry::new();
        let key = key();
        let admission = pending.admit(key.clone()).unwrap();
        let token = admission.handle().cancellation_token();
        pending.for_artifact(key.artifact).unwrap()[0].cancel();
        assert!(token.is_cancelled());
    }
}
