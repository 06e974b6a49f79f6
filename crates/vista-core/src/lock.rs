//! Named exclusive lock over object storage.
//!
//! Publishing a generation takes this lock, scoped to the artifact identity,
//! for the duration of merge and publish. Readers never take it.
//!
//! 1. Acquisition writes a lock record with the holder's ID and expiry time
//!    using a `DoesNotExist` precondition; only one writer can succeed.
//! 2. If the record exists and has expired, it is taken over with a
//!    `MatchesVersion` CAS bound to the version read before the expiry check.
//! 3. Release overwrites the record with an expired copy (CAS on the holder's
//!    version), so a newer holder's record is never clobbered.
//!
//! Every acquisition carries a fencing sequence that increases by one on
//! each takeover.
//!
//! ```rust,ignore
//! let lock = DistributedLock::for_artifact(storage.clone(), artifact);
//! let guard = lock.acquire(Duration::from_secs(30), 5).await?;
//! // ... merge and publish ...
//! guard.release().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::id::ArtifactId;
use crate::paths::ArtifactPaths;
use crate::storage::{StorageBackend, WritePrecondition, WriteResult, read_json};

/// Default lock TTL (30 seconds).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Default maximum attempts for lock acquisition.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);
const JITTER_MAX_MS: u128 = 50;

/// Monotonic token identifying one lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Wraps a raw sequence number.
    #[must_use]
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Raw sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Unique lock holder ID.
    pub holder_id: String,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// Fencing sequence of this acquisition.
    #[serde(default)]
    pub sequence_number: u64,
    /// What the holder is doing, for operators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl LockInfo {
    fn new(holder_id: &str, ttl: Duration, sequence_number: u64, operation: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30)),
            acquired_at: now,
            sequence_number,
            operation,
        }
    }

    /// Returns whether this lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    fn expired_copy(&self) -> Self {
        Self {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            operation: None,
            ..self.clone()
        }
    }

    fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::internal(format!("serialize lock: {e}")))
    }
}

enum Attempt {
    Acquired(LockGuard),
    Held(String),
}

/// A named exclusive lock backed by object storage.
#[derive(Clone)]
pub struct DistributedLock {
    storage: Arc<dyn StorageBackend>,
    lock_path: String,
    holder_id: String,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Creates a lock at an arbitrary path with a fresh holder ID.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, lock_path: impl Into<String>) -> Self {
        Self {
            storage,
            lock_path: lock_path.into(),
            holder_id: Ulid::new().to_string(),
        }
    }

    /// Creates the publish lock for `artifact`.
    #[must_use]
    pub fn for_artifact(storage: Arc<dyn StorageBackend>, artifact: ArtifactId) -> Self {
        Self::new(storage, ArtifactPaths::lock(artifact))
    }

    /// Storage path of the lock record.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.lock_path
    }

    /// Holder ID used by this lock instance.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lock, retrying with exponential backoff and jitter.
    ///
    /// # Errors
    ///
    /// Returns `Error::PreconditionFailed` if the lock is still held after
    /// `max_attempts`, or a storage error.
    pub async fn acquire(&self, ttl: Duration, max_attempts: u32) -> Result<LockGuard> {
        self.acquire_for(ttl, max_attempts, None).await
    }

    /// Same as [`DistributedLock::acquire`], recording `operation` in the lock record.
    ///
    /// # Errors
    ///
    /// See [`DistributedLock::acquire`].
    pub async fn acquire_for(
        &self,
        ttl: Duration,
        max_attempts: u32,
        operation: Option<String>,
    ) -> Result<LockGuard> {
        let mut attempts = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire(ttl, operation.clone()).await? {
                Attempt::Acquired(guard) => return Ok(guard),
                Attempt::Held(holder) => {
                    attempts += 1;
                    if attempts >= max_attempts.max(1) {
                        return Err(Error::PreconditionFailed {
                            message: format!(
                                "lock {} held by {holder} after {attempts} attempts",
                                self.lock_path
                            ),
                        });
                    }
                    tracing::debug!(lock = %self.lock_path, %holder, attempts, "lock busy, backing off");
                    tokio::time::sleep(backoff.min(BACKOFF_MAX) + jitter()).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    async fn try_acquire(&self, ttl: Duration, operation: Option<String>) -> Result<Attempt> {
        let fresh = LockInfo::new(&self.holder_id, ttl, 1, operation.clone());
        if let WriteResult::Success { version } = self
            .storage
            .put(&self.lock_path, fresh.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            return Ok(Attempt::Acquired(self.guard(version, 1)));
        }

        // Version first, then contents: the expiry decision is bound to the
        // version the takeover CAS will check.
        let Some(meta) = self.storage.head(&self.lock_path).await? else {
            return Ok(Attempt::Held("released".into()));
        };
        let Some(current) = self.read_lock().await? else {
            return Ok(Attempt::Held("released".into()));
        };
        if !current.is_expired() {
            return Ok(Attempt::Held(current.holder_id));
        }

        let sequence = current.sequence_number.saturating_add(1);
        let takeover = LockInfo::new(&self.holder_id, ttl, sequence, operation);
        match self
            .storage
            .put(
                &self.lock_path,
                takeover.to_bytes()?,
                WritePrecondition::MatchesVersion(meta.version),
            )
            .await?
        {
            WriteResult::Success { version } => Ok(Attempt::Acquired(self.guard(version, sequence))),
            WriteResult::PreconditionFailed { .. } => Ok(Attempt::Held("contended".into())),
        }
    }

    fn guard(&self, version: String, sequence: u64) -> LockGuard {
        LockGuard {
            storage: Arc::clone(&self.storage),
            lock_path: self.lock_path.clone(),
            holder_id: self.holder_id.clone(),
            version,
            fencing_token: FencingToken::new(sequence),
            released: false,
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_json(self.storage.as_ref(), &self.lock_path).await
    }

    /// Returns true if an unexpired lock record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.read_lock().await?.is_some_and(|info| !info.is_expired()))
    }

    /// Reads the current lock record without acquiring the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read.
    pub async fn read_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }
}

fn jitter() -> Duration {
    let ms = Ulid::new().random() % JITTER_MAX_MS;
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Guard for a held lock.
///
/// Prefer [`LockGuard::release`]; dropping an unreleased guard spawns a
/// best-effort release on the current Tokio runtime, if any, and otherwise
/// leaves cleanup to the TTL.
pub struct LockGuard {
    storage: Arc<dyn StorageBackend>,
    lock_path: String,
    holder_id: String,
    version: String,
    fencing_token: FencingToken,
    released: bool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_path", &self.lock_path)
            .field("holder_id", &self.holder_id)
            .field("fencing_token", &self.fencing_token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Holder ID of this acquisition.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Fencing token of this acquisition.
    #[must_use]
    pub const fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Returns true while the stored record still names this acquisition and
    /// has not expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read.
    pub async fn is_held(&self) -> Result<bool> {
        let info = read_json::<LockInfo>(self.storage.as_ref(), &self.lock_path).await?;
        Ok(info.is_some_and(|info| {
            info.holder_id == self.holder_id
                && info.sequence_number == self.fencing_token.sequence()
                && !info.is_expired()
        }))
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock record could not be read or rewritten.
    pub async fn release(mut self) -> Result<()> {
        let result = release_record(
            self.storage.as_ref(),
            &self.lock_path,
            &self.holder_id,
            &self.version,
        )
        .await;
        self.released = true;
        result
    }
}

async fn release_record(
    storage: &dyn StorageBackend,
    path: &str,
    holder: &str,
    version: &str,
) -> Result<()> {
    let Some(info) = read_json::<LockInfo>(storage, path).await? else {
        return Ok(());
    };
    if info.holder_id != holder {
        return Ok(());
    }
    // Leave the expired record in place: deleting it would race with a new
    // holder acquiring between the CAS and the delete.
    let _ = storage
        .put(
            path,
            info.expired_copy().to_bytes()?,
            WritePrecondition::MatchesVersion(version.to_string()),
        )
        .await?;
    Ok(())
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let storage = Arc::clone(&self.storage);
        let path = self.lock_path.clone();
        let holder = self.holder_id.clone();
        let version = self.version.clone();
        handle.spawn(async move {
            if let Err(e) = release_record(storage.as_ref(), &path, &holder, &version).await {
                tracing::warn!(lock = %path, error = %e, "best-effort lock release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn storage() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let storage = storage();
        let lock = DistributedLock::for_artifact(storage, ArtifactId::generate());

        let guard = lock.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap();
        assert!(lock.is_locked().await.unwrap());
        assert_eq!(guard.fencing_token().sequence(), 1);

        guard.release().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn second_holder_is_rejected_while_held() {
        let storage = storage();
        let artifact = ArtifactId::generate();
        let first = DistributedLock::for_artifact(Arc::clone(&storage), artifact);
        let second = DistributedLock::for_artifact(storage, artifact);

        let _guard = first.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap();
        let err = second.acquire(DEFAULT_LOCK_TTL, 2).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over_with_higher_fencing_token() {
        let storage = storage();
        let artifact = ArtifactId::generate();
        let first = DistributedLock::for_artifact(Arc::clone(&storage), artifact);
        let second = DistributedLock::for_artifact(storage, artifact);

        let stale = first.acquire(Duration::from_millis(1), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = second.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap();
        assert!(fresh.fencing_token() > stale.fencing_token());

        // Releasing the stale guard must not clobber the new holder.
        stale.release().await.unwrap();
        assert!(second.is_locked().await.unwrap());
        let info = second.read_lock_info().await.unwrap().unwrap();
        assert_eq!(info.holder_id, second.holder_id());
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn guard_reports_lost_ownership() {
        let storage = storage();
        let artifact = ArtifactId::generate();
        let first = DistributedLock::for_artifact(Arc::clone(&storage), artifact);
        let second = DistributedLock::for_artifact(storage, artifact);

        let stale = first.acquire(Duration::from_millis(1), 1).await.unwrap();
        assert!(stale.is_held().await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!stale.is_held().await.unwrap());

        let fresh = second.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap();
        assert!(fresh.is_held().await.unwrap());
        assert!(!stale.is_held().await.unwrap());
        fresh.release().await.unwrap();
        stale.release().await.unwrap();
    }

    #[tokio::test]
    async fn released_lock_is_reacquired_with_next_sequence() {
        let storage = storage();
        let lock = DistributedLock::for_artifact(storage, ArtifactId::generate());

        lock.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap().release().await.unwrap();
        let again = lock.acquire(DEFAULT_LOCK_TTL, 1).await.unwrap();
        assert_eq!(again.fencing_token().sequence(), 2);
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn operation_is_recorded() {
        let lock = DistributedLock::for_artifact(storage(), ArtifactId::generate());
        let guard = lock
            .acquire_for(DEFAULT_LOCK_TTL, 1, Some("publish".into()))
            .await
            .unwrap();
        let info = lock.read_lock_info().await.unwrap().unwrap();
        assert_eq!(info.operation.as_deref(), Some("publish"));
        guard.release().await.unwrap();
    }

    #[test]
    fn lock_path_is_scoped_to_artifact() {
        let artifact = ArtifactId::generate();
        let lock = DistributedLock::for_artifact(storage(), artifact);
        assert_eq!(lock.path(), format!("locks/artifacts/{artifact}.lock.json"));
    }
}
