//! Generation garbage collection.
//!
//! Publishing never deletes: blocks dropped by a full rebuild stay in
//! `blocks/`, and a crashed build may leave objects under `_tmp/`. The
//! collector removes both once they are older than the configured delay, so
//! a reader still holding the previous manifest can finish its query.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use vista_core::clock::{Clock, SystemClock};
use vista_core::config::GcConfig;
use vista_core::generation::GenerationManifest;
use vista_core::id::ArtifactId;
use vista_core::paths::ArtifactPaths;
use vista_core::storage::{ObjectMeta, StorageBackend};

/// Result of a collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResult {
    /// Objects deleted.
    pub objects_deleted: u64,
    /// Bytes reclaimed.
    pub bytes_reclaimed: u64,
    /// Unreferenced committed blocks deleted.
    pub blocks_deleted: u64,
    /// Abandoned temporary objects deleted.
    pub tmp_deleted: u64,
    /// Errors encountered; collection continues past them.
    pub errors: Vec<String>,
}

impl GcResult {
    /// Merges another result into this one.
    pub fn merge(&mut self, other: Self) {
        self.objects_deleted += other.objects_deleted;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.blocks_deleted += other.blocks_deleted;
        self.tmp_deleted += other.tmp_deleted;
        self.errors.extend(other.errors);
    }

    /// Returns true if any errors were encountered.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Dry-run report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Objects that would be deleted.
    pub objects_to_delete: u64,
    /// Bytes that would be reclaimed.
    pub bytes_to_reclaim: u64,
    /// Unreferenced committed blocks past the delay.
    pub unreferenced_blocks: Vec<String>,
    /// Abandoned temporary objects past the delay.
    pub abandoned_tmp: Vec<String>,
}

const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 3_600;

#[derive(Debug, Default)]
struct Candidates {
    blocks: Vec<ObjectMeta>,
    tmp: Vec<ObjectMeta>,
}

/// Collects unreferenced blocks and abandoned temporary objects.
///
/// # Example
///
/// ```rust,ignore
/// let collector = GenerationCollector::new(storage, &config.gc);
/// let report = collector.collect_dry_run(artifact).await?;
/// let result = collector.collect(artifact).await?;
/// ```
#[derive(Clone)]
pub struct GenerationCollector {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    delay: Duration,
}

impl std::fmt::Debug for GenerationCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationCollector")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl GenerationCollector {
    /// Creates a collector honouring `config.delay_secs`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: &GcConfig) -> Self {
        Self {
            storage,
            clock: Arc::new(SystemClock),
            delay: Duration::seconds(i64::try_from(config.delay_secs.min(MAX_DELAY_SECS)).unwrap_or(0)),
        }
    }

    /// Reads time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reports what [`GenerationCollector::collect`] would delete for `artifact`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading the generation fails.
    pub async fn collect_dry_run(&self, artifact: ArtifactId) -> vista_core::Result<GcReport> {
        let candidates = self.candidates(artifact).await?;
        let all = candidates.blocks.iter().chain(&candidates.tmp);
        Ok(GcReport {
            objects_to_delete: u64::try_from(candidates.blocks.len() + candidates.tmp.len())
                .unwrap_or(u64::MAX),
            bytes_to_reclaim: all.map(|m| m.size).sum(),
            unreferenced_blocks: candidates.blocks.into_iter().map(|m| m.path).collect(),
            abandoned_tmp: candidates.tmp.into_iter().map(|m| m.path).collect(),
        })
    }

    /// Deletes unreferenced blocks and abandoned temporary objects of `artifact`.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or reading the generation fails. Delete
    /// failures are recorded in [`GcResult::errors`].
    pub async fn collect(&self, artifact: ArtifactId) -> vista_core::Result<GcResult> {
        let start = Instant::now();
        let candidates = self.candidates(artifact).await?;
        let mut result = GcResult::default();

        for meta in candidates.blocks {
            if self.delete(&meta, &mut result).await {
                result.blocks_deleted += 1;
            }
        }
        for meta in candidates.tmp {
            if self.delete(&meta, &mut result).await {
                result.tmp_deleted += 1;
            }
        }

        vista_core::metrics::record_gc_deleted("block", result.blocks_deleted);
        vista_core::metrics::record_gc_deleted("tmp", result.tmp_deleted);
        tracing::info!(
            %artifact,
            objects_deleted = result.objects_deleted,
            bytes_reclaimed = result.bytes_reclaimed,
            errors_count = result.errors.len(),
            duration_secs = start.elapsed().as_secs_f64(),
            "garbage collection completed"
        );
        Ok(result)
    }

    /// Collects every artifact under the storage root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root listing fails. Per-artifact failures are
    /// recorded in [`GcResult::errors`].
    pub async fn collect_all(&self) -> vista_core::Result<GcResult> {
        let mut result = GcResult::default();
        for artifact in self.artifacts().await? {
            match self.collect(artifact).await {
                Ok(partial) => result.merge(partial),
                Err(e) => {
                    tracing::error!(%artifact, error = %e, "GC failed for artifact");
                    result.errors.push(format!("artifact {artifact}: {e}"));
                }
            }
        }
        Ok(result)
    }

    async fn artifacts(&self) -> vista_core::Result<BTreeSet<ArtifactId>> {
        let listing = self.storage.list(ArtifactPaths::ROOT).await?;
        Ok(listing
            .iter()
            .filter_map(|meta| meta.path.strip_prefix(ArtifactPaths::ROOT))
            .filter_map(|rest| rest.split('/').next())
            .filter_map(|id| id.parse().ok())
            .collect())
    }

    async fn candidates(&self, artifact: ArtifactId) -> vista_core::Result<Candidates> {
        let cutoff = self.clock.now() - self.delay;
        let storage = self.storage.as_ref();
        let current = GenerationManifest::load(storage, artifact).await?;
        let mut candidates = Candidates::default();

        for meta in storage.list(&ArtifactPaths::blocks_prefix(artifact)).await? {
            let Some(block) = ArtifactPaths::block_id_from_path(&meta.path) else {
                continue;
            };
            let referenced = current.as_ref().is_some_and(|g| g.contains_block(&block));
            if !referenced && older_than(&meta, cutoff) {
                candidates.blocks.push(meta);
            } else if !referenced {
                tracing::debug!(path = %meta.path, "skipping unreferenced block (too recent)");
            }
        }

        for meta in storage.list(&ArtifactPaths::tmp_root(artifact)).await? {
            if older_than(&meta, cutoff) {
                candidates.tmp.push(meta);
            }
        }

        Ok(candidates)
    }

    async fn delete(&self, meta: &ObjectMeta, result: &mut GcResult) -> bool {
        match self.storage.delete(&meta.path).await {
            Ok(()) => {
                result.objects_deleted += 1;
                result.bytes_reclaimed += meta.size;
                true
            }
            Err(e) => {
                result.errors.push(format!("delete {}: {e}", meta.path));
                false
            }
        }
    }
}

/// Objects without a modification time are never collected.
fn older_than(meta: &ObjectMeta, cutoff: DateTime<Utc>) -> bool {
    meta.last_modified.is_some_and(|t| t < cutoff)
}
