//! Atomic publish of a merged generation.
//!
//! Publishing runs under the artifact's [`DistributedLock`]:
//!
//! 1. Load the current generation and the stored definition, then merge.
//! 2. Announce [`ClusterEvent::PublishStarting`].
//! 3. Rename the build's temporary blocks to their committed paths. Committed
//!    blocks are invisible until a manifest references them.
//! 4. Write the definition and manifest under `_tmp/{build}/`, check the lock
//!    is still ours, then rename the definition and finally the manifest.
//!    The manifest rename is the single step that switches readers over.
//! 5. Announce [`ClusterEvent::GenerationPublished`] and release the lock.
//!
//! If the manifest rename fails the previous definition is restored, so the
//! prior generation stays authoritative.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use vista_core::config::BuildConfig;
use vista_core::definition::ArtifactDefinition;
use vista_core::generation::GenerationManifest;
use vista_core::id::{ArtifactId, BuildId};
use vista_core::lock::{DistributedLock, LockGuard};
use vista_core::paths::ArtifactPaths;
use vista_core::signal::{ClusterEvent, ClusterSignal};
use vista_core::storage::{StorageBackend, WritePrecondition, read_json};

use crate::error::{BuildContext, BuildPhase, Result};
use crate::merge::{MergeInput, merge_generation};

enum Attempt {
    Committed(GenerationManifest),
    LockLost,
}

/// Publishes generations under the artifact lock.
#[derive(Clone)]
pub struct Publisher {
    storage: Arc<dyn StorageBackend>,
    signal: Arc<dyn ClusterSignal>,
    lock_ttl: Duration,
    lock_attempts: u32,
    publish_attempts: u32,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_attempts", &self.lock_attempts)
            .field("publish_attempts", &self.publish_attempts)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Creates a publisher using the lock and retry settings of `config`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        signal: Arc<dyn ClusterSignal>,
        config: &BuildConfig,
    ) -> Self {
        Self {
            storage,
            signal,
            lock_ttl: config.lock_ttl(),
            lock_attempts: config.lock_max_retries,
            publish_attempts: config.publish_retries.max(1),
        }
    }

    /// Merges `input` into the current generation and publishes the result.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Failed` with phase `Merge` if the current state
    /// cannot be read, and phase `Publish` if the lock cannot be taken or a
    /// write fails. Temporary objects are left for
    /// [`discard_build`] to remove.
    pub async fn publish(
        &self,
        ctx: &BuildContext,
        input: MergeInput<'_>,
    ) -> Result<GenerationManifest> {
        let lock = DistributedLock::for_artifact(Arc::clone(&self.storage), ctx.artifact);

        for attempt in 1..=self.publish_attempts {
            let guard = lock
                .acquire_for(
                    self.lock_ttl,
                    self.lock_attempts,
                    Some(format!("publish {}", ctx.build)),
                )
                .await
                .map_err(|e| ctx.failed(BuildPhase::Publish, e))?;

            let result = self.publish_locked(ctx, &guard, input).await;
            let released = guard.release().await;
            if let Err(e) = &released {
                tracing::warn!(artifact = %ctx.artifact, error = %e, "failed to release publish lock");
            }

            match result? {
                Attempt::Committed(generation) => return Ok(generation),
                Attempt::LockLost => {
                    vista_core::metrics::record_publish_retry();
                    tracing::warn!(
                        artifact = %ctx.artifact,
                        build = %ctx.build,
                        attempt,
                        "publish lock expired before commit, retrying"
                    );
                }
            }
        }

        Err(ctx.failed(
            BuildPhase::Publish,
            format!("lost the artifact lock on all {} attempts", self.publish_attempts),
        ))
    }

    async fn publish_locked(
        &self,
        ctx: &BuildContext,
        guard: &LockGuard,
        input: MergeInput<'_>,
    ) -> Result<Attempt> {
        let storage = self.storage.as_ref();
        let merge_failed = |e: vista_core::Error| ctx.failed(BuildPhase::Merge, e);
        let publish_failed = |e: vista_core::Error| ctx.failed(BuildPhase::Publish, e);

        let stored: Option<ArtifactDefinition> =
            read_json(storage, &ArtifactPaths::definition(ctx.artifact))
                .await
                .map_err(merge_failed)?;
        let current = GenerationManifest::load(storage, ctx.artifact)
            .await
            .map_err(merge_failed)?;

        // Registrations may have changed while the build ran; the stored
        // definition is authoritative for them.
        let definition = stored.unwrap_or_else(|| input.definition.clone());
        let prior = current
            .unwrap_or_else(|| GenerationManifest::empty(definition.clone(), input.codec));
        let generation = merge_generation(
            &prior,
            MergeInput {
                definition: &definition,
                ..input
            },
        );

        self.signal
            .notify(ClusterEvent::PublishStarting {
                artifact: ctx.artifact,
                build: ctx.build,
            })
            .await
            .map_err(publish_failed)?;

        for block in input.new_blocks {
            let tmp = ArtifactPaths::tmp_block(ctx.artifact, ctx.build, &block.id);
            let committed = ArtifactPaths::block(ctx.artifact, &block.id);
            if storage.head(&tmp).await.map_err(publish_failed)?.is_some() {
                storage.rename(&tmp, &committed).await.map_err(publish_failed)?;
            } else if storage.head(&committed).await.map_err(publish_failed)?.is_none() {
                return Err(publish_failed(vista_core::Error::NotFound(format!(
                    "block {} missing from both {tmp} and {committed}",
                    block.id
                ))));
            }
        }

        let tmp_definition = ArtifactPaths::tmp_definition(ctx.artifact, ctx.build);
        let tmp_generation = ArtifactPaths::tmp_generation(ctx.artifact, ctx.build);
        let definition_path = ArtifactPaths::definition(ctx.artifact);
        let generation_path = ArtifactPaths::generation(ctx.artifact);

        let definition_bytes = to_json_bytes(&generation.definition).map_err(publish_failed)?;
        let generation_bytes = to_json_bytes(&generation).map_err(publish_failed)?;
        storage
            .put(&tmp_definition, definition_bytes, WritePrecondition::None)
            .await
            .map_err(publish_failed)?;
        storage
            .put(&tmp_generation, generation_bytes, WritePrecondition::None)
            .await
            .map_err(publish_failed)?;

        if !guard.is_held().await.map_err(publish_failed)? {
            return Ok(Attempt::LockLost);
        }

        let previous_definition = match storage.get(&definition_path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(publish_failed(e)),
        };
        storage
            .rename(&tmp_definition, &definition_path)
            .await
            .map_err(publish_failed)?;

        if let Err(e) = storage.rename(&tmp_generation, &generation_path).await {
            restore_definition(storage, &definition_path, previous_definition).await;
            return Err(publish_failed(e));
        }

        tracing::info!(
            artifact = %ctx.artifact,
            build = %ctx.build,
            sequence = generation.sequence,
            blocks = generation.blocks.len(),
            rows = generation.row_count(),
            "generation published"
        );

        if let Err(e) = self
            .signal
            .notify(ClusterEvent::GenerationPublished {
                artifact: ctx.artifact,
                build: ctx.build,
                sequence: generation.sequence,
            })
            .await
        {
            tracing::warn!(artifact = %ctx.artifact, error = %e, "publish signal failed");
        }

        Ok(Attempt::Committed(generation))
    }
}

fn to_json_bytes<T: serde::Serialize>(value: &T) -> vista_core::Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec_pretty(value)?))
}

async fn restore_definition(storage: &dyn StorageBackend, path: &str, previous: Option<Bytes>) {
    let restored = match previous {
        Some(bytes) => storage
            .put(path, bytes, WritePrecondition::None)
            .await
            .map(|_| ()),
        None => storage.delete(path).await,
    };
    if let Err(e) = restored {
        tracing::error!(path, error = %e, "failed to restore definition after aborted publish");
    }
}

/// Removes every object `build` left behind.
///
/// Deletes the build's `_tmp/` objects and any committed block produced by
/// the build that the current generation does not reference. Returns the
/// number of objects deleted.
///
/// # Errors
///
/// Returns storage errors from listing or reading the current generation;
/// individual delete failures are logged and skipped.
pub async fn discard_build(
    storage: &dyn StorageBackend,
    artifact: ArtifactId,
    build: BuildId,
) -> vista_core::Result<usize> {
    let mut deleted = 0;

    for meta in storage.list(&ArtifactPaths::tmp_prefix(artifact, build)).await? {
        match storage.delete(&meta.path).await {
            Ok(()) => deleted += 1,
            Err(e) => tracing::warn!(path = %meta.path, error = %e, "failed to delete temporary object"),
        }
    }

    let current = GenerationManifest::load(storage, artifact).await?;
    for meta in storage.list(&ArtifactPaths::blocks_prefix(artifact)).await? {
        let Some(block) = ArtifactPaths::block_id_from_path(&meta.path) else {
            continue;
        };
        let referenced = current.as_ref().is_some_and(|g| g.contains_block(&block));
        if block.build_id() == Some(build) && !referenced {
            match storage.delete(&meta.path).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(path = %meta.path, error = %e, "failed to delete orphaned block"),
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::BuildMode;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use vista_core::generation::BlockRef;
    use vista_core::id::BlockId;
    use vista_core::signal::{BroadcastSignal, NoopSignal};
    use vista_test_utils::{OpKind, TracingMemoryBackend, sales_definition};

    fn ctx(def: &ArtifactDefinition) -> BuildContext {
        BuildContext {
            artifact: def.id,
            consumer: "dash".into(),
            build: BuildId::generate(),
        }
    }

    async fn stage_block(storage: &TracingMemoryBackend, ctx: &BuildContext, seq: u32) -> BlockRef {
        let id = BlockId::new(ctx.build, 0, seq);
        storage
            .put(
                &ArtifactPaths::tmp_block(ctx.artifact, ctx.build, &id),
                Bytes::from_static(b"block"),
                WritePrecondition::None,
            )
            .await
            .unwrap();
        BlockRef {
            id,
            partition: 0,
            rows: 1,
            bytes: 5,
            stats: BTreeMap::new(),
        }
    }

    fn input<'a>(ctx: &BuildContext, def: &'a ArtifactDefinition, blocks: &'a [BlockRef]) -> MergeInput<'a> {
        MergeInput {
            build: ctx.build,
            mode: BuildMode::Incremental,
            definition: def,
            new_blocks: blocks,
            codec: "json",
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_commits_blocks_and_manifest() {
        let storage = Arc::new(TracingMemoryBackend::new());
        let signal = BroadcastSignal::default();
        let mut events = signal.subscribe();
        let publisher = Publisher::new(storage.clone(), Arc::new(signal), &BuildConfig::default());
        let def = sales_definition("scope");
        let ctx = ctx(&def);
        let blocks = vec![stage_block(&storage, &ctx, 0).await, stage_block(&storage, &ctx, 1).await];

        let generation = publisher.publish(&ctx, input(&ctx, &def, &blocks)).await.unwrap();

        assert_eq!(generation.sequence, 1);
        assert_eq!(generation.blocks.len(), 2);
        let loaded = GenerationManifest::load(storage.as_ref(), def.id).await.unwrap().unwrap();
        assert_eq!(loaded, generation);
        assert!(storage.paths_under(&ArtifactPaths::tmp_root(def.id)).is_empty());
        assert_eq!(storage.paths_under(&ArtifactPaths::blocks_prefix(def.id)).len(), 2);

        assert!(matches!(events.recv().await.unwrap(), ClusterEvent::PublishStarting { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            ClusterEvent::GenerationPublished { sequence: 1, .. }
        ));

        let lock = DistributedLock::for_artifact(storage.clone(), def.id);
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn failed_manifest_rename_keeps_prior_state() {
        let storage = Arc::new(TracingMemoryBackend::new());
        let publisher = Publisher::new(storage.clone(), Arc::new(NoopSignal), &BuildConfig::default());
        let def = sales_definition("scope");

        let first = ctx(&def);
        let blocks = vec![stage_block(&storage, &first, 0).await];
        publisher.publish(&first, input(&first, &def, &blocks)).await.unwrap();
        let before_generation = storage.get(&ArtifactPaths::generation(def.id)).await.unwrap();
        let before_definition = storage.get(&ArtifactPaths::definition(def.id)).await.unwrap();

        let second = ctx(&def);
        let blocks = vec![stage_block(&storage, &second, 0).await];
        storage.inject_failure_on(OpKind::Rename, ArtifactPaths::generation(def.id));
        let err = publisher.publish(&second, input(&second, &def, &blocks)).await.unwrap_err();
        assert_eq!(err.phase(), Some(BuildPhase::Publish));
        storage.clear_failures();

        assert_eq!(storage.get(&ArtifactPaths::generation(def.id)).await.unwrap(), before_generation);
        assert_eq!(storage.get(&ArtifactPaths::definition(def.id)).await.unwrap(), before_definition);

        let removed = discard_build(storage.as_ref(), def.id, second.build).await.unwrap();
        assert!(removed >= 1);
        let committed = storage.paths_under(&ArtifactPaths::blocks_prefix(def.id));
        assert_eq!(committed, vec![ArtifactPaths::block(def.id, &BlockId::new(first.build, 0, 0))]);
        assert!(storage.paths_under(&ArtifactPaths::tmp_root(def.id)).is_empty());
    }

    #[tokio::test]
    async fn stored_registrations_survive_publish() {
        let storage = Arc::new(TracingMemoryBackend::new());
        let publisher = Publisher::new(storage.clone(), Arc::new(NoopSignal), &BuildConfig::default());
        let def = sales_definition("scope");

        let mut registered = def.clone();
        registered.register(vista_core::definition::Consumer::new(
            "late",
            vista_core::definition::Principal::user("bo"),
        ));
        vista_core::storage::write_json(storage.as_ref(), &ArtifactPaths::definition(def.id), &registered)
            .await
            .unwrap();

        let ctx = ctx(&def);
        let generation = publisher.publish(&ctx, input(&ctx, &def, &[])).await.unwrap();
        assert_eq!(generation.definition.consumers().len(), 1);
    }

    #[tokio::test]
    async fn held_lock_fails_publish() {
        let storage = Arc::new(TracingMemoryBackend::new());
        let config = BuildConfig {
            lock_max_retries: 1,
            ..BuildConfig::default()
        };
        let publisher = Publisher::new(storage.clone(), Arc::new(NoopSignal), &config);
        let def = sales_definition("scope");
        let _held = DistributedLock::for_artifact(storage.clone(), def.id)
            .acquire(Duration::from_secs(60), 1)
            .await
            .unwrap();

        let ctx = ctx(&def);
        let err = publisher.publish(&ctx, input(&ctx, &def, &[])).await.unwrap_err();
        assert_eq!(err.phase(), Some(BuildPhase::Publish));
        assert!(GenerationManifest::load(storage.as_ref(), def.id).await.unwrap().is_none());
    }
}
