//! Build orchestration.
//!
//! A build moves through [`DispatchState`]s:
//!
//! ```text
//! Init -> {Partitioned, Single} -> Running -> {Completed, Failed, Cancelled}
//!      Completed -> Merged -> Published
//! ```
//!
//! Partitioned builds run one [`Worker`] job per partition on a `JoinSet`,
//! bounded by a semaphore sized to the configured parallelism. The first
//! failing job cancels its siblings through a child [`CancellationToken`];
//! the dispatcher still waits for every job to stop before cleaning up, so no
//! worker writes after cleanup has run.
//!
//! Cancellation is checked after partitioning, inside every job, before the
//! merge and before the publish. Any build that does not reach `Published`
//! removes every object it wrote and leaves the prior generation untouched.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vista_core::clock::{Clock, SystemClock};
use vista_core::codec::{BlockCodec, JsonBlockCodec};
use vista_core::condition::Condition;
use vista_core::config::{BuildConfig, VistaConfig};
use vista_core::definition::ArtifactDefinition;
use vista_core::executor::QueryExecutor;
use vista_core::generation::{BlockRef, GenerationManifest};
use vista_core::id::{ArtifactId, BuildId};
use vista_core::signal::{ClusterSignal, NoopSignal};
use vista_core::storage::StorageBackend;

use crate::error::{BuildContext, BuildError, BuildPhase, Result};
use crate::merge::{BuildMode, MergeInput, merge_generation};
use crate::partitioner::{FallbackReason, PartitionPlan, RangePartitioner};
use crate::publish::{Publisher, discard_build};
use crate::worker::{BuildJob, PartitionOutput, Worker};

/// State of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Build accepted, not yet planned.
    Init,
    /// Planned as several range jobs.
    Partitioned,
    /// Planned as one job.
    Single,
    /// Jobs running.
    Running,
    /// Every job finished.
    Completed,
    /// A job or a later phase failed.
    Failed,
    /// Cancellation was observed.
    Cancelled,
    /// New blocks merged with the prior generation.
    Merged,
    /// The merged generation is visible to readers.
    Published,
}

impl DispatchState {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Partitioned => "partitioned",
            Self::Single => "single",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Merged => "merged",
            Self::Published => "published",
        }
    }

    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Published)
    }

    /// Returns true if `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use DispatchState::{
            Cancelled, Completed, Failed, Init, Merged, Partitioned, Published, Running, Single,
        };
        matches!(
            (self, next),
            (Init, Partitioned | Single | Failed)
                | (Partitioned | Single, Running | Cancelled)
                | (Running, Completed | Failed | Cancelled)
                | (Completed | Merged, Failed | Cancelled)
                | (Completed, Merged)
                | (Merged, Published)
        )
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs the state of one build.
#[derive(Debug)]
struct StateMachine {
    state: DispatchState,
    artifact: ArtifactId,
}

impl StateMachine {
    const fn new(artifact: ArtifactId) -> Self {
        Self {
            state: DispatchState::Init,
            artifact,
        }
    }

    fn advance(&mut self, next: DispatchState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BuildError::Core(vista_core::Error::internal(format!(
                "invalid build transition {} -> {next} for artifact {}",
                self.state, self.artifact
            ))));
        }
        tracing::debug!(from = %self.state, to = %next, "build state");
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed` or `Cancelled` to match `error`.
    fn fail(&mut self, error: &BuildError) {
        let next = if error.is_cancelled() {
            DispatchState::Cancelled
        } else {
            DispatchState::Failed
        };
        if self.state.can_transition_to(next) {
            tracing::debug!(from = %self.state, to = %next, "build state");
            self.state = next;
        }
    }
}

/// A request to (re)build one artifact.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Definition to build.
    pub definition: ArtifactDefinition,
    /// Consumer the build runs for; used in logs and errors.
    pub consumer: String,
    /// Merge mode.
    pub mode: BuildMode,
    /// Per-build restriction on top of the definition's own pre-condition.
    pub pre_condition: Option<Condition>,
}

impl BuildRequest {
    /// Incremental build of `definition` for `consumer`.
    #[must_use]
    pub fn new(definition: ArtifactDefinition, consumer: impl Into<String>) -> Self {
        Self {
            definition,
            consumer: consumer.into(),
            mode: BuildMode::Incremental,
            pre_condition: None,
        }
    }

    /// Sets the merge mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the runtime pre-condition.
    #[must_use]
    pub fn with_pre_condition(mut self, condition: Condition) -> Self {
        self.pre_condition = Some(condition);
        self
    }
}

/// Result of a published build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Built artifact.
    pub artifact: ArtifactId,
    /// Build identity.
    pub build: BuildId,
    /// Published generation.
    pub generation: GenerationManifest,
    /// Number of jobs that ran.
    pub partitions: usize,
    /// Why the build ran unpartitioned, if it did.
    pub fallback: Option<FallbackReason>,
    /// Rows written by this build.
    pub rows: u64,
    /// Blocks written by this build.
    pub blocks: usize,
}

/// Runs builds end to end.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn StorageBackend>,
    executor: Arc<dyn QueryExecutor>,
    codec: Arc<dyn BlockCodec>,
    signal: Arc<dyn ClusterSignal>,
    clock: Arc<dyn Clock>,
    partitioner: RangePartitioner,
    config: BuildConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("codec", &self.codec.name())
            .field("partitioner", &self.partitioner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the JSON codec, no cluster signal and the
    /// system clock.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn QueryExecutor>,
        config: &VistaConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            codec: Arc::new(JsonBlockCodec),
            signal: Arc::new(NoopSignal),
            clock: Arc::new(SystemClock),
            partitioner: RangePartitioner::from_config(config),
            config: config.build.clone(),
        }
    }

    /// Uses `codec` to encode blocks.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn BlockCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Announces publishes through `signal`.
    #[must_use]
    pub fn with_signal(mut self, signal: Arc<dyn ClusterSignal>) -> Self {
        self.signal = signal;
        self
    }

    /// Reads time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The partitioner used to plan builds.
    #[must_use]
    pub const fn partitioner(&self) -> &RangePartitioner {
        &self.partitioner
    }

    /// The codec blocks are written with.
    #[must_use]
    pub fn codec(&self) -> Arc<dyn BlockCodec> {
        Arc::clone(&self.codec)
    }

    /// Builds, merges and publishes `request`.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Cancelled`] when `cancel` fires before the
    /// publish, and [`BuildError::Failed`] naming the failing phase
    /// otherwise. In both cases the build's objects have been removed and the
    /// prior generation is unchanged.
    pub async fn build(
        &self,
        request: BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildOutcome> {
        let ctx = BuildContext {
            artifact: request.definition.id,
            consumer: request.consumer.clone(),
            build: BuildId::generate(),
        };
        let span = vista_core::observability::build_span(
            &ctx.artifact.to_string(),
            &ctx.consumer,
            &ctx.build.to_string(),
        );

        async {
            let started = Instant::now();
            let result = self.run(&ctx, request, &cancel).await;
            let elapsed = started.elapsed().as_secs_f64();

            match &result {
                Ok(outcome) => {
                    vista_core::metrics::record_build_finished("published", outcome.rows, elapsed);
                }
                Err(e) => {
                    if e.is_cancelled() {
                        tracing::info!(phase = ?e.phase(), "build cancelled");
                    } else {
                        tracing::error!(
                            artifact = %ctx.artifact,
                            consumer = %ctx.consumer,
                            phase = ?e.phase(),
                            error = %e,
                            "build failed"
                        );
                    }
                    self.cleanup(&ctx).await;
                    vista_core::metrics::record_build_finished(e.outcome(), 0, elapsed);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        ctx: &BuildContext,
        request: BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuildOutcome> {
        let mut machine = StateMachine::new(ctx.artifact);
        let result = self.run_states(ctx, request, cancel, &mut machine).await;
        if let Err(e) = &result {
            machine.fail(e);
        }
        result
    }

    async fn run_states(
        &self,
        ctx: &BuildContext,
        request: BuildRequest,
        cancel: &CancellationToken,
        machine: &mut StateMachine,
    ) -> Result<BuildOutcome> {
        let definition = Arc::new(request.definition);
        let now = self.clock.now();
        let plan = self
            .partitioner
            .plan(&definition, request.pre_condition.as_ref(), now);

        tracing::Span::current().record("partitions", plan.partition_count());
        vista_core::metrics::record_build_started(request.mode.as_str(), plan.partition_count());
        machine.advance(if plan.is_partitioned() {
            DispatchState::Partitioned
        } else {
            DispatchState::Single
        })?;
        checkpoint(ctx, cancel, BuildPhase::Partition)?;

        machine.advance(DispatchState::Running)?;
        let worker = Worker::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.executor),
            Arc::clone(&self.codec),
            self.config.block_rows,
        );
        let outputs = match &plan {
            PartitionPlan::Single { condition, .. } => {
                let job = BuildJob {
                    partition: 0,
                    condition: condition.clone(),
                };
                vec![worker.run(ctx, &definition, job, cancel).await?]
            }
            PartitionPlan::Partitioned { .. } => {
                self.run_partitioned(ctx, &worker, &definition, &plan, cancel)
                    .await?
            }
        };
        machine.advance(DispatchState::Completed)?;

        let new_blocks: Vec<BlockRef> = outputs.into_iter().flat_map(|o| o.blocks).collect();
        let rows = new_blocks.iter().map(|b| b.rows).sum();
        let input = MergeInput {
            build: ctx.build,
            mode: request.mode,
            definition: &definition,
            new_blocks: &new_blocks,
            codec: self.codec.name(),
            now,
        };

        checkpoint(ctx, cancel, BuildPhase::Merge)?;
        let prior = GenerationManifest::load(self.storage.as_ref(), ctx.artifact)
            .await
            .map_err(|e| ctx.failed(BuildPhase::Merge, e))?
            .unwrap_or_else(|| GenerationManifest::empty((*definition).clone(), self.codec.name()));
        let merged = merge_generation(&prior, input);
        tracing::debug!(
            prior = prior.sequence,
            blocks = merged.blocks.len(),
            "merged generation"
        );
        machine.advance(DispatchState::Merged)?;

        checkpoint(ctx, cancel, BuildPhase::Publish)?;
        let publisher = Publisher::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.signal),
            &self.config,
        );
        let generation = publisher.publish(ctx, input).await?;
        if generation.sequence != merged.sequence {
            tracing::debug!(
                expected = merged.sequence,
                published = generation.sequence,
                "generation moved during build, merged again under lock"
            );
        }
        machine.advance(DispatchState::Published)?;

        Ok(BuildOutcome {
            artifact: ctx.artifact,
            build: ctx.build,
            generation,
            partitions: plan.partition_count(),
            fallback: plan.fallback_reason(),
            rows,
            blocks: new_blocks.len(),
        })
    }

    async fn run_partitioned(
        &self,
        ctx: &BuildContext,
        worker: &Worker,
        definition: &Arc<ArtifactDefinition>,
        plan: &PartitionPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<PartitionOutput>> {
        let slots = Arc::new(Semaphore::new(self.partitioner.parallelism().max(1)));
        let siblings = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (partition, condition) in plan.jobs() {
            let worker = worker.clone();
            let ctx = ctx.clone();
            let definition = Arc::clone(definition);
            let slots = Arc::clone(&slots);
            let token = siblings.clone();
            let span = tracing::debug_span!("partition", partition);

            tasks.spawn(
                async move {
                    let _slot = tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(ctx.cancelled(BuildPhase::Execute)),
                        slot = slots.acquire_owned() => {
                            slot.map_err(|e| ctx.failed(BuildPhase::Execute, e))?
                        }
                    };
                    let job = BuildJob {
                        partition,
                        condition,
                    };
                    worker.run(&ctx, &definition, job, &token).await
                }
                .instrument(span),
            );
        }

        let mut outputs = Vec::with_capacity(plan.partition_count());
        let mut first_error: Option<BuildError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(ctx.failed(BuildPhase::Execute, format!("build job aborted: {e}")))
            });
            match result {
                Ok(output) => outputs.push(output),
                Err(e) => {
                    if first_error.is_none() {
                        siblings.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        outputs.sort_by_key(|o| o.partition);
        Ok(outputs)
    }

    async fn cleanup(&self, ctx: &BuildContext) {
        match discard_build(self.storage.as_ref(), ctx.artifact, ctx.build).await {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(deleted, "removed build objects"),
            Err(e) => tracing::warn!(error = %e, "failed to remove build objects"),
        }
    }
}

fn checkpoint(ctx: &BuildContext, cancel: &CancellationToken, phase: BuildPhase) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ctx.cancelled(phase));
    }
    Ok(())
}
