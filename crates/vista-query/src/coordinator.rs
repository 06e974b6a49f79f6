//! Map/reduce read coordination.
//!
//! One map task runs per block of the generation, at most
//! `map_concurrency` at a time. Row-level plans stream: each new partial is
//! cut into chunks of `stream_chunk_rows` and forwarded as soon as its map
//! task finishes. Plans with global operations buffer until every block is
//! in, then let the [`PlanEvaluator`] finish them.
//!
//! A row cap fulfills a streamable read early; the remaining map tasks are
//! dropped. Cancellation returns what has been reduced so far, or
//! [`QueryError::Cancelled`] when nothing has.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use vista_core::codec::{BlockCodec, JsonBlockCodec};
use vista_core::config::QueryConfig;
use vista_core::generation::GenerationManifest;
use vista_core::plan::QueryPlan;
use vista_core::storage::StorageBackend;

use crate::error::{QueryError, Result};
use crate::evaluator::{FilterProjectEvaluator, PlanEvaluator};
use crate::map_task::{MapContext, MapTask, PartialResult};
use crate::reduce_task::{Applied, ReduceTask};
use crate::stream::{BufferedResult, Completion, Frame, QueryResult, ResultChunk, ResultStream};

/// Answers reads against published generations.
#[derive(Clone)]
pub struct QueryCoordinator {
    storage: Arc<dyn StorageBackend>,
    codec: Arc<dyn BlockCodec>,
    evaluator: Arc<dyn PlanEvaluator>,
    chunk_rows: usize,
    concurrency: usize,
}

impl std::fmt::Debug for QueryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCoordinator")
            .field("codec", &self.codec.name())
            .field("chunk_rows", &self.chunk_rows)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl QueryCoordinator {
    /// Creates a coordinator with the JSON codec and the filter/project
    /// evaluator.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: &QueryConfig) -> Self {
        Self {
            storage,
            codec: Arc::new(JsonBlockCodec),
            evaluator: Arc::new(FilterProjectEvaluator),
            chunk_rows: config.stream_chunk_rows.max(1),
            concurrency: config.map_concurrency.max(1),
        }
    }

    /// Decodes blocks with `codec`.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn BlockCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Evaluates plans with `evaluator`.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn PlanEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Answers `plan` against `generation`, streaming when the plan allows.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ColumnMissing`] if the artifact lacks a column
    /// the plan reads, map task failures for buffered reads, and
    /// [`QueryError::Cancelled`] if cancelled before any block completed.
    /// Streaming reads report map failures through the stream.
    pub async fn execute(
        &self,
        generation: &GenerationManifest,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<QueryResult> {
        if plan.is_streamable() {
            self.stream(generation, plan, cancel).map(QueryResult::Streaming)
        } else {
            self.collect(generation, plan, cancel)
                .await
                .map(QueryResult::Buffered)
        }
    }

    /// Answers `plan` with a fully buffered result.
    ///
    /// # Errors
    ///
    /// See [`QueryCoordinator::execute`]; map failures are returned directly.
    pub async fn collect(
        &self,
        generation: &GenerationManifest,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<BufferedResult> {
        self.validate(generation, &plan)?;
        let span = vista_core::observability::query_span(
            &generation.artifact.to_string(),
            generation.sequence,
        );
        span.record("blocks", generation.blocks.len());

        async move {
            let streamable = plan.is_streamable();
            let plan = Arc::new(plan);
            let blocks_total = generation.blocks.len();
            let mut reduce = ReduceTask::new(
                plan.columns.clone(),
                generation.block_ids().cloned().collect(),
                plan.max_rows.filter(|_| streamable),
            );

            let mut results = self.map_results(generation, Arc::clone(&plan));
            let mut completion = Completion::Complete;
            loop {
                let next = tokio::select! {
                    biased;
                    () = cancel.cancelled(), if !reduce.is_complete() => {
                        completion = Completion::Cancelled;
                        break;
                    }
                    next = results.next() => next,
                };
                match next {
                    None => break,
                    Some(Ok(partial)) => {
                        reduce.apply(partial);
                        if !reduce.is_complete() && reduce.is_fulfilled() {
                            completion = Completion::Fulfilled;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "map task failed, failing read");
                        return Err(e);
                    }
                }
            }
            drop(results);

            let blocks_applied = reduce.applied();
            record_map_tasks(blocks_applied, blocks_total);
            if completion == Completion::Cancelled && blocks_applied == 0 {
                return Err(QueryError::Cancelled);
            }

            let mut batch = reduce.finish();
            if !streamable {
                batch = self.evaluator.finish(batch, &plan)?;
                if let Some(max) = plan.max_rows {
                    batch.rows.truncate(max);
                }
            }
            tracing::debug!(
                rows = batch.len(),
                blocks_applied,
                ?completion,
                "read buffered"
            );
            Ok(BufferedResult {
                generation: generation.sequence,
                batch,
                blocks_applied,
                blocks_total,
                completion,
            })
        }
        .instrument(span)
        .await
    }

    /// Answers a row-level `plan` as a chunk stream.
    ///
    /// Cancelling after some block was applied ends the stream cleanly with
    /// [`Completion::Cancelled`] recorded on it; cancelling earlier yields
    /// [`QueryError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ColumnMissing`] before any task starts.
    pub fn stream(
        &self,
        generation: &GenerationManifest,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<ResultStream> {
        self.validate(generation, &plan)?;
        let columns = plan.columns.clone();
        if generation.blocks.is_empty() {
            return Ok(ResultStream::empty(generation.sequence, columns));
        }

        let span = vista_core::observability::query_span(
            &generation.artifact.to_string(),
            generation.sequence,
        );
        span.record("blocks", generation.blocks.len());

        let plan = Arc::new(plan);
        let mut results = self.map_results(generation, Arc::clone(&plan));
        let mut reduce = ReduceTask::new(
            columns.clone(),
            generation.block_ids().cloned().collect(),
            plan.max_rows,
        );
        let blocks_total = generation.blocks.len();
        let chunk_rows = self.chunk_rows;
        let (tx, rx) = mpsc::channel::<Result<Frame>>(self.concurrency * 2);

        tokio::spawn(
            async move {
                let mut forwarded = 0_usize;
                let completion = loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            if reduce.applied() == 0 {
                                let _ = tx.send(Err(QueryError::Cancelled)).await;
                                return;
                            }
                            break Completion::Cancelled;
                        }
                        () = tx.closed() => return,
                        next = results.next() => next,
                    };
                    let partial = match next {
                        None => break Completion::Complete,
                        Some(Ok(partial)) => partial,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "map task failed, ending stream");
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };

                    let mut batch = partial.batch.clone();
                    if reduce.apply(partial) != Applied::New {
                        continue;
                    }
                    if let Some(max) = plan.max_rows {
                        batch.rows.truncate(max.saturating_sub(forwarded));
                    }
                    forwarded += batch.len();
                    for chunk in batch.into_chunks(chunk_rows) {
                        if tx.send(Ok(Frame::Chunk(ResultChunk { batch: chunk }))).await.is_err() {
                            return;
                        }
                    }
                    if reduce.is_fulfilled() {
                        tracing::debug!(forwarded, "row cap reached, skipping remaining blocks");
                        break Completion::Fulfilled;
                    }
                };
                record_map_tasks(reduce.applied(), blocks_total);
                let _ = tx.send(Ok(Frame::End(completion))).await;
            }
            .instrument(span),
        );

        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ResultStream::from_frames(generation.sequence, columns, frames))
    }

    fn validate(&self, generation: &GenerationManifest, plan: &QueryPlan) -> Result<()> {
        let mut required = plan.columns.clone();
        required.extend(plan.filter.compared_columns().into_iter().map(String::from));
        if let Some(column) = generation.definition.missing_column(&required) {
            return Err(QueryError::ColumnMissing {
                artifact: generation.artifact,
                column: column.to_string(),
            });
        }
        if !generation.blocks.is_empty() && generation.codec != self.codec.name() {
            return Err(QueryError::Core(vista_core::Error::InvalidInput(format!(
                "generation {} of {} was written with codec {}, reader uses {}",
                generation.sequence,
                generation.artifact,
                generation.codec,
                self.codec.name()
            ))));
        }
        Ok(())
    }

    fn map_results(
        &self,
        generation: &GenerationManifest,
        plan: Arc<QueryPlan>,
    ) -> BoxStream<'static, Result<PartialResult>> {
        let ctx = MapContext {
            artifact: generation.artifact,
            storage: Arc::clone(&self.storage),
            codec: Arc::clone(&self.codec),
            evaluator: Arc::clone(&self.evaluator),
            plan,
        };
        let tasks: Vec<MapTask> = generation
            .blocks
            .iter()
            .map(|block| MapTask::new(ctx.clone(), block.clone()))
            .collect();
        futures::stream::iter(tasks)
            .map(MapTask::run)
            .buffer_unordered(self.concurrency)
            .boxed()
    }
}

fn record_map_tasks(applied: usize, total: usize) {
    let run = u64::try_from(applied).unwrap_or(u64::MAX);
    let skipped = u64::try_from(total.saturating_sub(applied)).unwrap_or(u64::MAX);
    vista_core::metrics::record_map_tasks(run, skipped);
}
