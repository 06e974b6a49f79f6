//! Per-partition build jobs.
//!
//! A worker runs one sub-query through the [`QueryExecutor`], cuts the row
//! stream into runs of `block_rows`, encodes each run with the
//! [`BlockCodec`] and writes it as a temporary block under the build's
//! `_tmp/` prefix. Nothing a worker writes is visible to readers until the
//! publisher renames it.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use vista_core::codec::BlockCodec;
use vista_core::condition::Condition;
use vista_core::definition::ArtifactDefinition;
use vista_core::executor::{ExecutionRequest, QueryExecutor};
use vista_core::generation::BlockRef;
use vista_core::id::BlockId;
use vista_core::paths::ArtifactPaths;
use vista_core::storage::{StorageBackend, WritePrecondition, WriteResult};
use vista_core::value::Row;

use crate::error::{BuildContext, BuildPhase, Result};

/// Unit of work for one partition.
#[derive(Debug, Clone)]
pub struct BuildJob {
    /// Partition index.
    pub partition: u32,
    /// Condition restricting the source rows.
    pub condition: Condition,
}

/// Blocks produced by one job.
#[derive(Debug, Clone, Default)]
pub struct PartitionOutput {
    /// Partition index.
    pub partition: u32,
    /// Temporary blocks, in production order.
    pub blocks: Vec<BlockRef>,
}

impl PartitionOutput {
    /// Rows written by the job.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.blocks.iter().map(|b| b.rows).sum()
    }
}

/// Executes build jobs.
#[derive(Clone)]
pub struct Worker {
    storage: Arc<dyn StorageBackend>,
    executor: Arc<dyn QueryExecutor>,
    codec: Arc<dyn BlockCodec>,
    block_rows: usize,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("codec", &self.codec.name())
            .field("block_rows", &self.block_rows)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Creates a worker writing blocks of at most `block_rows` rows.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        executor: Arc<dyn QueryExecutor>,
        codec: Arc<dyn BlockCodec>,
        block_rows: usize,
    ) -> Self {
        Self {
            storage,
            executor,
            codec,
            block_rows: block_rows.max(1),
        }
    }

    /// Runs `job` for `definition`.
    ///
    /// Cancellation is observed while rows stream in, after the sub-query
    /// completes and after each block is encoded.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Cancelled` when `cancel` fires, and
    /// `BuildError::Failed` if the sub-query, encoding or block write fails.
    pub async fn run(
        &self,
        ctx: &BuildContext,
        definition: &ArtifactDefinition,
        job: BuildJob,
        cancel: &CancellationToken,
    ) -> Result<PartitionOutput> {
        let columns = definition.column_names();
        let request = ExecutionRequest {
            source: definition.source.clone(),
            columns: columns.clone(),
            condition: job.condition,
        };

        let set = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ctx.cancelled(BuildPhase::Execute)),
            set = self.executor.execute(request) => {
                set.map_err(|e| ctx.failed(BuildPhase::Execute, e))?
            }
        };
        if set.columns != columns {
            return Err(ctx.failed(
                BuildPhase::Execute,
                format!("executor returned columns {:?}, expected {columns:?}", set.columns),
            ));
        }

        let mut output = PartitionOutput {
            partition: job.partition,
            blocks: Vec::new(),
        };
        let mut rows = set.rows;
        let mut pending: Vec<Row> = Vec::with_capacity(self.block_rows);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ctx.cancelled(BuildPhase::Execute)),
                next = rows.next() => next,
            };
            match next {
                Some(Ok(row)) => {
                    pending.push(row);
                    if pending.len() >= self.block_rows {
                        let block = self
                            .flush(ctx, job.partition, &columns, &mut pending, &output, cancel)
                            .await?;
                        output.blocks.push(block);
                    }
                }
                Some(Err(e)) => return Err(ctx.failed(BuildPhase::Execute, e)),
                None => break,
            }
        }

        if cancel.is_cancelled() {
            return Err(ctx.cancelled(BuildPhase::Execute));
        }
        if !pending.is_empty() {
            let block = self
                .flush(ctx, job.partition, &columns, &mut pending, &output, cancel)
                .await?;
            output.blocks.push(block);
        }

        tracing::debug!(
            partition = job.partition,
            blocks = output.blocks.len(),
            rows = output.rows(),
            "partition built"
        );
        Ok(output)
    }

    async fn flush(
        &self,
        ctx: &BuildContext,
        partition: u32,
        columns: &[String],
        pending: &mut Vec<Row>,
        output: &PartitionOutput,
        cancel: &CancellationToken,
    ) -> Result<BlockRef> {
        let encoded = self
            .codec
            .encode(columns, pending)
            .map_err(|e| ctx.failed(BuildPhase::Encode, e))?;
        pending.clear();
        if cancel.is_cancelled() {
            return Err(ctx.cancelled(BuildPhase::Encode));
        }

        let seq = u32::try_from(output.blocks.len()).unwrap_or(u32::MAX);
        let id = BlockId::new(ctx.build, partition, seq);
        let path = ArtifactPaths::tmp_block(ctx.artifact, ctx.build, &id);
        let bytes = encoded.bytes.len() as u64;

        match self
            .storage
            .put(&path, encoded.bytes, WritePrecondition::DoesNotExist)
            .await
            .map_err(|e| ctx.failed(BuildPhase::Write, e))?
        {
            WriteResult::Success { .. } => {}
            WriteResult::PreconditionFailed { .. } => {
                return Err(ctx.failed(
                    BuildPhase::Write,
                    format!("temporary block already exists: {path}"),
                ));
            }
        }

        Ok(BlockRef {
            id,
            partition,
            rows: encoded.rows,
            bytes,
            stats: encoded.stats,
        })
    }
}
