//! Per-block map tasks.

use std::sync::Arc;

use vista_core::codec::BlockCodec;
use vista_core::generation::BlockRef;
use vista_core::id::{ArtifactId, BlockId};
use vista_core::paths::ArtifactPaths;
use vista_core::plan::QueryPlan;
use vista_core::storage::StorageBackend;
use vista_core::value::RowBatch;

use crate::error::{QueryError, Result};
use crate::evaluator::PlanEvaluator;

/// Partial result of one map task, tagged by block.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    /// Block the rows came from.
    pub block: BlockId,
    /// Rows, holding the plan's columns.
    pub batch: RowBatch,
}

/// Shared inputs of every map task of one read.
#[derive(Clone)]
pub struct MapContext {
    /// Artifact being read.
    pub artifact: ArtifactId,
    /// Storage holding the blocks.
    pub storage: Arc<dyn StorageBackend>,
    /// Codec the generation was written with.
    pub codec: Arc<dyn BlockCodec>,
    /// Plan evaluator.
    pub evaluator: Arc<dyn PlanEvaluator>,
    /// The read plan.
    pub plan: Arc<QueryPlan>,
}

impl std::fmt::Debug for MapContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapContext")
            .field("artifact", &self.artifact)
            .field("codec", &self.codec.name())
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Loads one block and evaluates the plan against it.
#[derive(Debug, Clone)]
pub struct MapTask {
    ctx: MapContext,
    block: BlockRef,
}

impl MapTask {
    /// Creates the task for `block`.
    #[must_use]
    pub const fn new(ctx: MapContext, block: BlockRef) -> Self {
        Self { ctx, block }
    }

    /// Block this task reads.
    #[must_use]
    pub const fn block(&self) -> &BlockRef {
        &self.block
    }

    /// Runs the task.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::ColumnMissing`] if the block lacks a column the
    /// plan needs and [`QueryError::MapTaskFailed`] for load, decode or
    /// evaluation failures.
    pub async fn run(self) -> Result<PartialResult> {
        let id = self.block.id;
        let failed = |message: String| QueryError::MapTaskFailed {
            block: id.clone(),
            message,
        };

        let path = ArtifactPaths::block(self.ctx.artifact, &id);
        let bytes = self
            .ctx
            .storage
            .get(&path)
            .await
            .map_err(|e| failed(format!("load {path}: {e}")))?;
        let decoded = self
            .ctx
            .codec
            .decode(&bytes)
            .map_err(|e| failed(format!("decode: {e}")))?;

        if let Some(column) = self
            .ctx
            .plan
            .columns
            .iter()
            .find(|c| decoded.column_index(c).is_none())
        {
            return Err(QueryError::ColumnMissing {
                artifact: self.ctx.artifact,
                column: column.clone(),
            });
        }

        let batch = self
            .ctx
            .evaluator
            .evaluate_block(&decoded, &self.ctx.plan)
            .map_err(|e| match e {
                QueryError::ColumnMissing { .. } => e,
                other => failed(other.to_string()),
            })?;
        tracing::trace!(block = %id, rows = batch.len(), "map task finished");
        Ok(PartialResult { block: id, batch })
    }
}
