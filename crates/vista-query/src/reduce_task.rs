//! Reduce-side accumulation of partial results.
//!
//! Partials are keyed by block id. Applying the same block twice replaces the
//! earlier partial, so at-least-once delivery of map results never counts a
//! block twice. The final result lists blocks in generation order regardless
//! of arrival order.

use std::collections::HashMap;

use vista_core::id::BlockId;
use vista_core::value::RowBatch;

use crate::map_task::PartialResult;

/// Effect of applying one partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// First partial for the block.
    New,
    /// Replaced an earlier partial for the same block.
    Replaced,
    /// The block is not part of the generation being reduced.
    Ignored,
}

/// Accumulates partial results for one read.
#[derive(Debug, Clone)]
pub struct ReduceTask {
    columns: Vec<String>,
    order: Vec<BlockId>,
    partials: HashMap<BlockId, RowBatch>,
    max_rows: Option<usize>,
    duplicates: u64,
}

impl ReduceTask {
    /// Creates a reduce task expecting partials for `order`, in generation
    /// order. `max_rows` enables early fulfillment.
    #[must_use]
    pub fn new(columns: Vec<String>, order: Vec<BlockId>, max_rows: Option<usize>) -> Self {
        Self {
            columns,
            partials: HashMap::with_capacity(order.len()),
            order,
            max_rows,
            duplicates: 0,
        }
    }

    /// Applies a partial result.
    pub fn apply(&mut self, partial: PartialResult) -> Applied {
        if !self.order.contains(&partial.block) {
            tracing::warn!(block = %partial.block, "partial result for unknown block ignored");
            return Applied::Ignored;
        }
        match self.partials.insert(partial.block, partial.batch) {
            None => Applied::New,
            Some(_) => {
                self.duplicates += 1;
                vista_core::metrics::record_reduce_duplicate();
                Applied::Replaced
            }
        }
    }

    /// Distinct blocks applied so far.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.partials.len()
    }

    /// Blocks expected.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.order.len()
    }

    /// Duplicate deliveries seen.
    #[must_use]
    pub const fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Rows accumulated so far.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.partials.values().map(RowBatch::len).sum()
    }

    /// Returns true when every expected block has been applied.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.partials.len() == self.order.len()
    }

    /// Returns true when the accumulated rows already satisfy the row cap.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.max_rows.is_some_and(|max| self.rows() >= max)
    }

    /// Concatenates the applied partials in generation order, truncated to
    /// the row cap.
    #[must_use]
    pub fn finish(mut self) -> RowBatch {
        let mut rows = Vec::with_capacity(self.rows());
        for block in &self.order {
            if let Some(batch) = self.partials.remove(block) {
                rows.extend(batch.rows);
            }
        }
        if let Some(max) = self.max_rows {
            rows.truncate(max);
        }
        RowBatch::new(self.columns, rows)
    }
}
