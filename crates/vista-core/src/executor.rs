//! Query executor seam.
//!
//! Builds never evaluate source queries themselves. A deployment injects a
//! [`QueryExecutor`] that runs a [`SourceQuery`] restricted by a condition and
//! streams back typed rows.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::condition::Condition;
use crate::error::Result;
use crate::plan::SourceQuery;
use crate::value::Row;

/// Stream of rows produced by an executor.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// Row count of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    /// Count is known up front.
    Known(u64),
    /// Rows are still loading.
    Unknown,
}

/// One execution of a source query.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Query to run.
    pub source: SourceQuery,
    /// Columns to return, in order.
    pub columns: Vec<String>,
    /// Restriction applied to the source rows.
    pub condition: Condition,
}

/// Rows returned by an executor.
pub struct RowSet {
    /// Column names, aligned with every row.
    pub columns: Vec<String>,
    /// Row count, if known.
    pub row_count: RowCount,
    /// The rows.
    pub rows: RowStream,
}

impl fmt::Debug for RowSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSet")
            .field("columns", &self.columns)
            .field("row_count", &self.row_count)
            .finish_non_exhaustive()
    }
}

/// Executes source queries.
#[async_trait]
pub trait QueryExecutor: Send + Sync + 'static {
    /// Starts executing `request`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be started; errors while rows are
    /// streaming are reported as stream items.
    async fn execute(&self, request: ExecutionRequest) -> Result<RowSet>;
}
