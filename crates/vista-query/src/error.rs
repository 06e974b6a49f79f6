//! Error types for reads.

use vista_core::id::{ArtifactId, BlockId};

/// Result type alias for read operations.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Errors that can occur while answering a read.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A map task failed; the owning reduce task fails with it.
    #[error("map task for block {block} failed: {message}")]
    MapTaskFailed {
        /// Block the task was reading.
        block: BlockId,
        /// Failure description.
        message: String,
    },

    /// The read needs a column the artifact does not have. The artifact must
    /// be rebuilt; it is never served with missing data.
    #[error("artifact {artifact} has no column {column}")]
    ColumnMissing {
        /// Artifact that was read.
        artifact: ArtifactId,
        /// First missing column.
        column: String,
    },

    /// Cancelled before any partial result was available.
    #[error("query cancelled before any block completed")]
    Cancelled,

    /// Core error.
    #[error(transparent)]
    Core(#[from] vista_core::Error),
}

impl QueryError {
    /// Returns true for [`QueryError::ColumnMissing`].
    #[must_use]
    pub const fn is_column_missing(&self) -> bool {
        matches!(self, Self::ColumnMissing { .. })
    }

    /// Returns true for [`QueryError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
