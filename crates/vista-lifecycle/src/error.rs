//! Error types for lifecycle operations.

use vista_build::BuildError;
use vista_core::id::ArtifactId;
use vista_query::QueryError;

/// Result type alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Errors surfaced to consumers of the lifecycle manager.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No artifact is registered for the consumer.
    #[error("no artifact registered for consumer {consumer} on {table}")]
    NotFound {
        /// Consumer name.
        consumer: String,
        /// Source table.
        table: String,
    },

    /// The artifact is unknown to the registry.
    #[error("artifact {0} is not registered")]
    UnknownArtifact(ArtifactId),

    /// The read needs a column the current generation lacks. A rebuild has
    /// been triggered; the read is never answered with missing data.
    #[error("artifact {artifact} needs a rebuild: column {column} is missing")]
    NeedsRebuild {
        /// Artifact that was read.
        artifact: ArtifactId,
        /// Missing column.
        column: String,
    },

    /// The read names a column the artifact does not declare. Rebuilding
    /// cannot add it; the consumer must register a definition that has it.
    #[error("artifact {artifact} does not declare column {column}")]
    UndeclaredColumn {
        /// Artifact that was read.
        artifact: ArtifactId,
        /// Column the read asked for.
        column: String,
    },

    /// A build awaited by the caller failed.
    #[error("build of {artifact} failed: {message}")]
    BuildFailed {
        /// Artifact being built.
        artifact: ArtifactId,
        /// Failure description.
        message: String,
    },

    /// A build awaited by the caller was cancelled; nothing changed.
    #[error("build of {artifact} was cancelled")]
    BuildCancelled {
        /// Artifact being built.
        artifact: ArtifactId,
    },

    /// Build error.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Read error.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Core error.
    #[error(transparent)]
    Core(#[from] vista_core::Error),
}

impl LifecycleError {
    /// Returns true for [`LifecycleError::NeedsRebuild`].
    #[must_use]
    pub const fn needs_rebuild(&self) -> bool {
        matches!(self, Self::NeedsRebuild { .. })
    }

    /// Returns true when nothing is registered for the request.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::UnknownArtifact(_))
    }
}
