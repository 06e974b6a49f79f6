//! Error types for build operations.

use std::fmt;

use vista_core::id::ArtifactId;

/// Result type alias for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Phase of a build, recorded on cancellation and failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildPhase {
    /// Planning partitions.
    Partition,
    /// Running a sub-query.
    Execute,
    /// Encoding rows into blocks.
    Encode,
    /// Writing temporary blocks.
    Write,
    /// Merging with the prior generation.
    Merge,
    /// Publishing under the artifact lock.
    Publish,
}

impl BuildPhase {
    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Partition => "partition",
            Self::Execute => "execute",
            Self::Encode => "encode",
            Self::Write => "write",
            Self::Merge => "merge",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while building an artifact.
///
/// Partition fallback is not an error: it is reported through
/// [`crate::partitioner::PartitionPlan::Single`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Cooperative cancellation was observed. No change occurred; the prior
    /// generation remains authoritative.
    #[error("build of {artifact} cancelled during {phase}")]
    Cancelled {
        /// Artifact being built.
        artifact: ArtifactId,
        /// Checkpoint that observed the cancellation.
        phase: BuildPhase,
    },

    /// The build failed and its temporary objects were removed.
    #[error("build of {artifact} for {consumer} failed during {phase}: {message}")]
    Failed {
        /// Artifact being built.
        artifact: ArtifactId,
        /// Consumer the build ran for.
        consumer: String,
        /// Failing phase.
        phase: BuildPhase,
        /// Failure description.
        message: String,
    },

    /// Core error outside any build phase.
    #[error(transparent)]
    Core(#[from] vista_core::Error),
}

impl BuildError {
    /// Returns true for [`BuildError::Cancelled`].
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Phase the error occurred in, if known.
    #[must_use]
    pub const fn phase(&self) -> Option<BuildPhase> {
        match self {
            Self::Cancelled { phase, .. } | Self::Failed { phase, .. } => Some(*phase),
            Self::Core(_) => None,
        }
    }

    /// Outcome label used for metrics.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        if self.is_cancelled() { "cancelled" } else { "failed" }
    }
}

/// Identity of one running build, used to attribute errors.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Artifact being built.
    pub artifact: ArtifactId,
    /// Consumer the build runs for.
    pub consumer: String,
    /// Build identity.
    pub build: vista_core::id::BuildId,
}

impl BuildContext {
    /// A cancellation error for `phase`.
    #[must_use]
    pub const fn cancelled(&self, phase: BuildPhase) -> BuildError {
        BuildError::Cancelled {
            artifact: self.artifact,
            phase,
        }
    }

    /// A failure error for `phase`.
    #[must_use]
    pub fn failed(&self, phase: BuildPhase, error: impl fmt::Display) -> BuildError {
        BuildError::Failed {
            artifact: self.artifact,
            consumer: self.consumer.clone(),
            phase,
            message: error.to_string(),
        }
    }
}
