//! Cluster-state refresh signal.
//!
//! Publishing a generation and deleting an artifact change what other nodes
//! should serve. The publisher announces both around the change; nodes
//! holding cached definitions or manifests refresh them on receipt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::id::{ArtifactId, BuildId};

/// Event announced to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClusterEvent {
    /// A build holds the publish lock and is about to replace the generation.
    PublishStarting {
        /// Artifact being published.
        artifact: ArtifactId,
        /// Build publishing it.
        build: BuildId,
    },
    /// A new generation is visible.
    GenerationPublished {
        /// Artifact that changed.
        artifact: ArtifactId,
        /// Build that produced it.
        build: BuildId,
        /// New generation number.
        sequence: u64,
    },
    /// An artifact and its blocks were deleted.
    ArtifactDeleted {
        /// Deleted artifact.
        artifact: ArtifactId,
    },
}

impl ClusterEvent {
    /// Artifact the event is about.
    #[must_use]
    pub const fn artifact(&self) -> ArtifactId {
        match self {
            Self::PublishStarting { artifact, .. }
            | Self::GenerationPublished { artifact, .. }
            | Self::ArtifactDeleted { artifact } => *artifact,
        }
    }
}

/// Delivers [`ClusterEvent`]s to the rest of the cluster.
#[async_trait]
pub trait ClusterSignal: Send + Sync + 'static {
    /// Announces `event`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event could not be delivered; publishers treat
    /// that as a publish failure only for `PublishStarting`.
    async fn notify(&self, event: ClusterEvent) -> Result<()>;
}

/// Signal that drops every event (single-node deployments).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignal;

#[async_trait]
impl ClusterSignal for NoopSignal {
    async fn notify(&self, _event: ClusterEvent) -> Result<()> {
        Ok(())
    }
}

/// In-process fan-out over a Tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSignal {
    tx: broadcast::Sender<ClusterEvent>,
}

impl BroadcastSignal {
    /// Creates a signal buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSignal {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl ClusterSignal for BroadcastSignal {
    async fn notify(&self, event: ClusterEvent) -> Result<()> {
        tracing::debug!(?event, "cluster signal");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
        Ok(())
    }
}
