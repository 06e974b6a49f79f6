//! Generation manifests.
//!
//! A generation is the complete set of blocks plus the definition snapshot of
//! one build cycle. The manifest at `artifacts/{id}/generation.json` is the
//! only object readers consult to find blocks, so replacing it with a single
//! rename switches every reader from one generation to the next.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::ArtifactDefinition;
use crate::error::Result;
use crate::id::{ArtifactId, BlockId, BuildId};
use crate::paths::ArtifactPaths;
use crate::schema::ColumnRange;
use crate::storage::{StorageBackend, read_json};

/// A committed block as listed in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    /// Block identity.
    pub id: BlockId,
    /// Build partition that produced the block.
    pub partition: u32,
    /// Row count.
    pub rows: u64,
    /// Encoded size in bytes.
    pub bytes: u64,
    /// Observed range per column.
    #[serde(default)]
    pub stats: BTreeMap<String, ColumnRange>,
}

/// One atomically visible generation of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationManifest {
    /// Artifact the generation belongs to.
    pub artifact: ArtifactId,
    /// Generation number; increases by one per publish, zero before the first.
    pub sequence: u64,
    /// Build that produced this generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildId>,
    /// Codec the blocks were encoded with.
    pub codec: String,
    /// When the generation was published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Definition snapshot the generation was built with.
    pub definition: ArtifactDefinition,
    /// Blocks in read order.
    pub blocks: Vec<BlockRef>,
}

impl GenerationManifest {
    /// The generation of an artifact that was never built.
    #[must_use]
    pub fn empty(definition: ArtifactDefinition, codec: impl Into<String>) -> Self {
        Self {
            artifact: definition.id,
            sequence: 0,
            build: None,
            codec: codec.into(),
            published_at: None,
            definition,
            blocks: Vec::new(),
        }
    }

    /// Returns true when the generation holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total row count.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.rows).sum()
    }

    /// Block ids in read order.
    pub fn block_ids(&self) -> impl Iterator<Item = &BlockId> {
        self.blocks.iter().map(|b| &b.id)
    }

    /// Returns true if `block` is part of this generation.
    #[must_use]
    pub fn contains_block(&self, block: &BlockId) -> bool {
        self.blocks.iter().any(|b| &b.id == block)
    }

    /// Union of every block's column statistics.
    #[must_use]
    pub fn column_stats(&self) -> BTreeMap<String, ColumnRange> {
        let mut out: BTreeMap<String, ColumnRange> = BTreeMap::new();
        for block in &self.blocks {
            for (column, range) in &block.stats {
                let merged = out.get(column).map_or_else(|| range.clone(), |r| r.widen(range));
                out.insert(column.clone(), merged);
            }
        }
        out
    }

    /// Loads the current generation of `artifact`, if one was published.
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn load(
        storage: &dyn StorageBackend,
        artifact: ArtifactId,
    ) -> Result<Option<Self>> {
        read_json(storage, &ArtifactPaths::generation(artifact)).await
    }
}
