//! Generation merge.
//!
//! Merging is a pure function of the prior generation, the build's
//! definition snapshot and the new blocks. The publisher may call it more
//! than once when another publish raced ours; nothing here touches storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use vista_core::definition::ArtifactDefinition;
use vista_core::generation::{BlockRef, GenerationManifest};
use vista_core::id::BuildId;
use vista_core::schema::ColumnRange;

/// How new blocks combine with the prior generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Append the new blocks after the prior generation.
    #[default]
    Incremental,
    /// Replace the prior generation.
    Full,
}

impl BuildMode {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Full => "full",
        }
    }
}

/// Inputs of one merge.
#[derive(Debug, Clone, Copy)]
pub struct MergeInput<'a> {
    /// Build producing the new blocks.
    pub build: BuildId,
    /// Merge mode.
    pub mode: BuildMode,
    /// Definition the build ran with.
    pub definition: &'a ArtifactDefinition,
    /// New blocks, in any order.
    pub new_blocks: &'a [BlockRef],
    /// Codec that encoded the new blocks.
    pub codec: &'a str,
    /// Publish time.
    pub now: DateTime<Utc>,
}

/// Union of per-column statistics.
#[must_use]
pub fn union_stats(
    a: &BTreeMap<String, ColumnRange>,
    b: &BTreeMap<String, ColumnRange>,
) -> BTreeMap<String, ColumnRange> {
    let mut out = a.clone();
    for (column, range) in b {
        let merged = out
            .get(column)
            .map_or_else(|| range.clone(), |existing| existing.widen(range));
        out.insert(column.clone(), merged);
    }
    out
}

/// Statistics over a block list.
#[must_use]
pub fn block_stats(blocks: &[BlockRef]) -> BTreeMap<String, ColumnRange> {
    blocks
        .iter()
        .fold(BTreeMap::new(), |acc, block| union_stats(&acc, &block.stats))
}

/// Merges new blocks into `prior`, producing the next generation.
///
/// - Prior blocks come first, unchanged; new blocks follow ordered by
///   partition, then by block id.
/// - In [`BuildMode::Full`] the prior blocks are dropped, unless the build
///   produced no blocks at all.
/// - With no new blocks the prior blocks are kept in either mode and only the
///   build time is recorded.
/// - Column ranges are the union of the prior definition's ranges and the
///   new block statistics; they never narrow.
#[must_use]
pub fn merge_generation(prior: &GenerationManifest, input: MergeInput<'_>) -> GenerationManifest {
    let mut new_blocks = input.new_blocks.to_vec();
    new_blocks.sort_by(|a, b| a.partition.cmp(&b.partition).then_with(|| a.id.cmp(&b.id)));

    let mut blocks = match input.mode {
        BuildMode::Full if !new_blocks.is_empty() => Vec::new(),
        BuildMode::Full | BuildMode::Incremental => prior.blocks.clone(),
    };
    blocks.extend(new_blocks);

    let mut definition = input.definition.clone();
    let prior_ranges: BTreeMap<String, ColumnRange> = prior
        .definition
        .columns
        .iter()
        .filter(|c| !c.range.is_empty())
        .map(|c| (c.name.clone(), c.range.clone()))
        .collect();
    definition.widen_ranges(&prior_ranges);
    definition.widen_ranges(&block_stats(input.new_blocks));
    definition.sharing.has_data = definition.sharing.has_data || prior.definition.sharing.has_data;
    definition.mark_built(input.now, !blocks.is_empty());

    // Keep whichever codec the surviving prior blocks were written with when
    // nothing new was added.
    let codec = if input.new_blocks.is_empty() && !blocks.is_empty() {
        prior.codec.clone()
    } else {
        input.codec.to_string()
    };

    GenerationManifest {
        artifact: definition.id,
        sequence: prior.sequence + 1,
        build: Some(input.build),
        codec,
        published_at: Some(input.now),
        definition,
        blocks,
    }
}
