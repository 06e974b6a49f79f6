//! Canonical storage paths.
//!
//! Every writer builds paths through [`ArtifactPaths`]; no path string is
//! hardcoded elsewhere.
//!
//! ```text
//! artifacts/{artifact}/
//! ├── definition.json            # definition store record
//! ├── generation.json            # current generation (reader entry point)
//! ├── blocks/
//! │   └── {block}.blk
//! └── _tmp/
//!     └── {build}/
//!         ├── blocks/{block}.blk
//!         ├── definition.json
//!         └── generation.json
//! locks/
//! └── artifacts/{artifact}.lock.json
//! ```

use crate::id::{ArtifactId, BlockId, BuildId};

/// Canonical path generator for artifact storage.
///
/// # Example
///
/// ```
/// use vista_core::id::ArtifactId;
/// use vista_core::paths::ArtifactPaths;
///
/// let id = ArtifactId::generate();
/// assert_eq!(ArtifactPaths::generation(id), format!("artifacts/{id}/generation.json"));
/// ```
pub struct ArtifactPaths;

impl ArtifactPaths {
    /// Root prefix of every artifact.
    pub const ROOT: &'static str = "artifacts/";

    /// Block file extension.
    pub const BLOCK_EXTENSION: &'static str = ".blk";

    /// Prefix holding everything belonging to `artifact`.
    #[must_use]
    pub fn prefix(artifact: ArtifactId) -> String {
        format!("{}{artifact}/", Self::ROOT)
    }

    /// Definition record.
    #[must_use]
    pub fn definition(artifact: ArtifactId) -> String {
        format!("{}definition.json", Self::prefix(artifact))
    }

    /// Current generation manifest.
    #[must_use]
    pub fn generation(artifact: ArtifactId) -> String {
        format!("{}generation.json", Self::prefix(artifact))
    }

    /// Prefix of committed blocks.
    #[must_use]
    pub fn blocks_prefix(artifact: ArtifactId) -> String {
        format!("{}blocks/", Self::prefix(artifact))
    }

    /// Committed block.
    #[must_use]
    pub fn block(artifact: ArtifactId, block: &BlockId) -> String {
        format!("{}{block}{}", Self::blocks_prefix(artifact), Self::BLOCK_EXTENSION)
    }

    /// Prefix of all temporary objects of `artifact`.
    #[must_use]
    pub fn tmp_root(artifact: ArtifactId) -> String {
        format!("{}_tmp/", Self::prefix(artifact))
    }

    /// Prefix of the temporary objects written by `build`.
    #[must_use]
    pub fn tmp_prefix(artifact: ArtifactId, build: BuildId) -> String {
        format!("{}{build}/", Self::tmp_root(artifact))
    }

    /// Temporary block written by `build`.
    #[must_use]
    pub fn tmp_block(artifact: ArtifactId, build: BuildId, block: &BlockId) -> String {
        format!(
            "{}blocks/{block}{}",
            Self::tmp_prefix(artifact, build),
            Self::BLOCK_EXTENSION
        )
    }

    /// Temporary definition written during publish.
    #[must_use]
    pub fn tmp_definition(artifact: ArtifactId, build: BuildId) -> String {
        format!("{}definition.json", Self::tmp_prefix(artifact, build))
    }

    /// Temporary generation manifest written during publish.
    #[must_use]
    pub fn tmp_generation(artifact: ArtifactId, build: BuildId) -> String {
        format!("{}generation.json", Self::tmp_prefix(artifact, build))
    }

    /// Publish lock record.
    #[must_use]
    pub fn lock(artifact: ArtifactId) -> String {
        format!("locks/artifacts/{artifact}.lock.json")
    }

    /// Extracts the block id from a committed block path.
    #[must_use]
    pub fn block_id_from_path(path: &str) -> Option<BlockId> {
        let name = path.rsplit('/').next()?;
        name.strip_suffix(Self::BLOCK_EXTENSION).map(BlockId::from_raw)
    }

    /// Extracts the build id from a temporary object path.
    #[must_use]
    pub fn build_id_from_tmp_path(artifact: ArtifactId, path: &str) -> Option<BuildId> {
        let rest = path.strip_prefix(&Self::tmp_root(artifact))?;
        rest.split('/').next()?.parse().ok()
    }
}
