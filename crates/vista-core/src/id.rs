//! Strongly-typed identifiers for vista entities.
//!
//! Artifact and build identifiers are ULIDs: lexicographically sortable by
//! creation time and globally unique without coordination. Block identifiers
//! are derived from the build that produced them so that a block name is
//! never reused across generations.
//!
//! # Example
//!
//! ```rust
//! use vista_core::id::{ArtifactId, BlockId, BuildId};
//!
//! let artifact = ArtifactId::generate();
//! let build = BuildId::generate();
//! let block = BlockId::new(build, 2, 0);
//! assert!(block.as_str().starts_with(&build.to_string()));
//! # let _ = artifact;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
                chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a materialized artifact (view).
    ArtifactId,
    "artifact ID"
);

ulid_id!(
    /// A unique identifier for one build cycle of an artifact.
    ///
    /// The build ID names the generation it produces and scopes every
    /// temporary object the build writes.
    BuildId,
    "build ID"
);

/// Identifier of one immutable block.
///
/// Format: `{build}-p{partition:04}-{seq:06}`. The build prefix keeps names
/// unique across generations; the partition and sequence components make the
/// name sort in the order the build produced the blocks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Creates the block ID for `seq`-th block of `partition` in `build`.
    #[must_use]
    pub fn new(build: BuildId, partition: u32, seq: u32) -> Self {
        Self(format!("{build}-p{partition:04}-{seq:06}"))
    }

    /// Wraps an existing block name without validation.
    ///
    /// Used for names read back from storage listings and by test doubles.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the block name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the build that produced this block, when the name is canonical.
    #[must_use]
    pub fn build_id(&self) -> Option<BuildId> {
        self.0.split('-').next().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlockId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_id_roundtrip() {
        let id = ArtifactId::generate();
        let parsed: ArtifactId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_build_id_is_rejected() {
        let err = "not-a-ulid".parse::<BuildId>().unwrap_err();
        assert!(err.to_string().contains("invalid build ID"));
    }

    #[test]
    fn block_ids_sort_in_production_order() {
        let build = BuildId::generate();
        let mut ids = vec![
            BlockId::new(build, 1, 0),
            BlockId::new(build, 0, 1),
            BlockId::new(build, 0, 0),
            BlockId::new(build, 10, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                BlockId::new(build, 0, 0),
                BlockId::new(build, 0, 1),
                BlockId::new(build, 1, 0),
                BlockId::new(build, 10, 0),
            ]
        );
    }

    #[test]
    fn block_id_remembers_its_build() {
        let build = BuildId::generate();
        assert_eq!(BlockId::new(build, 3, 7).build_id(), Some(build));
        assert_eq!(BlockId::from_raw("b0").build_id(), None);
    }
}
