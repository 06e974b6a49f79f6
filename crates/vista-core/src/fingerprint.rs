//! Structural fingerprints of source queries.
//!
//! Two artifacts computed from the same plan must fingerprint identically even
//! when their plans differ in key order or in display naming (aliases,
//! captions, labels). The fingerprint is a SHA-256 over the canonical JSON of
//! the [`SourceQuery`] with those naming keys removed.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical_json::to_canonical_bytes_without;
use crate::error::{Error, Result};
use crate::plan::SourceQuery;

/// Keys that carry display names only and never change query results.
pub const NAMING_KEYS: &[&str] = &["alias", "caption", "label", "displayName", "description"];

/// Structural signature of a source query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints `source`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload cannot be serialized.
    pub fn of(source: &SourceQuery) -> Result<Self> {
        let bytes = to_canonical_bytes_without(source, NAMING_KEYS)
            .map_err(|e| Error::serialization(format!("fingerprint source query: {e}")))?;
        let digest = Sha256::digest(&bytes);
        Ok(Self(format!("sha256:{}", hex::encode(digest))))
    }

    /// Wraps a previously computed fingerprint.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the fingerprint string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
