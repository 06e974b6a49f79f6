//! # vista-core
//!
//! Shared primitives for the vista materialized-view engine.
//!
//! - **Data model**: artifact definitions, columns and ranges, generations, blocks
//! - **Conditions and plans**: the narrow condition model and opaque query plans
//! - **Storage substrate**: object storage trait, atomic rename, publish lock
//! - **Seams**: query executor, block codec, clock and cluster signal traits
//! - **Ambient stack**: errors, configuration, logging, metrics
//!
//! ## Crate Boundary
//!
//! `vista-core` is the only crate that defines types shared between the build,
//! query and lifecycle crates.
//!
//! ## Example
//!
//! ```rust
//! use vista_core::prelude::*;
//!
//! let source = SourceQuery::new("sales", serde_json::json!({"groupBy": ["region"]}));
//! let def = ArtifactDefinition::new(
//!     "sales by region",
//!     "analytics",
//!     source,
//!     vec![Column::dimension("region", ColumnType::String)],
//! )
//! .unwrap();
//! assert!(def.sharing.fingerprint.as_str().starts_with("sha256:"));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod canonical_json;
pub mod clock;
pub mod codec;
pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod generation;
pub mod id;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod paths;
pub mod plan;
pub mod schema;
pub mod signal;
pub mod storage;
pub mod value;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::codec::{BlockCodec, DecodedBlock, EncodedBlock, JsonBlockCodec};
    pub use crate::condition::{CompareOp, Condition, Junction, Term};
    pub use crate::config::VistaConfig;
    pub use crate::definition::{ArtifactDefinition, Consumer, Principal, PrincipalKind};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{ExecutionRequest, QueryExecutor, RowCount, RowSet, RowStream};
    pub use crate::fingerprint::Fingerprint;
    pub use crate::generation::{BlockRef, GenerationManifest};
    pub use crate::id::{ArtifactId, BlockId, BuildId};
    pub use crate::lock::{DistributedLock, FencingToken, LockGuard};
    pub use crate::paths::ArtifactPaths;
    pub use crate::plan::{GlobalOps, QueryPlan, SourceQuery};
    pub use crate::schema::{Column, ColumnRange, ColumnRole, ColumnType, DictionaryRef};
    pub use crate::signal::{BroadcastSignal, ClusterEvent, ClusterSignal, NoopSignal};
    pub use crate::storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
    pub use crate::value::{Row, RowBatch, ScalarValue};
}

pub use error::{Error, Result};
pub use id::{ArtifactId, BlockId, BuildId};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
