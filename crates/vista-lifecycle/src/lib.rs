//! # vista-lifecycle
//!
//! The consumer-facing service: resolves cache keys to artifacts, decides
//! when they must be rebuilt, runs at most one build per artifact and
//! identity, shares equivalent artifacts and answers reads.
//!
//! ## Serve Path
//!
//! ```text
//! serve(key, ctx, plan)
//!   ├── Registry::resolve ──> exact user > group > role
//!   ├── FreshnessPolicy   ──> Fresh | Stale | Expired | Missing
//!   │     ├── stale    ──> answer now, refresh in background
//!   │     └── expired  ──> wait for build (or interim answer / Building)
//!   ├── PendingRegistry   ──> single-flight build per (artifact, identity)
//!   └── QueryCoordinator  ──> streamed or buffered result
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use vista_lifecycle::{CacheKey, LifecycleManager, RequestContext, Requestor};
//!
//! let manager = LifecycleManager::new(storage, executor, &config);
//! manager.load().await?;
//! manager.register(definition, Consumer::new("dashboard", Principal::group("sales"))).await?;
//!
//! let ctx = RequestContext::new(Requestor::user("ann").with_groups(["sales"]));
//! let outcome = manager
//!     .serve(&CacheKey::new("sales", "dashboard"), &ctx, QueryPlan::select(["region"]))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod cache;
pub mod definition_store;
pub mod error;
pub mod freshness;
pub mod identity;
pub mod manager;
pub mod pending;
pub mod registry;
pub mod sharing;

pub use cache::{DefinitionCache, EvictionListener};
pub use definition_store::{DefinitionStore, Revision, StorageDefinitionStore, StoredDefinition};
pub use error::{LifecycleError, Result};
pub use freshness::{CallMode, Freshness, FreshnessPolicy, ServeAction};
pub use identity::{BuildKey, CacheKey, MatchRank, Requestor};
pub use manager::{
    ArtifactHandle, LifecycleManager, RegisterOutcome, RequestContext, ServeOutcome,
};
pub use pending::{Admission, BuildHandle, BuildReporter, BuildStatus, PendingRegistry};
pub use registry::{Registry, RegistryEntry, Resolution};
pub use sharing::{KeepReason, ShareDecision, ShareStep, can_absorb, decide, plan_shares};
