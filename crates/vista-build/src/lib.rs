//! # vista-build
//!
//! Builds artifacts: plans range partitions, runs the partition jobs in
//! parallel, merges their blocks into the prior generation and publishes the
//! result atomically.
//!
//! ## Build Path
//!
//! ```text
//! BuildRequest
//!   └── RangePartitioner::plan ──> PartitionPlan (Single | Partitioned)
//!         └── Worker (one per partition) ──> _tmp/{build}/blocks/*.blk
//!               └── merge_generation ──> GenerationManifest
//!                     └── Publisher (artifact lock, rename) ──> generation.json
//! ```
//!
//! A build that fails or is cancelled removes its objects; readers keep
//! seeing the previous generation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use vista_build::{BuildRequest, Dispatcher};
//! use tokio_util::sync::CancellationToken;
//!
//! let dispatcher = Dispatcher::new(storage, executor, &config);
//! let outcome = dispatcher
//!     .build(BuildRequest::new(definition, "dashboard"), CancellationToken::new())
//!     .await?;
//! println!("published generation {}", outcome.generation.sequence);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatcher;
pub mod error;
pub mod gc;
pub mod merge;
pub mod partitioner;
pub mod publish;
pub mod worker;

pub use dispatcher::{BuildOutcome, BuildRequest, DispatchState, Dispatcher};
pub use error::{BuildContext, BuildError, BuildPhase, Result};
pub use gc::{GcReport, GcResult, GenerationCollector};
pub use merge::{BuildMode, MergeInput, merge_generation};
pub use partitioner::{FallbackReason, Partition, PartitionPlan, RangePartitioner};
pub use publish::{Publisher, discard_build};
pub use worker::{BuildJob, PartitionOutput, Worker};
