//! # vista-query
//!
//! Answers reads against the current generation of an artifact with a
//! map/reduce protocol.
//!
//! ## Read Path
//!
//! ```text
//! QueryCoordinator::execute(generation, plan)
//!   ├── MapTask (one per block, bounded concurrency)
//!   │     load block ──> decode ──> PlanEvaluator::evaluate_block
//!   └── ReduceTask (keyed by block id, duplicates replace)
//!         ├── streamable plan ──> ResultStream (chunks as blocks finish)
//!         └── global ops      ──> PlanEvaluator::finish ──> BufferedResult
//! ```
//!
//! Readers only consult the generation manifest they were handed, so a
//! publish that lands mid-read never mixes blocks of two generations.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod coordinator;
pub mod error;
pub mod evaluator;
pub mod map_task;
pub mod reduce_task;
pub mod stream;

pub use coordinator::QueryCoordinator;
pub use error::{QueryError, Result};
pub use evaluator::{FilterProjectEvaluator, PlanEvaluator};
pub use map_task::{MapContext, MapTask, PartialResult};
pub use reduce_task::{Applied, ReduceTask};
pub use stream::{BufferedResult, Completion, QueryResult, ResultChunk, ResultStream};
