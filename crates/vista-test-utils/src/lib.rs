//! Shared test utilities for vista tests.
//!
//! - [`TracingMemoryBackend`]: in-memory storage with operation recording and
//!   fault injection
//! - [`InMemoryExecutor`]: query executor over in-memory tables
//! - [`SimulatedClock`]: manually advanced clock
//! - Fixtures for a small sales table and its artifact definition

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod clock;
pub mod executor;
pub mod fixtures;
pub mod storage;

pub use clock::*;
pub use executor::*;
pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("vista=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
