//! Batch fingerprinting of media libraries.
//!
//! Oversized sources are first compressed on a bounded set of devices, then
//! every source (or its compressed copy) is fingerprinted by a fixed pool of
//! workers. The driver in [`pipeline`] ticks both stages and the reporter.

pub mod compress;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod probe;
pub mod registry;
pub mod report;
pub mod stage;
pub mod task;
pub mod toolchain;
pub mod vddb;

#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
pub mod test_utils;
