//! Shared utilities for the quarry data pipeline.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]

mod hash;
pub use hash::*;
