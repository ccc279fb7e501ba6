//! Runtime type system and object graph for the quarry data pipeline.
//!
//! Every importer in the pipeline ultimately produces or consumes instances
//! of this object graph: reference-counted, header-prefixed objects whose
//! payloads are raw bytes laid out by a [`TypeDesc`] in a [`TypeTable`].
//! All process state lives in an explicit [`RuntimeContext`]; there are no
//! globals.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
#![warn(missing_docs)]

mod label;
pub use label::*;

mod descriptor;
pub use descriptor::*;

mod table;
pub use table::*;

mod object;
pub use object::*;

mod context;
pub use context::*;

/// Scalar codec helpers over little-endian canonical payload bytes.
pub mod scalar;

/// Object-graph walks: release, duplicate, temp-flag clearing.
pub mod graph;

mod error;
pub use error::*;
