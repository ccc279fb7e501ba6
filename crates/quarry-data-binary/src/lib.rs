//! The binary container format: serializing an arbitrary, cyclic,
//! reference-counted object graph to a relocatable byte blob and
//! reconstructing it, across endianness and 32/64-bit slot widths.
//!
//! Layout: a 16-byte value header doubling as the file header, the root
//! payload, then a tail of type-table entries, name strings, string/array
//! data and nested values, 32-byte aligned in total. Structural metadata
//! (headers, the type table, every stored offset) is always little-endian;
//! only data scalars follow the header's endianness flag.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc, clippy::too_many_arguments)]

mod format;
pub use format::*;

mod writer;
pub use writer::*;

mod reader;
pub use reader::*;

mod error;
pub use error::*;
