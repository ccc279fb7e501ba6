//! Reflection-driven transcoding between independently-described layouts.
//!
//! Two call shapes: [`batch_convert`] works element-wise over strided byte
//! buffers; [`convert`] works at the object-graph level, adding plugin
//! dispatch, external-reference policy, copy-on-write duplication of shared
//! subgraphs and a hard recursion budget.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc, clippy::too_many_arguments)]

mod batch;
pub use batch::*;

mod dispatch;
pub use dispatch::*;

mod error;
pub use error::*;
