//! Core types for the Sluice streaming middleware.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the fundamental vocabulary shared by every other crate in the
//! workspace: n-dimensional boxes and the row-major copy kernel,
//! element data types, and process/step identifiers.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod dims;
pub mod dtype;
pub mod error;
pub mod id;

pub use dims::{nd_copy, row_major_strides, BoxRegion, Dims};
pub use dtype::{decode_slice, encode_slice, DataType, Element};
pub use error::{DimsError, UnknownDataType};
pub use id::{Rank, StepId};
