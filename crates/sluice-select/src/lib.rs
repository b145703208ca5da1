//! Selection model for the Sluice streaming middleware.
//!
//! A [`Selection`] describes which part of one array variable a reader
//! wants: a spatial box (or the whole array, or one writer block), a
//! step range, an optional destination memory layout, an accuracy hint,
//! and optional strided/stencil downsampling. Selections are plain
//! values: every mutator validates a candidate before committing, so a
//! rejected change never leaves a half-applied selection behind.
//!
//! The [`stencil`] module implements the resampler that evaluates
//! strided and kernel-weighted selections over row-major data.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod selection;
pub mod stencil;

pub use codec::{decode_selection, encode_selection};
pub use error::SelectionError;
pub use selection::{Accuracy, Selection, SpatialSelection, Stencil};
pub use stencil::StencilPlan;
