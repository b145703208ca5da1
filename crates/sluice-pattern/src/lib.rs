//! Write/read patterns and the overlap resolution engine.
//!
//! Each writer rank describes what it wrote in a step as a list of
//! [`WriteBlock`]s; each reader rank describes what it wants as a list
//! of [`ReadRequest`]s. Pooled across ranks these form a
//! [`WritePattern`] and a [`ReadPattern`]. From the two patterns every
//! rank independently derives the same answer to two questions:
//!
//! - which blocks intersect which requests ([`overlap`]), and
//! - where each writer's bytes sit inside each reader's flat receive
//!   buffer ([`position`]).
//!
//! Determinism is the contract: positions depend only on the patterns
//! and ascending rank order, never on evaluation order, so no extra
//! round of communication is needed to agree on offsets.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod attribute;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod overlap;
pub mod position;
pub mod signature;

pub use attribute::{AttributeValue, Attributes};
pub use descriptor::{
    OperatorSpec, ReadPattern, ReadRequest, ShapeKind, VariableInfo, WriteBlock, WritePattern,
    WriterMetadata,
};
pub use error::PatternError;
pub use overlap::{pair, readers_for, resolve_request, writers_for, BlockOverlap, Pairing};
pub use position::{receive_len, reader_positions, writer_positions, OverlapAssignment};
pub use signature::{read_signature, write_signature};
