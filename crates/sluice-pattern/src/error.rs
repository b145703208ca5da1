//! Error type for pattern matching and pattern codecs.

use sluice_core::{DataType, Rank};
use sluice_select::SelectionError;
use std::error::Error;
use std::fmt;

/// Errors from overlap resolution and pattern decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatternError {
    /// A reader asked for a variable with a different element type than
    /// the writers declared.
    TypeMismatch {
        /// Variable name.
        variable: String,
        /// Type declared by the writers.
        written: DataType,
        /// Type requested by the reader.
        requested: DataType,
        /// Reader rank that issued the request.
        reader: Rank,
    },
    /// A request no longer matches the current write layout.
    LayoutConflict {
        /// Variable name.
        variable: String,
        /// What changed.
        reason: String,
    },
    /// A request names a variable absent from the write pattern.
    UnknownVariable {
        /// Variable name.
        variable: String,
    },
    /// The selection behind a request is invalid for this variable.
    Selection {
        /// Variable name.
        variable: String,
        /// Underlying selection error.
        source: SelectionError,
    },
    /// A pattern document could not be encoded or decoded.
    Codec(String),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch {
                variable,
                written,
                requested,
                reader,
            } => write!(
                f,
                "type mismatch on '{variable}': written as {written}, \
                 reader {reader} requested {requested}"
            ),
            Self::LayoutConflict { variable, reason } => {
                write!(f, "layout conflict on '{variable}': {reason}")
            }
            Self::UnknownVariable { variable } => write!(f, "unknown variable '{variable}'"),
            Self::Selection { variable, source } => {
                write!(f, "invalid selection on '{variable}': {source}")
            }
            Self::Codec(reason) => write!(f, "pattern codec: {reason}"),
        }
    }
}

impl Error for PatternError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Selection { source, .. } => Some(source),
            _ => None,
        }
    }
}
