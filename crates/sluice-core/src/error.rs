//! Error types for box geometry and element type parsing.

use std::error::Error;
use std::fmt;

/// Errors from [`BoxRegion`](crate::BoxRegion) construction and
/// [`nd_copy`](crate::nd_copy).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimsError {
    /// Two shapes that must agree in dimensionality do not.
    DimensionMismatch {
        /// Dimensionality required by the operation.
        expected: usize,
        /// Dimensionality actually supplied.
        got: usize,
    },
    /// The copy region is not contained in the source or destination box.
    NotContained,
    /// A flat buffer is shorter than the box it is claimed to hold.
    BufferTooSmall {
        /// Bytes required by the box.
        needed: usize,
        /// Bytes available in the buffer.
        available: usize,
    },
    /// An end index or element count does not fit in `usize`.
    Overflow {
        /// First dimension where the arithmetic overflowed.
        dim: usize,
    },
}

impl fmt::Display for DimsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: expected {expected}, got {got}")
            }
            Self::NotContained => write!(f, "copy region not contained in buffer box"),
            Self::BufferTooSmall { needed, available } => {
                write!(f, "buffer too small: need {needed} bytes, have {available}")
            }
            Self::Overflow { dim } => write!(f, "box extent overflows in dimension {dim}"),
        }
    }
}

impl Error for DimsError {}

/// A data type name that does not map to any [`DataType`](crate::DataType).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownDataType(pub String);

impl fmt::Display for UnknownDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown data type '{}'", self.0)
    }
}

impl Error for UnknownDataType {}
