//! Error type for selection construction, resampling, and decoding.

use sluice_core::{DimsError, Dims};
use std::error::Error;
use std::fmt;

/// A malformed selection or resampling request.
///
/// Always detected locally, before any communication, and never
/// partially applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectionError {
    /// Two vectors that must agree in dimensionality do not.
    DimensionMismatch {
        /// What the selection was checked against.
        what: &'static str,
        /// Expected dimensionality.
        expected: usize,
        /// Supplied dimensionality.
        got: usize,
    },
    /// A bounding box with zero dimensions.
    EmptyBounds,
    /// `step_count` of zero.
    InvalidStepCount,
    /// A stride entry of zero.
    ZeroStride {
        /// Offending dimension.
        dim: usize,
    },
    /// A stencil without a stride to place it.
    StencilWithoutStride,
    /// Stencil and stride disagree in dimensionality.
    StencilStrideMismatch {
        /// Stencil dimensionality.
        stencil: usize,
        /// Stride dimensionality.
        stride: usize,
    },
    /// A stencil extent that is even (no centre element).
    StencilShapeEven {
        /// Offending dimension.
        dim: usize,
        /// The even extent.
        extent: usize,
    },
    /// `weights.len()` differs from the product of the stencil shape.
    WeightCountMismatch {
        /// Product of the stencil shape.
        expected: usize,
        /// Number of weights supplied.
        got: usize,
    },
    /// A stencil weight that is NaN or infinite.
    NonFiniteWeight,
    /// A memory selection that cannot hold the selected data.
    MemoryMismatch {
        /// Offending dimension.
        dim: usize,
    },
    /// Accuracy error or norm that is negative or not finite.
    InvalidAccuracy,
    /// A box that extends past the array it addresses.
    OutOfBounds,
    /// A caller-supplied output shape disagrees with `ceil(count / stride)`.
    OutputShapeMismatch {
        /// Shape implied by the selection.
        expected: Dims,
        /// Shape the caller claimed.
        got: Dims,
    },
    /// A buffer that is too short or has a ragged length.
    BufferLength {
        /// Bytes required.
        needed: usize,
        /// Bytes supplied.
        available: usize,
    },
    /// An end index or element count that does not fit in `usize`.
    Overflow {
        /// Offending dimension.
        dim: usize,
    },
    /// Selection wire encoding could not be produced or parsed.
    Codec(String),
}

impl fmt::Display for SelectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DimensionMismatch {
                what,
                expected,
                got,
            } => write!(f, "{what}: expected {expected} dimensions, got {got}"),
            Self::EmptyBounds => write!(f, "bounding box has no dimensions"),
            Self::InvalidStepCount => write!(f, "step count must be at least 1"),
            Self::ZeroStride { dim } => write!(f, "stride is zero in dimension {dim}"),
            Self::StencilWithoutStride => write!(f, "stencil requires a stride"),
            Self::StencilStrideMismatch { stencil, stride } => write!(
                f,
                "stencil has {stencil} dimensions but stride has {stride}"
            ),
            Self::StencilShapeEven { dim, extent } => {
                write!(f, "stencil extent {extent} in dimension {dim} is not odd")
            }
            Self::WeightCountMismatch { expected, got } => {
                write!(f, "stencil expects {expected} weights, got {got}")
            }
            Self::NonFiniteWeight => write!(f, "stencil weight is not finite"),
            Self::MemoryMismatch { dim } => {
                write!(f, "memory selection too small in dimension {dim}")
            }
            Self::InvalidAccuracy => write!(f, "accuracy must be finite and non-negative"),
            Self::OutOfBounds => write!(f, "selection extends past the array bounds"),
            Self::OutputShapeMismatch { expected, got } => write!(
                f,
                "output shape {:?} disagrees with strided shape {:?}",
                got.as_slice(),
                expected.as_slice()
            ),
            Self::BufferLength { needed, available } => {
                write!(f, "buffer length {available} does not fit {needed} bytes")
            }
            Self::Overflow { dim } => {
                write!(f, "selection extent overflows in dimension {dim}")
            }
            Self::Codec(reason) => write!(f, "selection codec: {reason}"),
        }
    }
}

impl Error for SelectionError {}

impl From<DimsError> for SelectionError {
    fn from(e: DimsError) -> Self {
        match e {
            DimsError::DimensionMismatch { expected, got } => Self::DimensionMismatch {
                what: "box",
                expected,
                got,
            },
            DimsError::NotContained => Self::OutOfBounds,
            DimsError::BufferTooSmall { needed, available } => {
                Self::BufferLength { needed, available }
            }
            DimsError::Overflow { dim } => Self::Overflow { dim },
        }
    }
}
