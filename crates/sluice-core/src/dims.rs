//! Axis-aligned n-dimensional boxes and the row-major copy kernel.
//!
//! Every array in the middleware is a dense row-major block addressed by
//! a [`BoxRegion`] in the coordinates of its variable's global shape.
//! Moving data between two blocks is always the same operation: find the
//! intersection, then copy it run by run along the fastest-varying
//! dimension with [`nd_copy`].

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::error::DimsError;

/// Per-dimension extents or coordinates. Inline for up to 4 dimensions.
pub type Dims = SmallVec<[usize; 4]>;

/// An axis-aligned box `[start, start + count)` in global index space.
///
/// A zero-dimensional box (both vectors empty) describes a single scalar
/// and has an element count of one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoxRegion {
    /// First index covered in each dimension.
    pub start: Dims,
    /// Number of indices covered in each dimension.
    pub count: Dims,
}

impl BoxRegion {
    /// Create a box, checking that `start` and `count` agree in length
    /// and that every end index and the element count are representable.
    pub fn new(start: &[usize], count: &[usize]) -> Result<Self, DimsError> {
        let region = Self {
            start: Dims::from_slice(start),
            count: Dims::from_slice(count),
        };
        region.check()?;
        Ok(region)
    }

    /// Validate a box built field by field, e.g. after deserialization.
    pub fn check(&self) -> Result<(), DimsError> {
        if self.start.len() != self.count.len() {
            return Err(DimsError::DimensionMismatch {
                expected: self.start.len(),
                got: self.count.len(),
            });
        }
        let mut elements = 1usize;
        for d in 0..self.ndim() {
            self.start[d]
                .checked_add(self.count[d])
                .ok_or(DimsError::Overflow { dim: d })?;
            elements = elements
                .checked_mul(self.count[d])
                .ok_or(DimsError::Overflow { dim: d })?;
        }
        Ok(())
    }

    /// The box covering a whole array of the given shape.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: smallvec![0; shape.len()],
            count: Dims::from_slice(shape),
        }
    }

    /// A zero-dimensional box holding one scalar.
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.count.len()
    }

    /// One past the last index covered in dimension `d`.
    ///
    /// Saturates at `usize::MAX`; [`BoxRegion::new`] rejects boxes where
    /// that would matter.
    pub fn end(&self, d: usize) -> usize {
        self.start[d].saturating_add(self.count[d])
    }

    /// Total number of elements covered.
    pub fn element_count(&self) -> usize {
        self.count.iter().product()
    }

    /// Whether the box covers no elements.
    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }

    /// The common sub-box of `self` and `other`, if any.
    ///
    /// Returns `None` when the boxes differ in dimensionality or are
    /// disjoint in at least one dimension. Intersection is commutative.
    pub fn intersect(&self, other: &BoxRegion) -> Option<BoxRegion> {
        if self.ndim() != other.ndim() {
            return None;
        }
        let mut start = Dims::with_capacity(self.ndim());
        let mut count = Dims::with_capacity(self.ndim());
        for d in 0..self.ndim() {
            let lo = self.start[d].max(other.start[d]);
            let hi = self.end(d).min(other.end(d));
            if lo >= hi {
                return None;
            }
            start.push(lo);
            count.push(hi - lo);
        }
        Some(BoxRegion { start, count })
    }

    /// Whether `inner` lies entirely within `self`.
    pub fn contains(&self, inner: &BoxRegion) -> bool {
        self.ndim() == inner.ndim()
            && (0..self.ndim())
                .all(|d| inner.start[d] >= self.start[d] && inner.end(d) <= self.end(d))
    }

    /// Whether the box fits inside an array of the given shape.
    pub fn fits_in(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len() && (0..self.ndim()).all(|d| self.end(d) <= shape[d])
    }

    /// Shift the box by `origin` in every dimension.
    ///
    /// Used to translate a box expressed relative to a block into global
    /// coordinates. Coordinates saturate at `usize::MAX`.
    pub fn translated(&self, origin: &[usize]) -> BoxRegion {
        BoxRegion {
            start: self
                .start
                .iter()
                .zip(origin)
                .map(|(s, o)| s.saturating_add(*o))
                .collect(),
            count: self.count.clone(),
        }
    }
}

/// Row-major strides (in elements) for an array of the given extents.
pub fn row_major_strides(count: &[usize]) -> Dims {
    let mut strides: Dims = smallvec![1; count.len()];
    for d in (0..count.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * count[d + 1];
    }
    strides
}

/// Copy the elements of `region` from a row-major buffer laid out as
/// `src_box` into a row-major buffer laid out as `dst_box`.
///
/// All three boxes are in the same (global) coordinate system and
/// `region` must be contained in both buffer boxes. Returns the number
/// of bytes copied.
pub fn nd_copy(
    src: &[u8],
    src_box: &BoxRegion,
    dst: &mut [u8],
    dst_box: &BoxRegion,
    region: &BoxRegion,
    elem_size: usize,
) -> Result<usize, DimsError> {
    let ndim = region.ndim();
    for other in [src_box.ndim(), dst_box.ndim()] {
        if other != ndim {
            return Err(DimsError::DimensionMismatch {
                expected: ndim,
                got: other,
            });
        }
    }
    if !src_box.contains(region) || !dst_box.contains(region) {
        return Err(DimsError::NotContained);
    }
    check_len(src.len(), src_box.element_count() * elem_size)?;
    check_len(dst.len(), dst_box.element_count() * elem_size)?;

    if region.is_empty() {
        return Ok(0);
    }
    if ndim == 0 {
        dst[..elem_size].copy_from_slice(&src[..elem_size]);
        return Ok(elem_size);
    }

    let src_strides = row_major_strides(&src_box.count);
    let dst_strides = row_major_strides(&dst_box.count);
    let last = ndim - 1;
    let run = region.count[last] * elem_size;
    let mut idx: Dims = smallvec![0; ndim];
    let mut copied = 0;

    loop {
        let mut s = 0;
        let mut d = 0;
        for k in 0..ndim {
            let g = region.start[k] + idx[k];
            s += (g - src_box.start[k]) * src_strides[k];
            d += (g - dst_box.start[k]) * dst_strides[k];
        }
        let (s, d) = (s * elem_size, d * elem_size);
        dst[d..d + run].copy_from_slice(&src[s..s + run]);
        copied += run;

        // Odometer over every dimension but the last.
        let mut k = last;
        loop {
            if k == 0 {
                return Ok(copied);
            }
            k -= 1;
            idx[k] += 1;
            if idx[k] < region.count[k] {
                break;
            }
            idx[k] = 0;
        }
    }
}

fn check_len(available: usize, needed: usize) -> Result<(), DimsError> {
    if available < needed {
        Err(DimsError::BufferTooSmall { needed, available })
    } else {
        Ok(())
    }
}
