//! The [`Selection`] value type.

use sluice_core::{BoxRegion, Dims};

use crate::error::SelectionError;

/// Spatial part of a selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpatialSelection {
    /// The entire array (or, combined with a block id, the entire block).
    All,
    /// An axis-aligned sub-box.
    BoundingBox(BoxRegion),
}

/// Tolerance hint for lossy-compression-aware engines.
///
/// The default (`error = 0`, `norm = 0`, `relative = false`) means exact.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Accuracy {
    /// Maximum tolerated error.
    pub error: f64,
    /// Norm the error is measured in (0 for L-infinity).
    pub norm: f64,
    /// Whether `error` is relative to the data range.
    pub relative: bool,
}

impl Accuracy {
    /// Whether this is the exact (default) accuracy.
    pub fn is_exact(&self) -> bool {
        self.error == 0.0
    }
}

/// A weighted convolution kernel centred on each strided sample.
#[derive(Clone, Debug, PartialEq)]
pub struct Stencil {
    /// Kernel extent per dimension; every entry must be odd.
    pub shape: Dims,
    /// Row-major kernel weights, `product(shape)` of them.
    pub weights: Vec<f64>,
}

impl Stencil {
    /// Create a stencil from a shape and row-major weights.
    pub fn new(shape: &[usize], weights: Vec<f64>) -> Self {
        Self {
            shape: Dims::from_slice(shape),
            weights,
        }
    }

    pub(crate) fn validate(&self, stride_ndim: usize) -> Result<(), SelectionError> {
        if self.shape.len() != stride_ndim {
            return Err(SelectionError::StencilStrideMismatch {
                stencil: self.shape.len(),
                stride: stride_ndim,
            });
        }
        for (dim, &extent) in self.shape.iter().enumerate() {
            if extent % 2 == 0 {
                return Err(SelectionError::StencilShapeEven { dim, extent });
            }
        }
        let expected: usize = self.shape.iter().product();
        if self.weights.len() != expected {
            return Err(SelectionError::WeightCountMismatch {
                expected,
                got: self.weights.len(),
            });
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(SelectionError::NonFiniteWeight);
        }
        Ok(())
    }
}

/// A spatial, temporal, and memory view of one array variable.
///
/// Block and bounding-box selection are orthogonal: with a block id set,
/// the bounding box (if any) is interpreted in that block's local index
/// space.
///
/// Mutators validate a candidate copy and commit only on success; the
/// `with_*` variants return a new selection and leave `self` untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    spatial: SpatialSelection,
    block_id: Option<usize>,
    step_start: u64,
    step_count: u64,
    memory: Option<BoxRegion>,
    accuracy: Accuracy,
    stride: Option<Dims>,
    stencil: Option<Stencil>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::all()
    }
}

impl Selection {
    // ── Factories ──────────────────────────────────────────────────

    /// Select the whole array at the current step.
    pub fn all() -> Self {
        Self {
            spatial: SpatialSelection::All,
            block_id: None,
            step_start: 0,
            step_count: 1,
            memory: None,
            accuracy: Accuracy::default(),
            stride: None,
            stencil: None,
        }
    }

    /// Select the box `[start, start + count)`.
    pub fn bounding_box(start: &[usize], count: &[usize]) -> Result<Self, SelectionError> {
        let mut sel = Self::all();
        sel.set_bounding_box(start, count)?;
        Ok(sel)
    }

    /// Select the writer block with global index `block_id`.
    pub fn block(block_id: usize) -> Self {
        Self {
            block_id: Some(block_id),
            ..Self::all()
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// The spatial part.
    pub fn spatial(&self) -> &SpatialSelection {
        &self.spatial
    }

    /// The bounding box, if one is set.
    pub fn bounding_box_region(&self) -> Option<&BoxRegion> {
        match &self.spatial {
            SpatialSelection::All => None,
            SpatialSelection::BoundingBox(b) => Some(b),
        }
    }

    /// Box start, or an empty slice for `All`.
    pub fn start(&self) -> &[usize] {
        self.bounding_box_region().map_or(&[][..], |b| b.start.as_slice())
    }

    /// Box count, or an empty slice for `All`.
    pub fn count(&self) -> &[usize] {
        self.bounding_box_region().map_or(&[][..], |b| b.count.as_slice())
    }

    /// Selected block, if any.
    pub fn block_id(&self) -> Option<usize> {
        self.block_id
    }

    /// First step of the step range.
    pub fn step_start(&self) -> u64 {
        self.step_start
    }

    /// Number of steps in the step range.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Destination memory layout, if it differs from the selection.
    pub fn memory(&self) -> Option<&BoxRegion> {
        self.memory.as_ref()
    }

    /// Accuracy hint.
    pub fn accuracy(&self) -> Accuracy {
        self.accuracy
    }

    /// Sampling stride, if any.
    pub fn stride(&self) -> Option<&[usize]> {
        self.stride.as_deref()
    }

    /// Resampling kernel, if any.
    pub fn stencil(&self) -> Option<&Stencil> {
        self.stencil.as_ref()
    }

    // ── In-place mutators ──────────────────────────────────────────

    /// Replace the spatial part with the box `[start, start + count)`.
    pub fn set_bounding_box(
        &mut self,
        start: &[usize],
        count: &[usize],
    ) -> Result<(), SelectionError> {
        if start.is_empty() || count.is_empty() {
            return Err(SelectionError::EmptyBounds);
        }
        let region = BoxRegion::new(start, count)?;
        self.try_update(|s| s.spatial = SpatialSelection::BoundingBox(region))
    }

    /// Restrict the selection to one writer block.
    pub fn set_block(&mut self, block_id: usize) -> Result<(), SelectionError> {
        self.try_update(|s| s.block_id = Some(block_id))
    }

    /// Remove the block restriction.
    pub fn clear_block(&mut self) {
        self.block_id = None;
    }

    /// Select `count` steps starting at `start`.
    pub fn set_steps(&mut self, start: u64, count: u64) -> Result<(), SelectionError> {
        self.try_update(|s| {
            s.step_start = start;
            s.step_count = count;
        })
    }

    /// Scatter the result into a destination buffer of extent `count`,
    /// placing it at `start`.
    pub fn set_memory(&mut self, start: &[usize], count: &[usize]) -> Result<(), SelectionError> {
        let region = BoxRegion::new(start, count)?;
        self.try_update(|s| s.memory = Some(region))
    }

    /// Remove the memory selection.
    pub fn clear_memory(&mut self) {
        self.memory = None;
    }

    /// Replace the accuracy hint.
    pub fn set_accuracy(&mut self, accuracy: Accuracy) -> Result<(), SelectionError> {
        self.try_update(|s| s.accuracy = accuracy)
    }

    /// Sample every `stride`-th element, optionally weighting each
    /// sample's neighbourhood with `stencil`.
    pub fn set_stride(
        &mut self,
        stride: &[usize],
        stencil: Option<Stencil>,
    ) -> Result<(), SelectionError> {
        self.try_update(|s| {
            s.stride = Some(Dims::from_slice(stride));
            s.stencil = stencil;
        })
    }

    /// Remove stride and stencil.
    pub fn clear_stride(&mut self) {
        self.stride = None;
        self.stencil = None;
    }

    /// Reset to the defaults of [`Selection::all`].
    pub fn clear(&mut self) {
        *self = Self::all();
    }

    // ── Value-returning variants ───────────────────────────────────

    /// Copy of `self` with a new bounding box.
    pub fn with_bounding_box(
        &self,
        start: &[usize],
        count: &[usize],
    ) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_bounding_box(start, count)?;
        Ok(next)
    }

    /// Copy of `self` restricted to one block.
    pub fn with_block(&self, block_id: usize) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_block(block_id)?;
        Ok(next)
    }

    /// Copy of `self` with a new step range.
    pub fn with_steps(&self, start: u64, count: u64) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_steps(start, count)?;
        Ok(next)
    }

    /// Copy of `self` with a memory selection.
    pub fn with_memory(&self, start: &[usize], count: &[usize]) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_memory(start, count)?;
        Ok(next)
    }

    /// Copy of `self` with a new accuracy hint.
    pub fn with_accuracy(&self, accuracy: Accuracy) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_accuracy(accuracy)?;
        Ok(next)
    }

    /// Copy of `self` with a stride and optional stencil.
    pub fn with_stride(
        &self,
        stride: &[usize],
        stencil: Option<Stencil>,
    ) -> Result<Self, SelectionError> {
        let mut next = self.clone();
        next.set_stride(stride, stencil)?;
        Ok(next)
    }

    // ── Geometry ───────────────────────────────────────────────────

    /// Resolve the spatial part against an array (or block) of extent
    /// `shape`, returning the selected box relative to that array.
    ///
    /// `All` expands to the full extent; a bounding box must fit inside.
    pub fn resolve(&self, shape: &[usize]) -> Result<BoxRegion, SelectionError> {
        match &self.spatial {
            SpatialSelection::All => Ok(BoxRegion::from_shape(shape)),
            SpatialSelection::BoundingBox(b) => {
                if b.ndim() != shape.len() {
                    return Err(SelectionError::DimensionMismatch {
                        what: "array shape",
                        expected: shape.len(),
                        got: b.ndim(),
                    });
                }
                if !b.fits_in(shape) {
                    return Err(SelectionError::OutOfBounds);
                }
                Ok(b.clone())
            }
        }
    }

    /// Extent of the data this selection produces for a resolved
    /// region of extent `count`: `ceil(count / stride)` when strided,
    /// `count` otherwise.
    pub fn output_count(&self, count: &[usize]) -> Dims {
        match &self.stride {
            Some(stride) => count
                .iter()
                .zip(stride.iter())
                .map(|(&c, &s)| c.div_ceil(s))
                .collect(),
            None => Dims::from_slice(count),
        }
    }

    // ── Validation ─────────────────────────────────────────────────

    fn try_update(&mut self, f: impl FnOnce(&mut Self)) -> Result<(), SelectionError> {
        let mut candidate = self.clone();
        f(&mut candidate);
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Check every invariant of the selection.
    pub fn validate(&self) -> Result<(), SelectionError> {
        let region = self.bounding_box_region();
        if let Some(b) = region {
            if b.ndim() == 0 {
                return Err(SelectionError::EmptyBounds);
            }
            if b.start.len() != b.count.len() {
                return Err(SelectionError::DimensionMismatch {
                    what: "bounding box",
                    expected: b.start.len(),
                    got: b.count.len(),
                });
            }
            b.check()?;
        }
        if self.step_count == 0 {
            return Err(SelectionError::InvalidStepCount);
        }
        if !(self.accuracy.error.is_finite()
            && self.accuracy.norm.is_finite()
            && self.accuracy.error >= 0.0
            && self.accuracy.norm >= 0.0)
        {
            return Err(SelectionError::InvalidAccuracy);
        }

        match &self.stride {
            Some(stride) => {
                if let Some(dim) = stride.iter().position(|&s| s == 0) {
                    return Err(SelectionError::ZeroStride { dim });
                }
                if let Some(b) = region {
                    if stride.len() != b.ndim() {
                        return Err(SelectionError::DimensionMismatch {
                            what: "stride",
                            expected: b.ndim(),
                            got: stride.len(),
                        });
                    }
                }
                if let Some(stencil) = &self.stencil {
                    stencil.validate(stride.len())?;
                }
            }
            None if self.stencil.is_some() => return Err(SelectionError::StencilWithoutStride),
            None => {}
        }

        if let Some(mem) = &self.memory {
            if mem.start.len() != mem.count.len() {
                return Err(SelectionError::DimensionMismatch {
                    what: "memory selection",
                    expected: mem.start.len(),
                    got: mem.count.len(),
                });
            }
            mem.check()?;
            if let Some(b) = region {
                if mem.ndim() != b.ndim() {
                    return Err(SelectionError::DimensionMismatch {
                        what: "memory selection",
                        expected: b.ndim(),
                        got: mem.ndim(),
                    });
                }
                let out = self.output_count(&b.count);
                for d in 0..out.len() {
                    let fits = mem.start[d]
                        .checked_add(out[d])
                        .is_some_and(|end| end <= mem.count[d]);
                    if !fits {
                        return Err(SelectionError::MemoryMismatch { dim: d });
                    }
                }
            }
        }
        Ok(())
    }
}
