//! Strided and stencil-weighted downsampling.
//!
//! A [`StencilPlan`] is compiled once per (region, stride, stencil) and
//! then evaluated against row-major source data. Output element `i`
//! (in strided output space) is the weighted sum of the neighbourhood
//! centred on source position `region.start + i * stride`.
//!
//! Neighbours outside the selected region never touch source memory.
//! When some of them fall outside, the in-range sum is rescaled by
//! `total_weight / in_range_weight`, so a normalised kernel applied to
//! constant data returns that constant everywhere, edges included.
//!
//! Evaluation is pure. [`StencilPlan::apply_range`] fills an arbitrary
//! contiguous slice of the output, so disjoint ranges may be computed
//! on different threads against the same plan.

use smallvec::{smallvec, SmallVec};
use sluice_core::{row_major_strides, BoxRegion, DataType, Dims};

use crate::error::SelectionError;
use crate::selection::{Selection, Stencil};

type Offset = SmallVec<[isize; 4]>;

#[derive(Clone, Debug)]
struct Tap {
    offset: Offset,
    weight: f64,
}

/// A compiled downsampling kernel for one region.
#[derive(Clone, Debug)]
pub struct StencilPlan {
    region: BoxRegion,
    stride: Dims,
    output: Dims,
    output_strides: Dims,
    taps: Vec<Tap>,
    total_weight: f64,
}

impl StencilPlan {
    /// Compile a plan sampling `region` every `stride` elements.
    ///
    /// `stencil = None` selects plain decimation (a 1×…×1 unit kernel).
    /// When `expected_output` is given it must equal
    /// `ceil(region.count / stride)`.
    pub fn new(
        region: &BoxRegion,
        stride: &[usize],
        stencil: Option<&Stencil>,
        expected_output: Option<&[usize]>,
    ) -> Result<Self, SelectionError> {
        let ndim = region.ndim();
        if stride.len() != ndim {
            return Err(SelectionError::DimensionMismatch {
                what: "stride",
                expected: ndim,
                got: stride.len(),
            });
        }
        if let Some(dim) = stride.iter().position(|&s| s == 0) {
            return Err(SelectionError::ZeroStride { dim });
        }
        let unit;
        let stencil = match stencil {
            Some(k) => {
                k.validate(ndim)?;
                k
            }
            None => {
                unit = Stencil::new(&vec![1; ndim], vec![1.0]);
                &unit
            }
        };

        let output: Dims = region
            .count
            .iter()
            .zip(stride)
            .map(|(&c, &s)| c.div_ceil(s))
            .collect();
        if let Some(expected) = expected_output {
            if expected != output.as_slice() {
                return Err(SelectionError::OutputShapeMismatch {
                    expected: output,
                    got: Dims::from_slice(expected),
                });
            }
        }

        let kernel_strides = row_major_strides(&stencil.shape);
        let taps: Vec<Tap> = stencil
            .weights
            .iter()
            .enumerate()
            .map(|(flat, &weight)| {
                let offset = (0..ndim)
                    .map(|d| {
                        let idx = (flat / kernel_strides[d]) % stencil.shape[d];
                        idx as isize - (stencil.shape[d] / 2) as isize
                    })
                    .collect();
                Tap { offset, weight }
            })
            .collect();
        let total_weight = taps.iter().map(|t| t.weight).sum();

        Ok(Self {
            region: region.clone(),
            stride: Dims::from_slice(stride),
            output_strides: row_major_strides(&output),
            output,
            taps,
            total_weight,
        })
    }

    /// Compile the plan a strided selection implies for `region`.
    ///
    /// Returns `Ok(None)` when the selection has no stride.
    pub fn for_selection(
        selection: &Selection,
        region: &BoxRegion,
    ) -> Result<Option<Self>, SelectionError> {
        match selection.stride() {
            Some(stride) => Self::new(region, stride, selection.stencil(), None).map(Some),
            None => Ok(None),
        }
    }

    /// Extent of the downsampled output.
    pub fn output_shape(&self) -> &[usize] {
        &self.output
    }

    /// Number of output elements.
    pub fn output_len(&self) -> usize {
        self.output.iter().product()
    }

    /// Downsample the whole region.
    ///
    /// `source` is row-major data of element type `dtype` laid out as
    /// `source_box`, which must contain the plan's region.
    pub fn apply(
        &self,
        dtype: DataType,
        source: &[u8],
        source_box: &BoxRegion,
    ) -> Result<Vec<u8>, SelectionError> {
        let mut out = vec![0u8; self.output_len() * dtype.size()];
        self.apply_range(dtype, source, source_box, 0, &mut out)?;
        Ok(out)
    }

    /// Compute output elements `first..first + out.len() / dtype.size()`
    /// into `out`.
    pub fn apply_range(
        &self,
        dtype: DataType,
        source: &[u8],
        source_box: &BoxRegion,
        first: usize,
        out: &mut [u8],
    ) -> Result<(), SelectionError> {
        let esize = dtype.size();
        if !source_box.contains(&self.region) {
            return Err(SelectionError::OutOfBounds);
        }
        let needed = source_box.element_count() * esize;
        if source.len() < needed {
            return Err(SelectionError::BufferLength {
                needed,
                available: source.len(),
            });
        }
        let n_out = out.len() / esize;
        if out.len() % esize != 0 || first + n_out > self.output_len() {
            return Err(SelectionError::BufferLength {
                needed: (self.output_len() - first.min(self.output_len())) * esize,
                available: out.len(),
            });
        }

        let ndim = self.region.ndim();
        let src_strides = row_major_strides(&source_box.count);
        let mut centre: Dims = smallvec![0; ndim];

        for k in 0..n_out {
            let mut rem = first + k;
            for d in 0..ndim {
                let i = rem / self.output_strides[d];
                rem %= self.output_strides[d];
                centre[d] = self.region.start[d] + i * self.stride[d];
            }

            let mut acc = 0.0;
            let mut in_range = 0.0;
            'taps: for tap in &self.taps {
                let mut flat = 0;
                for d in 0..ndim {
                    let p = centre[d] as isize + tap.offset[d];
                    if p < self.region.start[d] as isize || p >= self.region.end(d) as isize {
                        continue 'taps;
                    }
                    flat += (p as usize - source_box.start[d]) * src_strides[d];
                }
                acc += tap.weight * dtype.load_f64(source, flat);
                in_range += tap.weight;
            }

            let value = if in_range == self.total_weight {
                acc
            } else if in_range == 0.0 {
                0.0
            } else {
                acc * self.total_weight / in_range
            };
            dtype.store_f64(out, k, value);
        }
        Ok(())
    }
}
