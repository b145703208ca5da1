//! Benchmark profiles for the Sluice streaming middleware.
//!
//! Provides deterministic decompositions used by the benches and the
//! staging example:
//!
//! - [`tiled_writes`]: a 2-D global array split into a grid of writer tiles
//! - [`offset_reads`]: reader tiles shifted half a tile off the writer grid
//! - [`smooth_kernel`]: a normalised separable box stencil

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use sluice_core::{DataType, Dims, Rank};
use sluice_pattern::{ReadPattern, ReadRequest, ShapeKind, WriteBlock, WritePattern};
use sluice_select::Stencil;

/// Name of the benchmarked variable.
pub const FIELD: &str = "field";

/// Write pattern for a `grid × grid` layout of `tile × tile` writer
/// blocks of `f64`, one block per writer rank.
pub fn tiled_writes(grid: usize, tile: usize) -> WritePattern {
    let shape = [grid * tile, grid * tile];
    let raw = tile * tile * DataType::Float64.size();
    let ranks = (0..grid * grid)
        .map(|r| {
            let start = [(r / grid) * tile, (r % grid) * tile];
            vec![WriteBlock {
                name: FIELD.to_string(),
                data_type: DataType::Float64,
                shape_kind: ShapeKind::GlobalArray,
                shape: Dims::from_slice(&shape),
                start: Dims::from_slice(&start),
                count: Dims::from_slice(&[tile, tile]),
                rank: Rank(r),
                block_index: 0,
                buffer_start: 1,
                buffer_count: raw,
                operator: None,
            }]
        })
        .collect();
    WritePattern::from_ranks(ranks)
}

/// Read pattern for a `grid × grid` layout of reader tiles offset by
/// half a tile, so interior readers straddle four writers.
///
/// Tiles at the far edge are clipped to the global shape.
pub fn offset_reads(grid: usize, tile: usize) -> ReadPattern {
    let extent = grid * tile;
    let half = tile / 2;
    let ranks = (0..grid * grid)
        .map(|r| {
            let start = [(r / grid) * tile + half, (r % grid) * tile + half];
            let count = [
                tile.min(extent.saturating_sub(start[0])),
                tile.min(extent.saturating_sub(start[1])),
            ];
            vec![ReadRequest {
                name: FIELD.to_string(),
                data_type: DataType::Float64,
                start: Dims::from_slice(&start),
                count: Dims::from_slice(&count),
                rank: Rank(r),
                block_id: None,
            }]
        })
        .collect();
    ReadPattern::from_ranks(ranks)
}

/// `width × width` box stencil whose weights sum to one.
pub fn smooth_kernel(width: usize) -> Stencil {
    let n = width * width;
    Stencil::new(&[width, width], vec![1.0 / n as f64; n])
}
