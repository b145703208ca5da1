//! Reusable stream test fixtures.
//!
//! - [`row_decomposition`]: split a 2-d array into row slabs, one per rank.
//! - [`seeded_values`] and [`ramp`]: deterministic data.
//! - [`RleOperator`]: a byte run-length operator for operator tests.
//! - [`RejectingOperator`]: an operator whose every call fails.

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sluice_comm::{Operator, OperatorError, OperatorParams};

/// `(start, count)` of rank `rank`'s row slab of a `rows x cols` array
/// split across `ranks`. Leading ranks take the remainder rows.
pub fn row_decomposition(
    rows: usize,
    cols: usize,
    ranks: usize,
    rank: usize,
) -> ([usize; 2], [usize; 2]) {
    let base = rows / ranks;
    let extra = rows % ranks;
    let count = base + usize::from(rank < extra);
    let start = rank * base + rank.min(extra);
    ([start, 0], [count, cols])
}

/// `n` values in `[0, 1)` from a ChaCha8 stream seeded with `seed`.
pub fn seeded_values(seed: u64, n: usize) -> Vec<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|_| (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64)
        .collect()
}

/// Value of global element `index` (row-major flat index) at `step`.
pub fn ramp_value(step: u64, index: usize) -> f64 {
    step as f64 * 1000.0 + index as f64
}

/// Row-major values of the box `start`/`count` of a `shape` array at
/// `step`, per [`ramp_value`].
pub fn ramp(step: u64, shape: &[usize], start: &[usize], count: &[usize]) -> Vec<f64> {
    let n: usize = count.iter().product();
    let mut out = Vec::with_capacity(n);
    for local in 0..n {
        let mut rem = local;
        let mut flat = 0;
        let mut local_stride: usize = count.iter().product();
        let mut global_stride: usize = shape.iter().product();
        for d in 0..count.len() {
            local_stride /= count[d];
            global_stride /= shape[d];
            let i = rem / local_stride;
            rem %= local_stride;
            flat += (start[d] + i) * global_stride;
        }
        out.push(ramp_value(step, flat));
    }
    out
}

/// Run-length encodes bytes as `(run, byte)` pairs, runs capped at 255.
#[derive(Debug, Default)]
pub struct RleOperator;

impl Operator for RleOperator {
    fn name(&self) -> &str {
        "rle"
    }

    fn compress(
        &self,
        data: &[u8],
        _element_size: usize,
        _params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError> {
        let mut out = Vec::new();
        let mut iter = data.iter().copied().peekable();
        while let Some(b) = iter.next() {
            let mut run = 1u8;
            while run < u8::MAX && iter.peek() == Some(&b) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(b);
        }
        Ok(out)
    }

    fn decompress(
        &self,
        data: &[u8],
        raw_len: usize,
        _params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError> {
        if data.len() % 2 != 0 {
            return Err(OperatorError::Failed {
                name: "rle".into(),
                reason: "odd payload length".into(),
            });
        }
        let mut out = Vec::with_capacity(raw_len);
        for pair in data.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(usize::from(pair[0])));
        }
        if out.len() != raw_len {
            return Err(OperatorError::Failed {
                name: "rle".into(),
                reason: format!("decoded {} bytes, expected {raw_len}", out.len()),
            });
        }
        Ok(out)
    }
}

/// Fails every compress and decompress, for error-path tests.
#[derive(Debug, Default)]
pub struct RejectingOperator;

impl Operator for RejectingOperator {
    fn name(&self) -> &str {
        "reject"
    }

    fn compress(
        &self,
        _data: &[u8],
        _element_size: usize,
        _params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError> {
        Err(OperatorError::Failed {
            name: "reject".into(),
            reason: "refusing to compress".into(),
        })
    }

    fn decompress(
        &self,
        _data: &[u8],
        _raw_len: usize,
        _params: &OperatorParams,
    ) -> Result<Vec<u8>, OperatorError> {
        Err(OperatorError::Failed {
            name: "reject".into(),
            reason: "refusing to decompress".into(),
        })
    }
}
