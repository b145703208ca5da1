//! Layout signatures for change detection.
//!
//! Uses FNV-1a over every field that affects matching or positioning.
//! A rank whose signature is unchanged from the previous step can keep
//! its layout locked; any difference means the pooled pattern must be
//! exchanged again. Not cryptographically secure.

use sluice_core::DataType;

use crate::descriptor::{ReadRequest, ShapeKind, WriteBlock};

/// FNV-1a offset basis for 64-bit.
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
/// FNV-1a prime for 64-bit.
const FNV_PRIME: u64 = 0x00000100000001B3;

#[inline]
fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash = (hash ^ b as u64).wrapping_mul(FNV_PRIME);
    }
    hash
}

#[inline]
fn fnv1a_u64(hash: u64, v: u64) -> u64 {
    fnv1a_bytes(hash, &v.to_le_bytes())
}

fn fnv1a_dims(mut hash: u64, dims: &[usize]) -> u64 {
    hash = fnv1a_u64(hash, dims.len() as u64);
    for &d in dims {
        hash = fnv1a_u64(hash, d as u64);
    }
    hash
}

fn fnv1a_str(hash: u64, s: &str) -> u64 {
    fnv1a_bytes(fnv1a_u64(hash, s.len() as u64), s.as_bytes())
}

fn fnv1a_type(hash: u64, dt: DataType) -> u64 {
    fnv1a_str(hash, dt.name())
}

/// Signature of one rank's write blocks, in write order.
///
/// Covers name, type, shape kind, shape, start, count, and buffer
/// placement, so a change in compressed payload size also unlocks.
pub fn write_signature(blocks: &[WriteBlock]) -> u64 {
    let mut hash = fnv1a_u64(FNV_OFFSET, blocks.len() as u64);
    for b in blocks {
        hash = fnv1a_str(hash, &b.name);
        hash = fnv1a_type(hash, b.data_type);
        hash = fnv1a_u64(hash, matches!(b.shape_kind, ShapeKind::GlobalValue) as u64);
        hash = fnv1a_dims(hash, &b.shape);
        hash = fnv1a_dims(hash, &b.start);
        hash = fnv1a_dims(hash, &b.count);
        hash = fnv1a_u64(hash, b.buffer_start as u64);
        hash = fnv1a_u64(hash, b.buffer_count as u64);
    }
    hash
}

/// Signature of one rank's read requests, in request order.
pub fn read_signature(requests: &[ReadRequest]) -> u64 {
    let mut hash = fnv1a_u64(FNV_OFFSET, requests.len() as u64);
    for r in requests {
        hash = fnv1a_str(hash, &r.name);
        hash = fnv1a_type(hash, r.data_type);
        hash = fnv1a_dims(hash, &r.start);
        hash = fnv1a_dims(hash, &r.count);
        hash = fnv1a_u64(hash, r.block_id.map_or(u64::MAX, |k| k as u64));
    }
    hash
}
