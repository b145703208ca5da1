//! Matching write blocks against read requests.
//!
//! The relation is N-to-N: one block may feed many requests and one
//! request may draw on many blocks. Every pair with the same variable
//! name is classified by [`pair`]; the reader-side ([`writers_for`])
//! and writer-side ([`readers_for`]) views are both built from it, so
//! the two sides can never disagree about who talks to whom.

use sluice_core::{BoxRegion, DataType, Rank};
use sluice_select::Selection;
use std::collections::BTreeSet;

use crate::descriptor::{ReadPattern, ReadRequest, ShapeKind, WriteBlock, WritePattern};
use crate::error::PatternError;

/// Classification of one (block, request) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pairing {
    /// Different variables, empty block, other block id, or no common
    /// elements.
    Disjoint,
    /// Same variable and type; the common region in global coordinates.
    Overlap(BoxRegion),
    /// Same variable, different element type.
    TypeMismatch,
}

/// A write block contributing to a request, with the common region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockOverlap<'a> {
    /// The contributing block.
    pub block: &'a WriteBlock,
    /// Elements of the request the block supplies, in global coordinates.
    pub region: BoxRegion,
}

/// Classify one (block, request) pair.
///
/// Single values always overlap. A request restricted to a block id
/// matches only that block, whatever the global coordinates say.
pub fn pair(block: &WriteBlock, request: &ReadRequest) -> Pairing {
    if block.name != request.name {
        return Pairing::Disjoint;
    }
    if block.data_type != request.data_type {
        return Pairing::TypeMismatch;
    }
    if block.shape_kind == ShapeKind::GlobalValue {
        return Pairing::Overlap(BoxRegion::scalar());
    }
    if block.region().is_empty() {
        return Pairing::Disjoint;
    }
    if let Some(k) = request.block_id {
        if block.block_index != k {
            return Pairing::Disjoint;
        }
    }
    match block.region().intersect(&request.region()) {
        Some(region) => Pairing::Overlap(region),
        None => Pairing::Disjoint,
    }
}

/// Turn a reader's selection into a concrete request against the
/// current write pattern.
///
/// `All` expands to the variable's global shape (or to the whole block
/// for block selections); a bounding box under a block id is shifted
/// from block-local to global coordinates.
pub fn resolve_request(
    name: &str,
    data_type: DataType,
    selection: &Selection,
    pattern: &WritePattern,
    reader: Rank,
) -> Result<ReadRequest, PatternError> {
    let info = pattern
        .variable(name)
        .ok_or_else(|| PatternError::UnknownVariable {
            variable: name.to_string(),
        })?;
    if info.data_type != data_type {
        return Err(PatternError::TypeMismatch {
            variable: name.to_string(),
            written: info.data_type,
            requested: data_type,
            reader,
        });
    }
    let invalid = |source| PatternError::Selection {
        variable: name.to_string(),
        source,
    };

    let (region, block_id) = if info.shape_kind == ShapeKind::GlobalValue {
        (BoxRegion::scalar(), None)
    } else if let Some(k) = selection.block_id() {
        let block = pattern.block(name, k).ok_or_else(|| missing_block(name, k))?;
        let local = selection.resolve(&block.count).map_err(invalid)?;
        (local.translated(&block.start), Some(k))
    } else {
        (selection.resolve(&info.shape).map_err(invalid)?, None)
    };

    Ok(ReadRequest {
        name: name.to_string(),
        data_type,
        start: region.start,
        count: region.count,
        rank: reader,
        block_id,
    })
}

fn missing_block(name: &str, k: usize) -> PatternError {
    PatternError::LayoutConflict {
        variable: name.to_string(),
        reason: format!("block {k} was not written in this step"),
    }
}

/// Reader side: every block that supplies part of `request`.
///
/// A type mismatch is fatal for the request. So is a block id that the
/// current pattern does not contain.
pub fn writers_for<'a>(
    pattern: &'a WritePattern,
    request: &ReadRequest,
) -> Result<Vec<BlockOverlap<'a>>, PatternError> {
    if pattern.variable(&request.name).is_none() {
        return Err(PatternError::UnknownVariable {
            variable: request.name.clone(),
        });
    }
    if let Some(k) = request.block_id {
        if pattern.block(&request.name, k).is_none() {
            return Err(missing_block(&request.name, k));
        }
    }
    let mut found = Vec::new();
    for block in pattern.blocks_of(&request.name) {
        match pair(block, request) {
            Pairing::Overlap(region) => found.push(BlockOverlap { block, region }),
            Pairing::Disjoint => {}
            Pairing::TypeMismatch => {
                return Err(PatternError::TypeMismatch {
                    variable: request.name.clone(),
                    written: block.data_type,
                    requested: request.data_type,
                    reader: request.rank,
                })
            }
        }
    }
    Ok(found)
}

/// Writer side: reader ranks (ascending) that need at least one of
/// `blocks`. Mismatched types are skipped; the reader reports them.
pub fn readers_for(blocks: &[WriteBlock], reads: &ReadPattern) -> Vec<Rank> {
    reads
        .iter()
        .filter(|(_, requests)| needs_any(blocks, requests))
        .map(|(rank, _)| rank)
        .collect()
}

/// Writer ranks (ascending) holding data for any of `requests`,
/// skipping mismatched pairs.
pub(crate) fn writer_set(pattern: &WritePattern, requests: &[ReadRequest]) -> BTreeSet<Rank> {
    (0..pattern.writer_count())
        .map(Rank)
        .filter(|&w| needs_any(pattern.rank(w), requests))
        .collect()
}

fn needs_any(blocks: &[WriteBlock], requests: &[ReadRequest]) -> bool {
    requests.iter().any(|req| {
        blocks
            .iter()
            .any(|b| matches!(pair(b, req), Pairing::Overlap(_)))
    })
}
