//! Step buffers on both sides of a transfer.
//!
//! A writer stages its puts into one contiguous step buffer whose first
//! byte is a control byte; the blocks it produces record where each
//! block landed. A reader lays out one receive segment per writer it
//! needs, ordered by writer rank, fills them from parcels or window
//! fetches, and assembles each request's region out of the segments.

use sluice_comm::{CommError, Operator, OperatorError, OperatorRegistry};
use sluice_core::{nd_copy, BoxRegion, DataType, Rank};
use sluice_pattern::{
    receive_len, writers_for, OverlapAssignment, ReadRequest, WriteBlock, WritePattern,
};
use sluice_select::{Selection, SelectionError, StencilPlan};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{At, EngineError};

/// Control byte opening every data-carrying step buffer.
pub(crate) const STEP_DATA: u8 = 0;

// ── Writer staging ─────────────────────────────────────────────────

struct DeferredPut {
    block: WriteBlock,
    operator: Option<Arc<dyn Operator>>,
    encode: Box<dyn FnOnce() -> Vec<u8> + Send>,
}

/// One writer's step buffer under construction.
pub(crate) struct StagedStep {
    buffer: Vec<u8>,
    blocks: Vec<WriteBlock>,
    deferred: Vec<DeferredPut>,
}

impl StagedStep {
    pub fn new() -> Self {
        Self {
            buffer: vec![STEP_DATA],
            blocks: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Append `raw` as the payload of `block`, transformed by
    /// `operator` when the block names one.
    pub fn append(
        &mut self,
        mut block: WriteBlock,
        raw: &[u8],
        operator: Option<&dyn Operator>,
    ) -> Result<(), OperatorError> {
        let start = self.buffer.len();
        match (operator, &block.operator) {
            (Some(op), Some(spec)) => {
                let packed = op.compress(raw, block.data_type.size(), &spec.params)?;
                self.buffer.extend_from_slice(&packed);
            }
            _ => self.buffer.extend_from_slice(raw),
        }
        block.buffer_start = start;
        block.buffer_count = self.buffer.len() - start;
        self.blocks.push(block);
        Ok(())
    }

    /// Queue a put whose bytes are produced at the next flush.
    pub fn defer(
        &mut self,
        block: WriteBlock,
        operator: Option<Arc<dyn Operator>>,
        encode: Box<dyn FnOnce() -> Vec<u8> + Send>,
    ) {
        self.deferred.push(DeferredPut {
            block,
            operator,
            encode,
        });
    }

    /// Realise queued puts in the order they were issued. Returns how
    /// many were flushed.
    pub fn flush(&mut self) -> Result<usize, OperatorError> {
        let queued = std::mem::take(&mut self.deferred);
        let n = queued.len();
        for put in queued {
            let raw = (put.encode)();
            self.append(put.block, &raw, put.operator.as_deref())?;
        }
        Ok(n)
    }

    /// Freeze the buffer. Queued puts must have been flushed.
    pub fn finish(self) -> (Arc<[u8]>, Vec<WriteBlock>) {
        debug_assert!(self.deferred.is_empty(), "finish with unflushed puts");
        (Arc::from(self.buffer), self.blocks)
    }
}

// ── Reader receive buffer ──────────────────────────────────────────

/// A reader's receive buffer: one segment per assigned writer.
#[derive(Debug, Default)]
pub(crate) struct ReceiveBuffer {
    assignments: Vec<OverlapAssignment>,
    bytes: Vec<u8>,
    present: BTreeSet<Rank>,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to a new set of assignments, keeping every segment that
    /// was already filled and is still assigned with the same length.
    pub fn relayout(&mut self, assignments: Vec<OverlapAssignment>) {
        let mut bytes = vec![0u8; receive_len(&assignments)];
        let mut present = BTreeSet::new();
        for a in &assignments {
            if let Some(old) = self.filled(a.peer) {
                if old.len() == a.byte_length {
                    bytes[a.buffer_offset..a.end()].copy_from_slice(old);
                    present.insert(a.peer);
                }
            }
        }
        self.assignments = assignments;
        self.bytes = bytes;
        self.present = present;
    }

    /// Assigned segments not filled yet, ascending writer rank.
    pub fn missing(&self) -> Vec<OverlapAssignment> {
        self.assignments
            .iter()
            .filter(|a| !self.present.contains(&a.peer))
            .copied()
            .collect()
    }

    /// Fill `writer`'s segment with its step buffer.
    pub fn place(&mut self, writer: Rank, payload: &[u8]) -> Result<(), CommError> {
        let a = self
            .assignments
            .iter()
            .find(|a| a.peer == writer)
            .copied()
            .ok_or_else(|| {
                CommError::ProtocolViolation(format!("no receive segment for writer {writer}"))
            })?;
        if payload.len() != a.byte_length {
            return Err(CommError::ProtocolViolation(format!(
                "writer {writer} sent {} bytes, expected {}",
                payload.len(),
                a.byte_length
            )));
        }
        if payload.first() != Some(&STEP_DATA) {
            return Err(CommError::ProtocolViolation(format!(
                "writer {writer} buffer has control byte {:?}",
                payload.first()
            )));
        }
        self.bytes[a.buffer_offset..a.end()].copy_from_slice(payload);
        self.present.insert(writer);
        Ok(())
    }

    /// `writer`'s segment, if filled.
    pub fn filled(&self, writer: Rank) -> Option<&[u8]> {
        if !self.present.contains(&writer) {
            return None;
        }
        self.assignments
            .iter()
            .find(|a| a.peer == writer)
            .map(|a| &self.bytes[a.buffer_offset..a.end()])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

// ── Assembly ───────────────────────────────────────────────────────

/// Copy every overlap of `request` out of the receive buffer into a
/// row-major buffer laid out as the request's region.
pub(crate) fn assemble(
    at: At,
    writes: &WritePattern,
    request: &ReadRequest,
    receive: &ReceiveBuffer,
    operators: &OperatorRegistry,
) -> Result<Vec<u8>, EngineError> {
    let violation = |reason: String| at.comm(CommError::ProtocolViolation(reason));
    let esize = request.data_type.size();
    let target = request.region();
    let mut out = vec![0u8; target.element_count() * esize];

    for overlap in writers_for(writes, request).map_err(|e| at.protocol(e))? {
        let block = overlap.block;
        let segment = receive
            .filled(block.rank)
            .ok_or_else(|| violation(format!("writer {} segment not received", block.rank)))?;
        let stored = segment
            .get(block.buffer_start..block.buffer_start + block.buffer_count)
            .ok_or_else(|| {
                violation(format!(
                    "block {} of '{}' lies outside writer {}'s buffer",
                    block.block_index, block.name, block.rank
                ))
            })?;
        let unpacked;
        let source = match &block.operator {
            Some(spec) => {
                let op = operators.get(&spec.name)?;
                unpacked = op.decompress(stored, block.raw_len(), &spec.params)?;
                if unpacked.len() != block.raw_len() {
                    return Err(EngineError::Operator(OperatorError::Failed {
                        name: spec.name.clone(),
                        reason: format!(
                            "produced {} bytes, expected {}",
                            unpacked.len(),
                            block.raw_len()
                        ),
                    }));
                }
                &unpacked[..]
            }
            None => stored,
        };
        if !block.data_type.is_fixed_size() {
            // Variable-length values are whole payloads; the last writer wins.
            out = source.to_vec();
            continue;
        }
        nd_copy(
            source,
            &block.region(),
            &mut out,
            &target,
            &overlap.region,
            esize,
        )
        .map_err(|e| violation(format!("copying '{}': {e}", block.name)))?;
    }
    Ok(out)
}

/// Apply a selection's stride, stencil, and memory layout to data
/// assembled for `region`.
///
/// With a memory selection the result spans the whole memory box:
/// `base` (or zeros) outside the placed region. Without one, `base`
/// must have the length of the output and is replaced.
pub(crate) fn shape_output(
    selection: &Selection,
    dtype: DataType,
    region: &BoxRegion,
    data: Vec<u8>,
    base: Option<Vec<u8>>,
) -> Result<Vec<u8>, SelectionError> {
    let esize = dtype.size();
    let (data, count) = match StencilPlan::for_selection(selection, region)? {
        Some(plan) => {
            let out = plan.apply(dtype, &data, region)?;
            (out, plan.output_shape().iter().copied().collect())
        }
        None => (data, region.count.clone()),
    };

    let Some(memory) = selection.memory() else {
        if let Some(base) = base {
            if base.len() != data.len() {
                return Err(SelectionError::BufferLength {
                    needed: data.len(),
                    available: base.len(),
                });
            }
        }
        return Ok(data);
    };

    if memory.ndim() != count.len() {
        return Err(SelectionError::DimensionMismatch {
            what: "memory selection",
            expected: count.len(),
            got: memory.ndim(),
        });
    }
    let spills = |d: usize| {
        !memory.start[d]
            .checked_add(count[d])
            .is_some_and(|end| end <= memory.count[d])
    };
    if let Some(dim) = (0..count.len()).find(|&d| spills(d)) {
        return Err(SelectionError::MemoryMismatch { dim });
    }
    let layout = BoxRegion::from_shape(&memory.count);
    let needed = layout.element_count() * esize;
    let mut dest = match base {
        Some(base) if base.len() != needed => {
            return Err(SelectionError::BufferLength {
                needed,
                available: base.len(),
            })
        }
        Some(base) => base,
        None => vec![0u8; needed],
    };
    let placed = BoxRegion {
        start: memory.start.clone(),
        count,
    };
    nd_copy(&data, &placed, &mut dest, &layout, &placed, esize)?;
    Ok(dest)
}
