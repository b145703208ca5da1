//! The writer side of a stream.
//!
//! # Step protocol
//!
//! `end_step` on every writer rank:
//!
//! 1. flushes deferred puts and freezes the step buffer;
//! 2. exposes the buffer as a one-sided window for this step;
//! 3. agrees with the group whether the step may take the fast path
//!    (every writer locked and unchanged, readers locked, push
//!    destinations known);
//! 4. fast path: pushes the buffer to each assigned reader as a parcel;
//!    otherwise: gathers every rank's blocks into the write pattern;
//! 5. rank 0 announces the step (with the pattern unless fast);
//! 6. starts the finalize, which waits for the readers' notice,
//!    learns the new push destinations, and retires the window.
//!
//! The finalize runs inline unless threading is enabled, in which case
//! the next `begin_step` or `close` joins it.

use indexmap::IndexMap;
use sluice_comm::{
    Announcement, Collective, CommError, Operator, OperatorRegistry, Parcel, StreamTransport,
    TransferWindow,
};
use sluice_core::{encode_slice, BoxRegion, DataType, Dims, Element, Rank, StepId};
use sluice_pattern::{
    codec, write_signature, AttributeValue, Attributes, OperatorSpec, OverlapAssignment,
    PatternError, ShapeKind, WriteBlock, WritePattern, WriterMetadata,
};
use sluice_select::SelectionError;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{ConfigError, StreamConfig};
use crate::coordinator::StagedStep;
use crate::error::{At, EngineError};
use crate::finalize::{FinalizeContext, FinalizeTask};
use crate::metrics::StepMetrics;
use crate::state::{StepState, StepStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
struct VariableDef {
    data_type: DataType,
    shape_kind: ShapeKind,
    shape: Dims,
    operator: Option<OperatorSpec>,
}

/// One writer rank of a stream.
pub struct StreamWriter {
    config: StreamConfig,
    group: Arc<dyn Collective>,
    transport: Arc<dyn StreamTransport>,
    operators: OperatorRegistry,
    variables: IndexMap<String, VariableDef>,
    attributes: Attributes,
    attributes_dirty: bool,
    state: StepState,
    step: Option<StepId>,
    published: Option<StepId>,
    step_started: Option<Instant>,
    staged: Option<StagedStep>,

    // Layout tracking.
    lock_requested: bool,
    last_blocks: Vec<WriteBlock>,
    signature: Option<u64>,
    writes: Option<Arc<WritePattern>>,
    assignments: Option<Vec<OverlapAssignment>>,
    readers_locked: bool,
    readers_departed: bool,

    finalize: Option<FinalizeTask>,
    pending_conflict: Option<PatternError>,
}

impl StreamWriter {
    /// Join the writer group of a stream.
    ///
    /// `group` spans the writer ranks; `transport` connects them to the
    /// reader group and must be sized for the same number of writers.
    pub fn open(
        config: StreamConfig,
        group: Arc<dyn Collective>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if group.size() != transport.writer_count() {
            return Err(ConfigError::GroupSizeMismatch {
                group: group.size(),
                transport: transport.writer_count(),
            }
            .into());
        }
        tracing::info!(
            stream = %config.name,
            rank = %group.rank(),
            writers = group.size(),
            readers = transport.reader_count(),
            kind = ?config.kind,
            threading = config.threading,
            "writer opened"
        );
        Ok(Self {
            config,
            group,
            transport,
            operators: OperatorRegistry::new(),
            variables: IndexMap::new(),
            attributes: Attributes::new(),
            attributes_dirty: false,
            state: StepState::NotStarted,
            step: None,
            published: None,
            step_started: None,
            staged: None,
            lock_requested: false,
            last_blocks: Vec::new(),
            signature: None,
            writes: None,
            assignments: None,
            readers_locked: false,
            readers_departed: false,
            finalize: None,
            pending_conflict: None,
        })
    }

    /// Use `operators` to resolve operator names.
    pub fn with_operators(mut self, operators: OperatorRegistry) -> Self {
        self.operators = operators;
        self
    }

    /// This writer's rank.
    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    /// Stream configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Most recently begun step.
    pub fn current_step(&self) -> Option<StepId> {
        self.step
    }

    fn at(&self) -> At {
        At {
            step: self.step.unwrap_or_default(),
            rank: self.rank(),
        }
    }

    fn require(&self, op: &'static str, allowed: &[StepState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Define (or reshape) a global array variable.
    ///
    /// Redefining with a new shape is allowed and changes the step's
    /// layout; changing the element type is not.
    pub fn define_variable(
        &mut self,
        name: &str,
        data_type: DataType,
        shape: &[usize],
    ) -> Result<(), EngineError> {
        self.define(
            name,
            VariableDef {
                data_type,
                shape_kind: ShapeKind::GlobalArray,
                shape: Dims::from_slice(shape),
                operator: None,
            },
        )
    }

    /// Define a single-value variable.
    pub fn define_value(&mut self, name: &str, data_type: DataType) -> Result<(), EngineError> {
        self.define(
            name,
            VariableDef {
                data_type,
                shape_kind: ShapeKind::GlobalValue,
                shape: Dims::new(),
                operator: None,
            },
        )
    }

    fn define(&mut self, name: &str, def: VariableDef) -> Result<(), EngineError> {
        self.require("define", &[StepState::NotStarted, StepState::InStep])?;
        if !def.data_type.is_fixed_size() && def.shape_kind == ShapeKind::GlobalArray {
            return Err(EngineError::Unsupported {
                what: format!("array of {} elements for '{name}'", def.data_type),
            });
        }
        match self.variables.get_mut(name) {
            Some(existing) if existing.data_type != def.data_type => {
                Err(EngineError::DefinitionMismatch {
                    name: name.to_string(),
                    defined: existing.data_type,
                    got: def.data_type,
                })
            }
            Some(existing) if existing.shape_kind != def.shape_kind => {
                Err(EngineError::Unsupported {
                    what: format!("changing '{name}' between array and value"),
                })
            }
            Some(existing) => {
                existing.shape = def.shape;
                Ok(())
            }
            None => {
                self.variables.insert(name.to_string(), def);
                Ok(())
            }
        }
    }

    /// Transform `name`'s blocks with a registered operator from the
    /// next put on.
    pub fn set_operator(&mut self, name: &str, spec: OperatorSpec) -> Result<(), EngineError> {
        self.require("set_operator", &[StepState::NotStarted, StepState::InStep])?;
        self.operators.get(&spec.name)?;
        let def = self
            .variables
            .get_mut(name)
            .ok_or_else(|| EngineError::UnknownVariable {
                name: name.to_string(),
            })?;
        if !def.data_type.is_fixed_size() {
            return Err(EngineError::Unsupported {
                what: format!("operator '{}' on {} variable '{name}'", spec.name, def.data_type),
            });
        }
        def.operator = Some(spec);
        Ok(())
    }

    /// Define (or redefine) a stream attribute.
    ///
    /// Attributes reach the readers with the next full exchange; a
    /// step after a new or changed attribute never takes the fast
    /// path, but this is not a layout conflict.
    pub fn define_attribute(
        &mut self,
        name: &str,
        value: impl Into<AttributeValue>,
    ) -> Result<(), EngineError> {
        self.require("define_attribute", &[StepState::NotStarted, StepState::InStep])?;
        let value = value.into();
        if self.attributes.get(name) != Some(&value) {
            tracing::debug!(
                stream = %self.config.name,
                attribute = name,
                %value,
                "attribute defined"
            );
            self.attributes.insert(name.to_string(), value);
            self.attributes_dirty = true;
        }
        Ok(())
    }

    /// Attributes defined on this writer.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Promise that the write layout stays fixed from now on.
    ///
    /// Once readers lock too, steps push data directly. Breaking the
    /// promise is a layout conflict: the step still completes through
    /// a full exchange, the lock is dropped, and the conflict is
    /// reported by `close` if no later step repaired it.
    pub fn lock_layout(&mut self) {
        self.lock_requested = true;
    }

    /// Whether the layout is currently locked.
    pub fn is_locked(&self) -> bool {
        self.lock_requested
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Open the next step.
    ///
    /// Joins the previous step's finalize first, so the push
    /// destinations are current.
    pub fn begin_step(&mut self) -> Result<StepStatus, EngineError> {
        self.require("begin_step", &[StepState::NotStarted])?;
        self.join_finalize()?;
        let step = self.step.map_or(StepId(0), StepId::next);
        self.step = Some(step);
        self.step_started = Some(Instant::now());
        self.staged = Some(StagedStep::new());
        self.pending_conflict = None;
        self.state = StepState::InStep;
        tracing::trace!(
            stream = %self.config.name,
            rank = %self.rank(),
            %step,
            "writer begin step"
        );
        Ok(StepStatus::Ok)
    }

    fn join_finalize(&mut self) -> Result<(), EngineError> {
        let Some(task) = self.finalize.take() else {
            return Ok(());
        };
        let outcome = task.join()?;
        self.readers_departed |= outcome.readers_departed;
        self.readers_locked = outcome.readers_locked && !self.readers_departed;
        if let Some(assignments) = outcome.assignments {
            self.assignments = Some(assignments);
        }
        Ok(())
    }

    fn staged_mut(&mut self, op: &'static str) -> Result<&mut StagedStep, EngineError> {
        let state = self.state;
        self.staged
            .as_mut()
            .ok_or(EngineError::InvalidState { op, state })
    }

    fn prepare_put<T: Element>(
        &self,
        name: &str,
        start: &[usize],
        count: &[usize],
        len: usize,
    ) -> Result<WriteBlock, EngineError> {
        self.require("put", &[StepState::InStep])?;
        let def = self
            .variables
            .get(name)
            .ok_or_else(|| EngineError::UnknownVariable {
                name: name.to_string(),
            })?;
        if T::DATA_TYPE != def.data_type {
            return Err(EngineError::DefinitionMismatch {
                name: name.to_string(),
                defined: def.data_type,
                got: T::DATA_TYPE,
            });
        }
        let region = match def.shape_kind {
            ShapeKind::GlobalValue => {
                if !start.is_empty() || !count.is_empty() {
                    return Err(SelectionError::DimensionMismatch {
                        what: "value block",
                        expected: 0,
                        got: start.len().max(count.len()),
                    }
                    .into());
                }
                BoxRegion::scalar()
            }
            ShapeKind::GlobalArray => {
                let region = BoxRegion::new(start, count).map_err(SelectionError::from)?;
                if region.ndim() != def.shape.len() {
                    return Err(SelectionError::DimensionMismatch {
                        what: "block",
                        expected: def.shape.len(),
                        got: region.ndim(),
                    }
                    .into());
                }
                if !region.fits_in(&def.shape) {
                    return Err(SelectionError::OutOfBounds.into());
                }
                region
            }
        };
        if region.element_count() != len {
            return Err(EngineError::SizeMismatch {
                name: name.to_string(),
                expected: region.element_count(),
                got: len,
            });
        }
        Ok(WriteBlock {
            name: name.to_string(),
            data_type: def.data_type,
            shape_kind: def.shape_kind,
            shape: def.shape.clone(),
            start: region.start,
            count: region.count,
            rank: self.rank(),
            block_index: 0,
            buffer_start: 0,
            buffer_count: 0,
            operator: def.operator.clone(),
        })
    }

    fn operator_for(&self, block: &WriteBlock) -> Result<Option<Arc<dyn Operator>>, EngineError> {
        match &block.operator {
            Some(spec) => Ok(Some(self.operators.get(&spec.name)?)),
            None => Ok(None),
        }
    }

    /// Copy `data` into the step buffer now, as the block
    /// `start`/`count` of `name`.
    pub fn put_sync<T: Element>(
        &mut self,
        name: &str,
        start: &[usize],
        count: &[usize],
        data: &[T],
    ) -> Result<(), EngineError> {
        let block = self.prepare_put::<T>(name, start, count, data.len())?;
        let operator = self.operator_for(&block)?;
        let raw = encode_slice(data);
        self.staged_mut("put_sync")?
            .append(block, &raw, operator.as_deref())?;
        Ok(())
    }

    /// Write a single-value variable.
    pub fn put_value<T: Element>(&mut self, name: &str, value: T) -> Result<(), EngineError> {
        self.put_sync(name, &[], &[], &[value])
    }

    /// Write a string variable. The block's payload is the UTF-8 text,
    /// so a change in length changes the step's layout.
    pub fn put_string(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.require("put", &[StepState::InStep])?;
        let def = self
            .variables
            .get(name)
            .ok_or_else(|| EngineError::UnknownVariable {
                name: name.to_string(),
            })?;
        if def.data_type != DataType::String {
            return Err(EngineError::DefinitionMismatch {
                name: name.to_string(),
                defined: def.data_type,
                got: DataType::String,
            });
        }
        let block = WriteBlock {
            name: name.to_string(),
            data_type: DataType::String,
            shape_kind: ShapeKind::GlobalValue,
            shape: Dims::new(),
            start: Dims::new(),
            count: Dims::new(),
            rank: self.rank(),
            block_index: 0,
            buffer_start: 0,
            buffer_count: 0,
            operator: None,
        };
        self.staged_mut("put_string")?
            .append(block, value.as_bytes(), None)?;
        Ok(())
    }

    /// Take ownership of `data` and copy it into the step buffer at the
    /// next [`perform_puts`](Self::perform_puts) or `end_step`.
    ///
    /// The region is validated now. Deferred puts land in the buffer in
    /// the order they were issued.
    pub fn put_deferred<T: Element>(
        &mut self,
        name: &str,
        start: &[usize],
        count: &[usize],
        data: Vec<T>,
    ) -> Result<(), EngineError> {
        let block = self.prepare_put::<T>(name, start, count, data.len())?;
        let operator = self.operator_for(&block)?;
        self.staged_mut("put_deferred")?
            .defer(block, operator, Box::new(move || encode_slice(&data)));
        Ok(())
    }

    /// Realise every deferred put.
    pub fn perform_puts(&mut self) -> Result<(), EngineError> {
        self.require("perform_puts", &[StepState::InStep])?;
        let flushed = self.staged_mut("perform_puts")?.flush()?;
        if flushed > 0 {
            tracing::trace!(rank = %self.rank(), flushed, "deferred puts performed");
        }
        Ok(())
    }

    /// Publish the step.
    pub fn end_step(&mut self) -> Result<StepMetrics, EngineError> {
        self.require("end_step", &[StepState::InStep])?;
        let mut staged = self
            .staged
            .take()
            .ok_or(EngineError::InvalidState {
                op: "end_step",
                state: self.state,
            })?;
        self.state = StepState::NotStarted;
        staged.flush()?;
        let (buffer, blocks) = staged.finish();

        let at = self.at();
        let rank = at.rank;
        let step = at.step;
        let mut metrics = StepMetrics {
            step: step.0,
            bytes_sent: buffer.len() as u64,
            ..StepMetrics::default()
        };

        let window =
            TransferWindow::expose(Arc::clone(&self.transport), rank, step, Arc::clone(&buffer))
                .map_err(|e| at.comm(e))?;

        let meta_start = Instant::now();
        let signature = write_signature(&blocks);
        let changed = self.signature != Some(signature);
        if changed && self.lock_requested && self.signature.is_some() {
            let variable = changed_variable(&self.last_blocks, &blocks);
            tracing::warn!(
                stream = %self.config.name,
                %rank,
                %step,
                %variable,
                "write layout changed while locked; unlocking"
            );
            metrics.layout_conflicts += 1;
            self.lock_requested = false;
            self.pending_conflict.get_or_insert(PatternError::LayoutConflict {
                variable,
                reason: "write layout changed while locked".into(),
            });
        }
        self.signature = Some(signature);

        let fast_local = self.config.kind.allows_fast_path()
            && self.lock_requested
            && !changed
            && !self.attributes_dirty
            && self.readers_locked
            && self.assignments.is_some()
            && self.writes.is_some();
        let fast = self.group.all_true(fast_local).map_err(|e| at.comm(e))?;
        metrics.fast_path = fast;

        let cached = if fast { self.writes.clone() } else { None };
        let writes = match cached {
            Some(writes) => {
                metrics.metadata_us = meta_start.elapsed().as_micros() as u64;
                let transfer_start = Instant::now();
                for a in self.assignments.iter().flatten() {
                    if a.byte_length != buffer.len() {
                        return Err(at.comm(CommError::ProtocolViolation(format!(
                            "assignment for reader {} expects {} bytes, buffer has {}",
                            a.peer,
                            a.byte_length,
                            buffer.len()
                        ))));
                    }
                    let parcel = Parcel {
                        step,
                        offset: a.buffer_offset,
                        payload: Arc::clone(&buffer),
                    };
                    self.transport
                        .send(rank, a.peer, parcel)
                        .map_err(|e| at.comm(e))?;
                }
                if rank == Rank(0) {
                    self.transport
                        .announce(Announcement {
                            step,
                            writers_locked: true,
                            pattern: None,
                        })
                        .map_err(|e| at.comm(e))?;
                }
                metrics.transfer_us = transfer_start.elapsed().as_micros() as u64;
                writes
            }
            None => {
                let writes = Arc::new(self.exchange_pattern(at, &blocks)?);
                if rank == Rank(0) {
                    let doc = codec::encode(&*writes).map_err(|e| at.protocol(e))?;
                    self.transport
                        .announce(Announcement {
                            step,
                            writers_locked: false,
                            pattern: Some(Arc::from(doc)),
                        })
                        .map_err(|e| at.comm(e))?;
                }
                self.writes = Some(Arc::clone(&writes));
                self.assignments = None;
                self.attributes_dirty = false;
                metrics.metadata_us = meta_start.elapsed().as_micros() as u64;
                writes
            }
        };
        self.last_blocks = blocks;
        self.published = Some(step);

        let ctx = FinalizeContext {
            transport: Arc::clone(&self.transport),
            rank,
            step,
            timeout: self.config.transfer_timeout,
            window,
            writes,
        };
        self.finalize = Some(FinalizeTask::start(ctx, self.config.threading)?);
        if !self.config.threading {
            self.join_finalize()?;
        }

        metrics.total_us = self
            .step_started
            .map_or(0, |t| t.elapsed().as_micros() as u64);
        tracing::debug!(
            stream = %self.config.name,
            %rank,
            %step,
            fast,
            bytes = buffer.len(),
            "writer step published"
        );
        Ok(metrics)
    }

    /// Gather every writer's blocks and attributes into the step's
    /// write pattern.
    fn exchange_pattern(&self, at: At, blocks: &[WriteBlock]) -> Result<WritePattern, EngineError> {
        let local = codec::encode(&WriterMetadata {
            blocks: blocks.to_vec(),
            attributes: self.attributes.clone(),
        })
        .map_err(|e| at.protocol(e))?;
        let gathered = self.group.all_gather(local).map_err(|e| at.comm(e))?;
        let writers = gathered
            .iter()
            .map(|doc| codec::decode::<WriterMetadata>(doc))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| at.protocol(e))?;
        Ok(WritePattern::from_writers(writers))
    }

    /// End any open step, wait for the last finalize, and tell the
    /// readers no further step will come.
    ///
    /// The close sequence always runs to the end, so readers see the
    /// end of the stream even when the final step failed. The first
    /// error wins: from ending the open step, then the last finalize,
    /// then the group barrier. Otherwise fails with the layout conflict
    /// of the final step, if one was detected and no later step
    /// repaired it.
    pub fn close(&mut self) -> Result<(), EngineError> {
        let ended = match self.state {
            StepState::Closed => {
                return Err(EngineError::InvalidState {
                    op: "close",
                    state: self.state,
                })
            }
            StepState::InStep => self.end_step().map(drop),
            StepState::NotStarted => Ok(()),
        };
        if let Err(e) = &ended {
            tracing::warn!(
                stream = %self.config.name,
                rank = %self.rank(),
                error = %e,
                "final step failed"
            );
        }
        let finalized = self.join_finalize();
        self.state = StepState::Closed;
        self.staged = None;

        let at = self.at();
        let synced = self.group.barrier().map_err(|e| at.comm(e));
        let end = self.published.map_or(StepId(0), StepId::next);
        let announced = if at.rank == Rank(0) {
            self.transport.announce_end(end).map_err(|e| at.comm(e))
        } else {
            Ok(())
        };
        tracing::info!(
            stream = %self.config.name,
            rank = %at.rank,
            steps = end.0,
            "writer closed"
        );
        ended?;
        finalized?;
        synced?;
        announced?;
        match self.pending_conflict.take() {
            Some(conflict) => Err(at.protocol(conflict)),
            None => Ok(()),
        }
    }
}

/// First variable whose blocks differ between two steps.
fn changed_variable(before: &[WriteBlock], after: &[WriteBlock]) -> String {
    let same = |a: &WriteBlock, b: &WriteBlock| {
        a.name == b.name
            && a.data_type == b.data_type
            && a.shape == b.shape
            && a.start == b.start
            && a.count == b.count
            && a.buffer_count == b.buffer_count
    };
    before
        .iter()
        .zip(after)
        .find(|(a, b)| !same(a, b))
        .map(|(_, b)| b.name.clone())
        .or_else(|| {
            let longer = if after.len() > before.len() { after } else { before };
            longer.get(before.len().min(after.len())).map(|b| b.name.clone())
        })
        .unwrap_or_default()
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("stream", &self.config.name)
            .field("rank", &self.rank())
            .field("state", &self.state)
            .field("step", &self.step)
            .field("locked", &self.lock_requested)
            .finish_non_exhaustive()
    }
}
