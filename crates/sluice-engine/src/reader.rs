//! The reader side of a stream.
//!
//! # Step protocol
//!
//! `begin_step` waits (up to its timeout) for writer rank 0's
//! announcement of the next step. A full step carries the pooled write
//! pattern; a locked step carries none and the writers push their
//! buffers to the offsets fixed at the previous step.
//!
//! Gets resolve their selection against the write pattern into a
//! request. Performing gets lays out the receive buffer for every
//! request of the step so far, fills the segments from parcels (locked
//! step) or window fetches, and assembles each request.
//!
//! `end_step` performs outstanding gets, agrees with the reader group
//! whether the read layout is locked and unchanged, gathers the read
//! pattern when the writers need it, and has rank 0 post the step
//! notice.

use indexmap::IndexMap;
use sluice_comm::{
    Collective, CommError, Notice, OperatorRegistry, Polled, StreamTransport,
};
use sluice_core::{decode_slice, encode_slice, DataType, Dims, Element, Rank, StepId};
use sluice_pattern::{
    codec, read_signature, reader_positions, resolve_request, writers_for, Attributes,
    OverlapAssignment, PatternError, ReadPattern, ReadRequest, VariableInfo, WritePattern,
};
use sluice_select::Selection;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ConfigError, StreamConfig};
use crate::coordinator::{assemble, shape_output, ReceiveBuffer};
use crate::error::{At, EngineError};
use crate::metrics::StepMetrics;
use crate::state::{StepState, StepStatus};

/// A block of a variable as published in the current step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Writer rank holding the block.
    pub writer: Rank,
    /// Block id, usable with [`Selection::block`].
    pub index: usize,
    /// Offset in the global array.
    pub start: Dims,
    /// Extent.
    pub count: Dims,
}

/// Ticket for a deferred get, redeemed with [`StreamReader::take`].
pub struct GetHandle<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GetHandle<T> {
    /// Handle id, unique within the reader.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> fmt::Debug for GetHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GetHandle").field(&self.id).finish()
    }
}

struct PendingGet {
    id: u64,
    request: ReadRequest,
    selection: Selection,
    base: Option<Vec<u8>>,
}

/// One reader rank of a stream.
pub struct StreamReader {
    config: StreamConfig,
    group: Arc<dyn Collective>,
    transport: Arc<dyn StreamTransport>,
    operators: OperatorRegistry,
    state: StepState,
    next: StepId,
    current: Option<StepId>,
    end_of_stream: bool,
    step_started: Option<Instant>,
    metrics: StepMetrics,

    // Current step.
    fast: bool,
    writes: Option<Arc<WritePattern>>,
    requests: Vec<ReadRequest>,
    pending: Vec<PendingGet>,
    results: IndexMap<u64, Vec<u8>>,
    next_handle: u64,
    receive: ReceiveBuffer,
    parcels: BTreeMap<Rank, Arc<[u8]>>,
    parcels_drained: bool,

    // Layout tracking.
    lock_requested: bool,
    last_requests: Vec<ReadRequest>,
    signature: Option<u64>,
    locked_assignments: Option<Vec<OverlapAssignment>>,
    pending_conflict: Option<PatternError>,
}

impl StreamReader {
    /// Join the reader group of a stream.
    pub fn open(
        config: StreamConfig,
        group: Arc<dyn Collective>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if group.size() != transport.reader_count() {
            return Err(ConfigError::GroupSizeMismatch {
                group: group.size(),
                transport: transport.reader_count(),
            }
            .into());
        }
        tracing::info!(
            stream = %config.name,
            rank = %group.rank(),
            readers = group.size(),
            writers = transport.writer_count(),
            "reader opened"
        );
        Ok(Self {
            config,
            group,
            transport,
            operators: OperatorRegistry::new(),
            state: StepState::NotStarted,
            next: StepId(0),
            current: None,
            end_of_stream: false,
            step_started: None,
            metrics: StepMetrics::default(),
            fast: false,
            writes: None,
            requests: Vec::new(),
            pending: Vec::new(),
            results: IndexMap::new(),
            next_handle: 0,
            receive: ReceiveBuffer::new(),
            parcels: BTreeMap::new(),
            parcels_drained: false,
            lock_requested: false,
            last_requests: Vec::new(),
            signature: None,
            locked_assignments: None,
            pending_conflict: None,
        })
    }

    /// Use `operators` to undo the writers' payload transforms.
    pub fn with_operators(mut self, operators: OperatorRegistry) -> Self {
        self.operators = operators;
        self
    }

    /// This reader's rank.
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
        self.current
    }

    /// Promise that this reader's selections stay fixed from now on.
    pub fn lock_layout(&mut self) {
        self.lock_requested = true;
    }

    /// Whether the layout is currently locked.
    pub fn is_locked(&self) -> bool {
        self.lock_requested
    }

    fn at(&self) -> At {
        At {
            step: self.current.unwrap_or_default(),
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

    fn current_writes(&self) -> Result<Arc<WritePattern>, EngineError> {
        self.writes.clone().ok_or_else(|| {
            self.at().comm(CommError::ProtocolViolation(
                "no write pattern has been announced".into(),
            ))
        })
    }

    /// Lift a pattern error, reporting bad selections as invalid
    /// arguments.
    fn lift(&self, e: PatternError) -> EngineError {
        match e {
            PatternError::Selection { source, .. } => EngineError::InvalidArgument(source),
            other => self.at().protocol(other),
        }
    }

    fn note_conflict(&mut self, variable: String, reason: String) {
        let at = self.at();
        tracing::warn!(
            stream = %self.config.name,
            rank = %at.rank,
            step = %at.step,
            %variable,
            %reason,
            "read layout conflict; unlocking"
        );
        self.metrics.layout_conflicts += 1;
        self.lock_requested = false;
        self.pending_conflict
            .get_or_insert(PatternError::LayoutConflict { variable, reason });
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Wait up to `timeout` for the next step. `None` waits forever.
    ///
    /// [`StepStatus::NotReady`] leaves the engine between steps;
    /// [`StepStatus::EndOfStream`] is returned for every call once the
    /// writers have closed.
    pub fn begin_step(&mut self, timeout: Option<Duration>) -> Result<StepStatus, EngineError> {
        self.require("begin_step", &[StepState::NotStarted])?;
        if self.end_of_stream {
            return Ok(StepStatus::EndOfStream);
        }
        let step = self.next;
        let at = At {
            step,
            rank: self.rank(),
        };
        let announcement = match self
            .transport
            .poll_announcement(at.rank, step, timeout)
            .map_err(|e| at.comm(e))?
        {
            Polled::Ready(a) => a,
            Polled::NotReady => {
                tracing::trace!(rank = %at.rank, %step, "step not ready");
                return Ok(StepStatus::NotReady);
            }
            Polled::EndOfStream => {
                tracing::info!(stream = %self.config.name, rank = %at.rank, %step, "end of stream");
                self.end_of_stream = true;
                return Ok(StepStatus::EndOfStream);
            }
        };

        match &announcement.pattern {
            Some(doc) => {
                let writes: WritePattern = codec::decode(doc).map_err(|e| at.protocol(e))?;
                self.writes = Some(Arc::new(writes));
            }
            None if self.writes.is_none() || self.locked_assignments.is_none() => {
                return Err(at.comm(CommError::ProtocolViolation(format!(
                    "step {step} is locked but this reader has no locked layout"
                ))));
            }
            None => {}
        }
        self.fast = announcement.writers_locked;

        self.current = Some(step);
        self.step_started = Some(Instant::now());
        self.metrics = StepMetrics {
            step: step.0,
            fast_path: self.fast,
            ..StepMetrics::default()
        };
        self.requests.clear();
        self.pending.clear();
        self.results.clear();
        self.receive = ReceiveBuffer::new();
        self.parcels.clear();
        self.parcels_drained = false;
        self.pending_conflict = None;
        self.state = StepState::InStep;
        tracing::trace!(rank = %at.rank, %step, fast = self.fast, "reader begin step");
        Ok(StepStatus::Ok)
    }

    // ── Metadata ───────────────────────────────────────────────────

    /// Variables published in the current step, in pattern order.
    pub fn available_variables(&self) -> Result<Vec<(String, VariableInfo)>, EngineError> {
        self.require("available_variables", &[StepState::InStep])?;
        let writes = self.current_writes()?;
        Ok(writes
            .variable_names()
            .into_iter()
            .filter_map(|name| writes.variable(name).map(|info| (name.to_string(), info)))
            .collect())
    }

    /// Attributes published with the current write pattern.
    ///
    /// Empty when the writers defined none.
    pub fn attributes(&self) -> Result<Attributes, EngineError> {
        self.require("attributes", &[StepState::InStep])?;
        Ok(self.current_writes()?.attributes().clone())
    }

    /// Blocks of `name` published in the current step, ascending writer
    /// rank.
    pub fn blocks_info(&self, name: &str) -> Result<Vec<BlockInfo>, EngineError> {
        self.require("blocks_info", &[StepState::InStep])?;
        let writes = self.current_writes()?;
        if writes.variable(name).is_none() {
            return Err(EngineError::UnknownVariable {
                name: name.to_string(),
            });
        }
        Ok(writes
            .blocks_of(name)
            .map(|b| BlockInfo {
                writer: b.rank,
                index: b.block_index,
                start: b.start.clone(),
                count: b.count.clone(),
            })
            .collect())
    }

    // ── Gets ───────────────────────────────────────────────────────

    fn enqueue(
        &mut self,
        name: &str,
        data_type: DataType,
        selection: &Selection,
        base: Option<Vec<u8>>,
    ) -> Result<u64, EngineError> {
        self.require("get", &[StepState::InStep])?;
        if selection.step_start() != 0 || selection.step_count() != 1 {
            return Err(EngineError::Unsupported {
                what: "step selections on a stream".into(),
            });
        }
        let writes = self.current_writes()?;
        let request = resolve_request(name, data_type, selection, &writes, self.rank())
            .map_err(|e| self.lift(e))?;
        writers_for(&writes, &request).map_err(|e| self.lift(e))?;

        let id = self.next_handle;
        self.next_handle += 1;
        self.requests.push(request.clone());
        self.pending.push(PendingGet {
            id,
            request,
            selection: selection.clone(),
            base,
        });
        Ok(id)
    }

    fn redeem(&mut self, id: u64) -> Result<Vec<u8>, EngineError> {
        self.results
            .shift_remove(&id)
            .ok_or(EngineError::StaleHandle { id })
    }

    /// Read `selection` of `name` now.
    ///
    /// With a memory selection the result spans the whole memory box,
    /// zero outside the selected region.
    pub fn get_sync<T: Element>(
        &mut self,
        name: &str,
        selection: &Selection,
    ) -> Result<Vec<T>, EngineError> {
        let id = self.enqueue(name, T::DATA_TYPE, selection, None)?;
        self.perform_gets()?;
        Ok(decode_slice(&self.redeem(id)?))
    }

    /// Read the string variable `name` now.
    pub fn get_string(&mut self, name: &str) -> Result<String, EngineError> {
        let id = self.enqueue(name, DataType::String, &Selection::all(), None)?;
        self.perform_gets()?;
        let bytes = self.redeem(id)?;
        String::from_utf8(bytes).map_err(|e| {
            self.at().comm(CommError::ProtocolViolation(format!(
                "string '{name}' is not valid UTF-8: {e}"
            )))
        })
    }

    /// Read `selection` of `name` now into `out`.
    ///
    /// `out` must hold the memory box when the selection has one, the
    /// selected output otherwise. Elements outside the memory
    /// selection's region are left untouched.
    pub fn get_into<T: Element>(
        &mut self,
        name: &str,
        selection: &Selection,
        out: &mut [T],
    ) -> Result<(), EngineError> {
        let id = self.enqueue(name, T::DATA_TYPE, selection, Some(encode_slice(out)))?;
        self.perform_gets()?;
        let values: Vec<T> = decode_slice(&self.redeem(id)?);
        if values.len() != out.len() {
            return Err(EngineError::SizeMismatch {
                name: name.to_string(),
                expected: values.len(),
                got: out.len(),
            });
        }
        out.copy_from_slice(&values);
        Ok(())
    }

    /// Queue a read of `selection` of `name`, performed at the next
    /// [`perform_gets`](Self::perform_gets) or `end_step`.
    pub fn get_deferred<T: Element>(
        &mut self,
        name: &str,
        selection: &Selection,
    ) -> Result<GetHandle<T>, EngineError> {
        let id = self.enqueue(name, T::DATA_TYPE, selection, None)?;
        Ok(GetHandle {
            id,
            _marker: PhantomData,
        })
    }

    /// Collect a deferred get, performing it first if it is still
    /// queued. Results are available until the next step begins.
    pub fn take<T: Element>(&mut self, handle: GetHandle<T>) -> Result<Vec<T>, EngineError> {
        self.require("take", &[StepState::NotStarted, StepState::InStep])?;
        if self.pending.iter().any(|p| p.id == handle.id) {
            self.perform_gets()?;
        }
        Ok(decode_slice(&self.redeem(handle.id)?))
    }

    /// Perform every queued get.
    pub fn perform_gets(&mut self) -> Result<(), EngineError> {
        self.require("perform_gets", &[StepState::InStep])?;
        if self.pending.is_empty() {
            return Ok(());
        }
        self.fill_receive_buffer()?;
        let at = self.at();
        let writes = self.current_writes()?;
        for get in std::mem::take(&mut self.pending) {
            let region = get.request.region();
            let assembled = assemble(at, &writes, &get.request, &self.receive, &self.operators)?;
            let shaped = shape_output(
                &get.selection,
                get.request.data_type,
                &region,
                assembled,
                get.base,
            )?;
            self.results.insert(get.id, shaped);
        }
        Ok(())
    }

    /// Make sure every writer the step's requests touch has its
    /// segment in the receive buffer.
    fn fill_receive_buffer(&mut self) -> Result<(), EngineError> {
        let at = self.at();
        let writes = self.current_writes()?;
        let assignments = reader_positions(&writes, &self.requests).map_err(|e| self.lift(e))?;
        self.receive.relayout(assignments);
        if self.fast && !self.parcels_drained {
            self.drain_parcels()?;
        }

        let transfer_start = Instant::now();
        for a in self.receive.missing() {
            if let Some(payload) = self.parcels.get(&a.peer) {
                self.receive
                    .place(a.peer, payload)
                    .map_err(|e| at.comm(e))?;
                continue;
            }
            if self.fast {
                let variable = self
                    .requests
                    .iter()
                    .find(|r| {
                        writers_for(&writes, r)
                            .is_ok_and(|found| found.iter().any(|o| o.block.rank == a.peer))
                    })
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                self.note_conflict(
                    variable,
                    format!("writer {} is outside the locked layout", a.peer),
                );
            }
            let payload = self
                .transport
                .fetch(a.peer, at.step, 0..a.byte_length)
                .map_err(|e| at.comm(e))?;
            self.metrics.window_fetches += 1;
            self.metrics.bytes_received += payload.len() as u64;
            self.receive
                .place(a.peer, &payload)
                .map_err(|e| at.comm(e))?;
        }
        self.metrics.transfer_us += transfer_start.elapsed().as_micros() as u64;
        Ok(())
    }

    /// Receive every parcel the locked layout says is coming this step.
    fn drain_parcels(&mut self) -> Result<(), EngineError> {
        self.parcels_drained = true;
        let at = self.at();
        let Some(locked) = self.locked_assignments.clone() else {
            return Ok(());
        };
        let transfer_start = Instant::now();
        for a in locked {
            let parcel = self
                .transport
                .recv(at.rank, a.peer, self.config.transfer_timeout)
                .map_err(|e| at.comm(e))?;
            if parcel.step != at.step
                || parcel.offset != a.buffer_offset
                || parcel.payload.len() != a.byte_length
            {
                return Err(at.comm(CommError::ProtocolViolation(format!(
                    "parcel from writer {} (step {}, offset {}, {} bytes) does not match \
                     the locked layout (offset {}, {} bytes)",
                    a.peer,
                    parcel.step,
                    parcel.offset,
                    parcel.payload.len(),
                    a.buffer_offset,
                    a.byte_length
                ))));
            }
            self.metrics.bytes_received += parcel.payload.len() as u64;
            self.parcels.insert(a.peer, parcel.payload);
        }
        self.metrics.transfer_us += transfer_start.elapsed().as_micros() as u64;
        Ok(())
    }

    /// Finish the step and report this reader's layout to the writers.
    pub fn end_step(&mut self) -> Result<StepMetrics, EngineError> {
        self.require("end_step", &[StepState::InStep])?;
        self.perform_gets()?;
        if self.fast && !self.parcels_drained {
            self.drain_parcels()?;
        }
        self.state = StepState::NotStarted;
        let at = self.at();
        self.next = at.step.next();

        let meta_start = Instant::now();
        let signature = read_signature(&self.requests);
        let changed = self.signature != Some(signature);
        if changed && self.lock_requested && self.signature.is_some() {
            let variable = changed_request(&self.last_requests, &self.requests);
            self.note_conflict(variable, "read selections changed while locked".into());
        }
        self.signature = Some(signature);
        self.last_requests.clone_from(&self.requests);

        let comm = |e| at.comm(e);
        let all_locked = self
            .group
            .all_true(self.lock_requested && !changed)
            .map_err(comm)?;
        let any_changed = !self.group.all_true(!changed).map_err(comm)?;
        let publish = !self.fast || any_changed || !all_locked;

        let pattern = if publish {
            let local = codec::encode(&self.requests).map_err(|e| at.protocol(e))?;
            let gathered = self.group.all_gather(local).map_err(comm)?;
            let ranks = gathered
                .iter()
                .map(|doc| codec::decode::<Vec<ReadRequest>>(doc))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| at.protocol(e))?;
            let doc = codec::encode(&ReadPattern::from_ranks(ranks)).map_err(|e| at.protocol(e))?;
            Some(Arc::from(doc))
        } else {
            None
        };

        self.locked_assignments = if all_locked {
            let writes = self.current_writes()?;
            Some(reader_positions(&writes, &self.requests).map_err(|e| self.lift(e))?)
        } else {
            None
        };

        if at.rank == Rank(0) {
            self.transport
                .post_notice(Notice {
                    step: at.step,
                    readers_locked: all_locked,
                    pattern,
                })
                .map_err(comm)?;
        }
        self.metrics.metadata_us += meta_start.elapsed().as_micros() as u64;
        self.metrics.total_us = self
            .step_started
            .map_or(0, |t| t.elapsed().as_micros() as u64);
        tracing::debug!(
            stream = %self.config.name,
            rank = %at.rank,
            step = %at.step,
            fast = self.fast,
            locked = all_locked,
            published = publish,
            received = self.metrics.bytes_received,
            buffer = self.receive.len(),
            "reader step complete"
        );
        Ok(self.metrics.clone())
    }

    /// End any open step and leave the stream.
    ///
    /// The reader group departs even when ending the open step fails,
    /// so writers waiting on it are released; that error is returned
    /// first. Otherwise fails with the layout conflict of the final
    /// step, if one was detected.
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
        self.state = StepState::Closed;
        let at = self.at();
        let synced = self.group.barrier().map_err(|e| at.comm(e));
        if at.rank == Rank(0) {
            self.transport.depart_readers();
        }
        tracing::info!(stream = %self.config.name, rank = %at.rank, "reader closed");
        ended?;
        synced?;
        match self.pending_conflict.take() {
            Some(conflict) => Err(at.protocol(conflict)),
            None => Ok(()),
        }
    }
}

/// First variable whose requests differ between two steps.
fn changed_request(before: &[ReadRequest], after: &[ReadRequest]) -> String {
    let same = |a: &ReadRequest, b: &ReadRequest| {
        a.name == b.name
            && a.data_type == b.data_type
            && a.start == b.start
            && a.count == b.count
            && a.block_id == b.block_id
    };
    before
        .iter()
        .zip(after)
        .find(|(a, b)| !same(a, b))
        .map(|(_, b)| b.name.clone())
        .or_else(|| {
            let longer = if after.len() > before.len() { after } else { before };
            longer.get(before.len().min(after.len())).map(|r| r.name.clone())
        })
        .unwrap_or_default()
}

impl fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReader")
            .field("stream", &self.config.name)
            .field("rank", &self.rank())
            .field("state", &self.state)
            .field("step", &self.current)
            .field("locked", &self.lock_requested)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_comm::{Announcement, LocalFabric, LocalGroup};
    use sluice_pattern::{ShapeKind, WriteBlock};
    use sluice_select::SelectionError;

    fn solo() -> (StreamReader, Arc<LocalFabric>) {
        let fabric = LocalFabric::new(1, 1);
        let group = LocalGroup::create(1).remove(0);
        let config = StreamConfig::new("t").with_transfer_timeout(Some(Duration::from_secs(5)));
        let r = StreamReader::open(config, Arc::new(group), fabric.clone()).unwrap();
        (r, fabric)
    }

    /// Publish step `step` by hand: one writer, one f64 array `u` of
    /// shape `[4]` holding `values`.
    fn publish(fabric: &LocalFabric, step: u64, values: [f64; 4]) {
        let mut buffer = vec![0u8];
        buffer.extend(encode_slice(&values));
        let block = WriteBlock {
            name: "u".into(),
            data_type: DataType::Float64,
            shape_kind: ShapeKind::GlobalArray,
            shape: Dims::from_slice(&[4]),
            start: Dims::from_slice(&[0]),
            count: Dims::from_slice(&[4]),
            rank: Rank(0),
            block_index: 0,
            buffer_start: 1,
            buffer_count: 32,
            operator: None,
        };
        let writes = WritePattern::from_ranks(vec![vec![block]]);
        fabric
            .expose(Rank(0), StepId(step), Arc::from(buffer))
            .unwrap();
        fabric
            .announce(Announcement {
                step: StepId(step),
                writers_locked: false,
                pattern: Some(Arc::from(codec::encode(&writes).unwrap())),
            })
            .unwrap();
    }

    #[test]
    fn not_ready_leaves_state_unchanged() {
        let (mut r, _) = solo();
        assert_eq!(
            r.begin_step(Some(Duration::from_millis(10))).unwrap(),
            StepStatus::NotReady
        );
        assert_eq!(r.state(), StepState::NotStarted);
        assert_eq!(r.current_step(), None);
    }

    #[test]
    fn reads_a_published_step() {
        let (mut r, fabric) = solo();
        publish(&fabric, 0, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(r.begin_step(None).unwrap(), StepStatus::Ok);
        let sel = Selection::bounding_box(&[1], &[2]).unwrap();
        assert_eq!(r.get_sync::<f64>("u", &sel).unwrap(), vec![2.0, 3.0]);
        let info = r.blocks_info("u").unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].count.as_slice(), &[4]);
        let m = r.end_step().unwrap();
        assert_eq!(m.window_fetches, 1);
        assert_eq!(m.bytes_received, 33);

        let notice = fabric
            .await_notice(Rank(0), StepId(0), Some(Duration::from_secs(1)))
            .unwrap();
        assert!(!notice.readers_locked);
        let reads: ReadPattern = codec::decode(notice.pattern.as_deref().unwrap()).unwrap();
        assert_eq!(reads.rank(Rank(0)).len(), 1);
    }

    #[test]
    fn deferred_gets_are_taken_after_end_step() {
        let (mut r, fabric) = solo();
        publish(&fabric, 0, [5.0, 6.0, 7.0, 8.0]);
        r.begin_step(None).unwrap();
        let h = r.get_deferred::<f64>("u", &Selection::all()).unwrap();
        r.end_step().unwrap();
        assert_eq!(r.take(h).unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn request_errors() {
        let (mut r, fabric) = solo();
        publish(&fabric, 0, [0.0; 4]);
        r.begin_step(None).unwrap();
        match r.get_sync::<f32>("u", &Selection::all()) {
            Err(EngineError::Protocol {
                source: PatternError::TypeMismatch { .. },
                ..
            }) => {}
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
        match r.get_sync::<f64>("u", &Selection::bounding_box(&[3], &[2]).unwrap()) {
            Err(EngineError::InvalidArgument(SelectionError::OutOfBounds)) => {}
            other => panic!("expected OutOfBounds, got {other:?}"),
        }
        match r.get_sync::<f64>("u", &Selection::all().with_steps(0, 2).unwrap()) {
            Err(EngineError::Unsupported { .. }) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
        assert!(matches!(
            r.blocks_info("w"),
            Err(EngineError::UnknownVariable { .. })
        ));
        // Failed requests are not part of the read pattern.
        r.end_step().unwrap();
        let notice = fabric
            .await_notice(Rank(0), StepId(0), Some(Duration::from_secs(1)))
            .unwrap();
        let reads: ReadPattern = codec::decode(notice.pattern.as_deref().unwrap()).unwrap();
        assert!(reads.rank(Rank(0)).is_empty());
    }

    #[test]
    fn get_into_respects_memory_selection() {
        let (mut r, fabric) = solo();
        publish(&fabric, 0, [1.0, 2.0, 3.0, 4.0]);
        r.begin_step(None).unwrap();
        let sel = Selection::bounding_box(&[0], &[2])
            .unwrap()
            .with_memory(&[2], &[5])
            .unwrap();
        let mut out = [-1.0f64; 5];
        r.get_into("u", &sel, &mut out).unwrap();
        assert_eq!(out, [-1.0, -1.0, 1.0, 2.0, -1.0]);
    }

    #[test]
    fn end_of_stream_is_sticky_and_close_departs() {
        let (mut r, fabric) = solo();
        fabric.announce_end(StepId(0)).unwrap();
        assert_eq!(r.begin_step(None).unwrap(), StepStatus::EndOfStream);
        assert_eq!(r.begin_step(None).unwrap(), StepStatus::EndOfStream);
        r.close().unwrap();
        assert_eq!(
            fabric.await_notice(Rank(0), StepId(0), Some(Duration::from_millis(10))),
            Err(CommError::Disconnected)
        );
        match r.get_sync::<f64>("u", &Selection::all()) {
            Err(EngineError::InvalidState {
                op: "get",
                state: StepState::Closed,
            }) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn close_departs_even_when_the_final_step_fails() {
        let (mut r, fabric) = solo();
        publish(&fabric, 0, [1.0, 2.0, 3.0, 4.0]);
        r.begin_step(None).unwrap();
        let _pending = r.get_deferred::<f64>("u", &Selection::all()).unwrap();
        fabric.retire(Rank(0), StepId(0));

        assert!(matches!(r.close(), Err(EngineError::Comm { .. })));
        assert_eq!(r.state(), StepState::Closed);
        assert_eq!(
            fabric.await_notice(Rank(0), StepId(0), Some(Duration::from_millis(10))),
            Err(CommError::Disconnected)
        );
    }

    #[test]
    fn changed_request_names_first_difference() {
        let req = |name: &str, count: usize| ReadRequest {
            name: name.into(),
            data_type: DataType::Float64,
            start: Dims::from_slice(&[0]),
            count: Dims::from_slice(&[count]),
            rank: Rank(0),
            block_id: None,
        };
        let before = [req("a", 4), req("b", 4)];
        assert_eq!(changed_request(&before, &[req("a", 4), req("b", 2)]), "b");
        assert_eq!(changed_request(&before, &[req("a", 4)]), "b");
        assert_eq!(
            changed_request(&before, &[req("a", 4), req("b", 4), req("c", 1)]),
            "c"
        );
        assert_eq!(changed_request(&[], &[req("a", 1)]), "a");
    }

    #[test]
    fn locked_step_without_layout_is_a_protocol_violation() {
        let (mut r, fabric) = solo();
        fabric
            .announce(Announcement {
                step: StepId(0),
                writers_locked: true,
                pattern: None,
            })
            .unwrap();
        assert!(matches!(
            r.begin_step(None),
            Err(EngineError::Comm {
                source: CommError::ProtocolViolation(_),
                ..
            })
        ));
    }
}
