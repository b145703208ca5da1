//! Writer end-of-step finalize.
//!
//! After a writer publishes step `s` it must keep the step buffer
//! exposed until the readers report that `s` is done, and it must pick
//! up the read pattern that report carries. That wait either runs
//! inline in `end_step` or on a named background thread that the next
//! `begin_step` (or `close`) joins.

use sluice_comm::{CommError, StreamTransport, TransferWindow};
use sluice_core::{Rank, StepId};
use sluice_pattern::{codec, writer_positions, OverlapAssignment, ReadPattern, WritePattern};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{At, EngineError};

/// What a writer learns from the readers' end-of-step notice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FinalizeOutcome {
    /// Every reader locked its selections and none changed.
    pub readers_locked: bool,
    /// Fresh push destinations, if the notice carried a read pattern.
    pub assignments: Option<Vec<OverlapAssignment>>,
    /// The reader group has closed.
    pub readers_departed: bool,
}

/// Everything the finalize wait needs, owned so it can move to a thread.
pub(crate) struct FinalizeContext {
    pub transport: Arc<dyn StreamTransport>,
    pub rank: Rank,
    pub step: StepId,
    pub timeout: Option<Duration>,
    pub window: TransferWindow,
    pub writes: Arc<WritePattern>,
}

impl FinalizeContext {
    fn run(self) -> Result<FinalizeOutcome, EngineError> {
        let at = At {
            step: self.step,
            rank: self.rank,
        };
        let outcome = match self.transport.await_notice(self.rank, self.step, self.timeout) {
            Ok(notice) => {
                let assignments = match &notice.pattern {
                    Some(bytes) => {
                        let reads: ReadPattern =
                            codec::decode(bytes).map_err(|e| at.protocol(e))?;
                        Some(writer_positions(&self.writes, self.rank, &reads))
                    }
                    None => None,
                };
                tracing::trace!(
                    step = %self.step,
                    rank = %self.rank,
                    readers_locked = notice.readers_locked,
                    "step notice received"
                );
                FinalizeOutcome {
                    readers_locked: notice.readers_locked,
                    assignments,
                    readers_departed: false,
                }
            }
            Err(CommError::Disconnected) => {
                tracing::warn!(step = %self.step, rank = %self.rank, "reader group has departed");
                FinalizeOutcome {
                    readers_departed: true,
                    ..FinalizeOutcome::default()
                }
            }
            Err(e) => return Err(at.comm(e)),
        };
        self.window.release();
        Ok(outcome)
    }
}

/// A finalize that has either completed inline or is running on its
/// own thread.
pub(crate) enum FinalizeTask {
    Done(Result<FinalizeOutcome, EngineError>),
    Running(JoinHandle<Result<FinalizeOutcome, EngineError>>),
}

impl FinalizeTask {
    /// Run `ctx` inline, or on a thread named `sluice-finalize-{rank}`
    /// when `threaded`.
    pub fn start(ctx: FinalizeContext, threaded: bool) -> Result<Self, EngineError> {
        if !threaded {
            return Ok(Self::Done(ctx.run()));
        }
        let handle = thread::Builder::new()
            .name(format!("sluice-finalize-{}", ctx.rank))
            .spawn(move || ctx.run())
            .map_err(|e| EngineError::ThreadSpawnFailed {
                reason: e.to_string(),
            })?;
        Ok(Self::Running(handle))
    }

    /// Wait for the finalize to complete.
    pub fn join(self) -> Result<FinalizeOutcome, EngineError> {
        match self {
            Self::Done(result) => result,
            Self::Running(handle) => handle.join().map_err(|_| EngineError::ThreadPanicked)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_comm::{LocalFabric, Notice};
    use sluice_pattern::WriteBlock;

    fn writes() -> Arc<WritePattern> {
        Arc::new(WritePattern::from_ranks(vec![Vec::<WriteBlock>::new()]))
    }

    fn context(fabric: &Arc<LocalFabric>, step: StepId) -> FinalizeContext {
        let window = TransferWindow::expose(fabric.clone(), Rank(0), step, Arc::from(&[0u8][..]))
            .unwrap();
        FinalizeContext {
            transport: fabric.clone(),
            rank: Rank(0),
            step,
            timeout: Some(Duration::from_secs(5)),
            window,
            writes: writes(),
        }
    }

    #[test]
    fn inline_finalize_releases_window() {
        let fabric = LocalFabric::new(1, 1);
        fabric
            .post_notice(Notice {
                step: StepId(0),
                readers_locked: true,
                pattern: None,
            })
            .unwrap();
        let outcome = FinalizeTask::start(context(&fabric, StepId(0)), false)
            .unwrap()
            .join()
            .unwrap();
        assert!(outcome.readers_locked);
        assert!(outcome.assignments.is_none());
        assert_eq!(fabric.open_windows(), 0);
    }

    #[test]
    fn threaded_finalize_waits_for_notice() {
        let fabric = LocalFabric::new(1, 1);
        let task = FinalizeTask::start(context(&fabric, StepId(3)), true).unwrap();
        assert_eq!(fabric.open_windows(), 1);
        fabric
            .post_notice(Notice {
                step: StepId(3),
                readers_locked: false,
                pattern: None,
            })
            .unwrap();
        let outcome = task.join().unwrap();
        assert!(!outcome.readers_locked);
        assert_eq!(fabric.open_windows(), 0);
    }

    #[test]
    fn departed_readers_end_gracefully() {
        let fabric = LocalFabric::new(1, 1);
        fabric.depart_readers();
        let outcome = FinalizeTask::start(context(&fabric, StepId(0)), false)
            .unwrap()
            .join()
            .unwrap();
        assert!(outcome.readers_departed);
        assert_eq!(fabric.open_windows(), 0);
    }

    #[test]
    fn timeout_is_reported_with_step() {
        let fabric = LocalFabric::new(1, 1);
        let mut ctx = context(&fabric, StepId(1));
        ctx.timeout = Some(Duration::from_millis(20));
        match FinalizeTask::start(ctx, false).unwrap().join() {
            Err(EngineError::Comm {
                step,
                source: CommError::Timeout { .. },
                ..
            }) => assert_eq!(step, StepId(1)),
            other => panic!("expected Comm timeout, got {other:?}"),
        }
        // The window is retired when the context is dropped.
        assert_eq!(fabric.open_windows(), 0);
    }
}
