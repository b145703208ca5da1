//! The engine abstraction shared by both sides of a stream.

use sluice_comm::{Collective, OperatorRegistry, StreamTransport};
use sluice_core::StepId;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::error::EngineError;
use crate::metrics::StepMetrics;
use crate::reader::StreamReader;
use crate::state::{StepMode, StepState, StepStatus};
use crate::writer::StreamWriter;

/// Step lifecycle common to writers and readers.
pub trait StepEngine {
    /// Open the next step. `timeout` only bounds readers' waits.
    fn begin_step(
        &mut self,
        mode: StepMode,
        timeout: Option<Duration>,
    ) -> Result<StepStatus, EngineError>;

    /// Complete the current step.
    fn end_step(&mut self) -> Result<StepMetrics, EngineError>;

    /// End any open step and leave the stream.
    fn close(&mut self) -> Result<(), EngineError>;

    /// Most recently begun step.
    fn current_step(&self) -> Option<StepId>;

    /// Lifecycle state.
    fn state(&self) -> StepState;
}

fn check_mode(expected: StepMode, got: StepMode) -> Result<(), EngineError> {
    if expected == got {
        Ok(())
    } else {
        Err(EngineError::WrongMode { expected, got })
    }
}

impl StepEngine for StreamWriter {
    fn begin_step(
        &mut self,
        mode: StepMode,
        _timeout: Option<Duration>,
    ) -> Result<StepStatus, EngineError> {
        check_mode(StepMode::Append, mode)?;
        StreamWriter::begin_step(self)
    }

    fn end_step(&mut self) -> Result<StepMetrics, EngineError> {
        StreamWriter::end_step(self)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        StreamWriter::close(self)
    }

    fn current_step(&self) -> Option<StepId> {
        StreamWriter::current_step(self)
    }

    fn state(&self) -> StepState {
        StreamWriter::state(self)
    }
}

impl StepEngine for StreamReader {
    fn begin_step(
        &mut self,
        mode: StepMode,
        timeout: Option<Duration>,
    ) -> Result<StepStatus, EngineError> {
        check_mode(StepMode::Read, mode)?;
        StreamReader::begin_step(self, timeout)
    }

    fn end_step(&mut self) -> Result<StepMetrics, EngineError> {
        StreamReader::end_step(self)
    }

    fn close(&mut self) -> Result<(), EngineError> {
        StreamReader::close(self)
    }

    fn current_step(&self) -> Option<StepId> {
        StreamReader::current_step(self)
    }

    fn state(&self) -> StepState {
        StreamReader::state(self)
    }
}

/// A stream endpoint, chosen when the stream is opened.
#[derive(Debug)]
pub enum Engine {
    /// Writer rank.
    Writer(StreamWriter),
    /// Reader rank.
    Reader(StreamReader),
}

impl Engine {
    /// Open a stream in `mode`: [`StepMode::Append`] joins the writer
    /// group, [`StepMode::Read`] the reader group.
    pub fn open(
        mode: StepMode,
        config: StreamConfig,
        group: Arc<dyn Collective>,
        transport: Arc<dyn StreamTransport>,
        operators: OperatorRegistry,
    ) -> Result<Self, EngineError> {
        Ok(match mode {
            StepMode::Append => Self::Writer(
                StreamWriter::open(config, group, transport)?.with_operators(operators),
            ),
            StepMode::Read => Self::Reader(
                StreamReader::open(config, group, transport)?.with_operators(operators),
            ),
        })
    }

    /// The step mode this engine accepts.
    pub fn mode(&self) -> StepMode {
        match self {
            Self::Writer(_) => StepMode::Append,
            Self::Reader(_) => StepMode::Read,
        }
    }

    /// The writer, if this is one.
    pub fn as_writer(&mut self) -> Option<&mut StreamWriter> {
        match self {
            Self::Writer(w) => Some(w),
            Self::Reader(_) => None,
        }
    }

    /// The reader, if this is one.
    pub fn as_reader(&mut self) -> Option<&mut StreamReader> {
        match self {
            Self::Reader(r) => Some(r),
            Self::Writer(_) => None,
        }
    }
}

impl StepEngine for Engine {
    fn begin_step(
        &mut self,
        mode: StepMode,
        timeout: Option<Duration>,
    ) -> Result<StepStatus, EngineError> {
        match self {
            Self::Writer(w) => StepEngine::begin_step(w, mode, timeout),
            Self::Reader(r) => StepEngine::begin_step(r, mode, timeout),
        }
    }

    fn end_step(&mut self) -> Result<StepMetrics, EngineError> {
        match self {
            Self::Writer(w) => w.end_step(),
            Self::Reader(r) => r.end_step(),
        }
    }

    fn close(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Writer(w) => w.close(),
            Self::Reader(r) => r.close(),
        }
    }

    fn current_step(&self) -> Option<StepId> {
        match self {
            Self::Writer(w) => w.current_step(),
            Self::Reader(r) => r.current_step(),
        }
    }

    fn state(&self) -> StepState {
        match self {
            Self::Writer(w) => w.state(),
            Self::Reader(r) => r.state(),
        }
    }
}

// Compile-time assertion: engines move onto application threads.
const _: fn() = || {
    fn assert<T: Send>() {}
    assert::<Engine>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_comm::{LocalFabric, LocalGroup};

    fn open(mode: StepMode) -> Engine {
        let fabric = LocalFabric::new(1, 1);
        let group = LocalGroup::create(1).remove(0);
        Engine::open(
            mode,
            StreamConfig::new("t"),
            Arc::new(group),
            fabric,
            OperatorRegistry::new(),
        )
        .unwrap()
    }

    #[test]
    fn wrong_mode_is_rejected() {
        let mut w = open(StepMode::Append);
        assert_eq!(w.mode(), StepMode::Append);
        match w.begin_step(StepMode::Read, None) {
            Err(EngineError::WrongMode {
                expected: StepMode::Append,
                got: StepMode::Read,
            }) => {}
            other => panic!("expected WrongMode, got {other:?}"),
        }
        let mut r = open(StepMode::Read);
        assert!(r.as_writer().is_none());
        assert!(r.as_reader().is_some());
        assert!(matches!(
            r.begin_step(StepMode::Append, None),
            Err(EngineError::WrongMode { .. })
        ));
    }

    #[test]
    fn fresh_engine_is_not_started() {
        let r = open(StepMode::Read);
        assert_eq!(r.state(), StepState::NotStarted);
        assert_eq!(r.current_step(), None);
    }
}
