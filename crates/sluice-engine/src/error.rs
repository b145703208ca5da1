//! Error type for stream engine operations.

use sluice_comm::{CommError, OperatorError};
use sluice_core::{DataType, Rank, StepId};
use sluice_pattern::PatternError;
use sluice_select::SelectionError;
use std::error::Error;
use std::fmt;

use crate::config::ConfigError;
use crate::state::{StepMode, StepState};

/// Errors from [`StreamWriter`](crate::StreamWriter) and
/// [`StreamReader`](crate::StreamReader).
#[derive(Clone, Debug, PartialEq)]
pub enum EngineError {
    /// The configuration failed validation.
    Config(ConfigError),
    /// The operation is not legal in the engine's current state.
    InvalidState {
        /// Operation attempted.
        op: &'static str,
        /// State the engine was in.
        state: StepState,
    },
    /// `begin_step` was called with the other side's mode.
    WrongMode {
        /// Mode this engine accepts.
        expected: StepMode,
        /// Mode requested.
        got: StepMode,
    },
    /// A selection or put region is malformed.
    InvalidArgument(SelectionError),
    /// A put or definition names a variable that was never defined.
    UnknownVariable {
        /// Variable name.
        name: String,
    },
    /// A variable was redefined, or used with a different element type.
    DefinitionMismatch {
        /// Variable name.
        name: String,
        /// Element type the variable was defined with.
        defined: DataType,
        /// Element type supplied.
        got: DataType,
    },
    /// A data slice does not match its region.
    SizeMismatch {
        /// Variable name.
        name: String,
        /// Elements implied by the region.
        expected: usize,
        /// Elements supplied.
        got: usize,
    },
    /// The request is valid but outside what a stream can serve.
    Unsupported {
        /// What was asked for.
        what: String,
    },
    /// A deferred-get handle does not belong to this step.
    StaleHandle {
        /// Handle id.
        id: u64,
    },
    /// Pattern resolution failed during a step.
    Protocol {
        /// Step during which the failure was detected.
        step: StepId,
        /// Rank that detected it.
        rank: Rank,
        /// Underlying pattern error.
        source: PatternError,
    },
    /// The transport or a collective failed during a step.
    Comm {
        /// Step during which the failure was detected.
        step: StepId,
        /// Rank that detected it.
        rank: Rank,
        /// Underlying transport error.
        source: CommError,
    },
    /// A payload operator failed.
    Operator(OperatorError),
    /// The finalize thread could not be spawned.
    ThreadSpawnFailed {
        /// OS error message.
        reason: String,
    },
    /// The finalize thread panicked.
    ThreadPanicked,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {e}"),
            Self::InvalidState { op, state } => write!(f, "{op} is not allowed while {state}"),
            Self::WrongMode { expected, got } => {
                write!(f, "engine only steps in {expected} mode, got {got}")
            }
            Self::InvalidArgument(e) => write!(f, "invalid argument: {e}"),
            Self::UnknownVariable { name } => write!(f, "variable '{name}' is not defined"),
            Self::DefinitionMismatch { name, defined, got } => {
                write!(f, "variable '{name}' is defined as {defined}, got {got}")
            }
            Self::SizeMismatch {
                name,
                expected,
                got,
            } => write!(f, "'{name}': region holds {expected} elements, got {got}"),
            Self::Unsupported { what } => write!(f, "unsupported: {what}"),
            Self::StaleHandle { id } => write!(f, "get handle {id} is not pending in this step"),
            Self::Protocol { step, rank, source } => {
                write!(f, "step {step}, rank {rank}: {source}")
            }
            Self::Comm { step, rank, source } => write!(f, "step {step}, rank {rank}: {source}"),
            Self::Operator(e) => write!(f, "{e}"),
            Self::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn finalize thread: {reason}")
            }
            Self::ThreadPanicked => write!(f, "finalize thread panicked"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::InvalidArgument(e) => Some(e),
            Self::Protocol { source, .. } => Some(source),
            Self::Comm { source, .. } => Some(source),
            Self::Operator(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SelectionError> for EngineError {
    fn from(e: SelectionError) -> Self {
        Self::InvalidArgument(e)
    }
}

impl From<OperatorError> for EngineError {
    fn from(e: OperatorError) -> Self {
        Self::Operator(e)
    }
}

/// Step and rank context for lifting transport and pattern errors.
#[derive(Clone, Copy, Debug)]
pub(crate) struct At {
    pub step: StepId,
    pub rank: Rank,
}

impl At {
    pub fn comm(self, source: CommError) -> EngineError {
        EngineError::Comm {
            step: self.step,
            rank: self.rank,
            source,
        }
    }

    pub fn protocol(self, source: PatternError) -> EngineError {
        EngineError::Protocol {
            step: self.step,
            rank: self.rank,
            source,
        }
    }
}
