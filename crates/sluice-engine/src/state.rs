//! Step state machine vocabulary.

use std::fmt;

/// Lifecycle state of an engine.
///
/// ```text
/// NotStarted --begin_step--> InStep --end_step--> NotStarted
///      \                        \
///       `------- close -------> Closed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepState {
    /// Between steps (or before the first one).
    NotStarted,
    /// Inside a `begin_step`/`end_step` bracket.
    InStep,
    /// Closed; every further operation fails.
    Closed,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotStarted => "not started",
            Self::InStep => "in step",
            Self::Closed => "closed",
        })
    }
}

/// Outcome of `begin_step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepStatus {
    /// A step is open.
    Ok,
    /// The next step has not been published yet. State is unchanged.
    NotReady,
    /// The writers closed the stream. No step will follow.
    EndOfStream,
}

/// Direction requested from `begin_step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StepMode {
    /// Writer step.
    Append,
    /// Reader step.
    Read,
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Append => "append",
            Self::Read => "read",
        })
    }
}
