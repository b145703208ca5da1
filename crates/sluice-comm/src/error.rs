//! Error types for collectives, transports, and operators.

use sluice_core::{Rank, StepId};
use std::error::Error;
use std::fmt;

/// Errors from [`Collective`](crate::Collective) and
/// [`StreamTransport`](crate::StreamTransport) operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommError {
    /// The peer group has gone away.
    Disconnected,
    /// A bounded wait expired.
    Timeout {
        /// What was being waited for.
        waiting_for: &'static str,
    },
    /// A rank outside the group was addressed.
    RankOutOfRange {
        /// The offending rank.
        rank: Rank,
        /// Size of the group.
        size: usize,
    },
    /// No window is exposed for this writer and step.
    WindowUnavailable {
        /// Writer that should have exposed it.
        writer: Rank,
        /// Step it should belong to.
        step: StepId,
    },
    /// A peer sent something the protocol does not allow.
    ProtocolViolation(String),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "peer group disconnected"),
            Self::Timeout { waiting_for } => write!(f, "timed out waiting for {waiting_for}"),
            Self::RankOutOfRange { rank, size } => {
                write!(f, "rank {rank} out of range for group of {size}")
            }
            Self::WindowUnavailable { writer, step } => {
                write!(f, "no window exposed by writer {writer} for step {step}")
            }
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
        }
    }
}

impl Error for CommError {}

/// Errors from payload operators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorError {
    /// No operator registered under this name.
    Unknown {
        /// Requested operator name.
        name: String,
    },
    /// A parameter is missing or malformed.
    InvalidParameter {
        /// Operator name.
        name: String,
        /// Parameter key.
        key: String,
    },
    /// The operator rejected its input.
    Failed {
        /// Operator name.
        name: String,
        /// Human-readable cause.
        reason: String,
    },
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown { name } => write!(f, "unknown operator '{name}'"),
            Self::InvalidParameter { name, key } => {
                write!(f, "operator '{name}': invalid parameter '{key}'")
            }
            Self::Failed { name, reason } => write!(f, "operator '{name}' failed: {reason}"),
        }
    }
}

impl Error for OperatorError {}
