//! Step-synchronized stream engines.
//!
//! A stream connects a writer group to a reader group through a
//! sequence of steps. Each side brackets its work with
//! `begin_step`/`end_step`:
//!
//! - [`StreamWriter`] stages puts into a step buffer, agrees with its
//!   group on the step's layout, and either publishes the pooled write
//!   pattern (full step) or pushes data straight to the readers at
//!   precomputed offsets (locked step).
//! - [`StreamReader`] waits for each step, resolves its selections
//!   against the write pattern, pulls or receives the bytes it needs,
//!   assembles the requested regions, and reports its own layout back.
//!
//! Both implement [`StepEngine`]; [`Engine`] is the closed set of
//! variants chosen at open time.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod config;
mod coordinator;
pub mod engine;
pub mod error;
mod finalize;
pub mod metrics;
pub mod reader;
pub mod state;
pub mod writer;

pub use config::{ConfigError, EngineKind, StreamConfig};
pub use engine::{Engine, StepEngine};
pub use error::EngineError;
pub use metrics::StepMetrics;
pub use reader::{BlockInfo, GetHandle, StreamReader};
pub use state::{StepMode, StepState, StepStatus};
pub use writer::StreamWriter;
