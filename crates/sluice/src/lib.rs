//! Sluice: step-based staging of n-dimensional scientific arrays
//! between a group of writer ranks and a group of reader ranks.
//!
//! This is the top-level facade crate that re-exports the public API
//! from all Sluice sub-crates. For most users, adding `sluice` as a
//! single dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use sluice::prelude::*;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let fabric = LocalFabric::new(1, 1);
//! let config = StreamConfig::new("quick-start");
//!
//! let mut writer = StreamWriter::open(
//!     config.clone(),
//!     Arc::new(LocalGroup::create(1).remove(0)),
//!     fabric.clone(),
//! )
//! .unwrap();
//! let mut reader = StreamReader::open(
//!     config,
//!     Arc::new(LocalGroup::create(1).remove(0)),
//!     fabric,
//! )
//! .unwrap();
//!
//! let producer = thread::spawn(move || {
//!     writer.define_variable("x", DataType::Float64, &[4]).unwrap();
//!     writer.begin_step().unwrap();
//!     writer.put_sync("x", &[0], &[4], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
//!     writer.end_step().unwrap();
//!     writer.close().unwrap();
//! });
//!
//! assert_eq!(reader.begin_step(None).unwrap(), StepStatus::Ok);
//! let sel = Selection::bounding_box(&[1], &[2]).unwrap();
//! let got: Vec<f64> = reader.get_sync("x", &sel).unwrap();
//! assert_eq!(got, vec![2.0, 3.0]);
//! reader.end_step().unwrap();
//! assert_eq!(reader.begin_step(None).unwrap(), StepStatus::EndOfStream);
//! reader.close().unwrap();
//! producer.join().unwrap();
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `sluice-core` | Boxes, the n-d copy kernel, data types, IDs |
//! | [`select`] | `sluice-select` | Selections, stencils, strided resampling |
//! | [`pattern`] | `sluice-pattern` | Write/read patterns, overlap resolution |
//! | [`comm`] | `sluice-comm` | Collectives, transports, windows, operators |
//! | [`engine`] | `sluice-engine` | Writer and reader step engines |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and IDs (`sluice-core`).
///
/// Contains [`types::BoxRegion`], the row-major [`types::nd_copy`]
/// kernel, [`types::DataType`], and the [`types::Rank`] and
/// [`types::StepId`] identifiers.
pub use sluice_core as types;

/// Selections and strided resampling (`sluice-select`).
///
/// Build [`select::Selection`]s, attach a [`select::Stencil`], and
/// compile them into [`select::StencilPlan`]s.
pub use sluice_select as select;

/// Pattern descriptors and overlap resolution (`sluice-pattern`).
pub use sluice_pattern as pattern;

/// Communication seams (`sluice-comm`).
///
/// The [`comm::Collective`] and [`comm::StreamTransport`] traits, with
/// in-process implementations [`comm::LocalGroup`] and
/// [`comm::LocalFabric`].
pub use sluice_comm as comm;

/// Step engines (`sluice-engine`).
///
/// [`engine::StreamWriter`] on the writer side, [`engine::StreamReader`]
/// on the reader side, and [`engine::Engine`] when the mode is chosen
/// at open time.
pub use sluice_engine as engine;

/// Common imports for typical Sluice usage.
///
/// ```rust
/// use sluice::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use sluice_core::{DataType, Element, Rank, StepId};

    // Selection
    pub use sluice_select::{Selection, SelectionError, Stencil};

    // Patterns
    pub use sluice_pattern::{AttributeValue, Attributes};

    // Communication
    pub use sluice_comm::{
        Collective, LocalFabric, LocalGroup, Operator, OperatorRegistry, StreamTransport,
    };

    // Engine
    pub use sluice_engine::{
        Engine, EngineError, EngineKind, StepEngine, StepMetrics, StepMode, StepState,
        StepStatus, StreamConfig, StreamReader, StreamWriter,
    };
}
