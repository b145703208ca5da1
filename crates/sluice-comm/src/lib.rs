//! Communication seams for the Sluice streaming middleware.
//!
//! The step protocol never talks to a network directly. It is written
//! against three narrow traits:
//!
//! - [`Collective`]: gather/broadcast/reduce/barrier within one process
//!   group (all writers, or all readers).
//! - [`StreamTransport`]: everything that crosses from the writer group
//!   to the reader group: per-step announcements and notices, one-sided
//!   windows over writer buffers, and two-sided parcels.
//! - [`Operator`]: payload compression, looked up by name in an
//!   [`OperatorRegistry`].
//!
//! [`LocalGroup`] and [`LocalFabric`] implement the first two for
//! threads within one process; they carry the test suite and make the
//! protocol usable without a cluster.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod collective;
pub mod error;
pub mod local;
pub mod operator;
pub mod transport;
pub mod window;

pub use collective::Collective;
pub use error::{CommError, OperatorError};
pub use local::{LocalFabric, LocalGroup};
pub use operator::{Operator, OperatorParams, OperatorRegistry};
pub use transport::{Announcement, Notice, Parcel, Polled, StreamTransport};
pub use window::TransferWindow;
