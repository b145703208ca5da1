//! The writer-group ↔ reader-group transport.
//!
//! Per step the two groups exchange exactly two metadata messages:
//!
//! 1. writer rank 0 posts an [`Announcement`] (the step exists; here is
//!    the pooled write pattern, unless the layout is locked);
//! 2. reader rank 0 posts a [`Notice`] once every reader has finished
//!    the step (here is the pooled read pattern, unless unchanged).
//!
//! Data moves either one-sided, with readers fetching from windows
//! the writers expose over their step buffers, or two-sided, with
//! writers pushing [`Parcel`]s at precomputed offsets when the layout is
//! locked.

use sluice_core::{Rank, StepId};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CommError;

/// Writer-group message opening a step for readers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announcement {
    /// Step being published.
    pub step: StepId,
    /// Whether every writer kept its layout locked. When set, data was
    /// pushed as parcels and `pattern` is absent.
    pub writers_locked: bool,
    /// Encoded pooled write pattern, for full steps.
    pub pattern: Option<Arc<[u8]>>,
}

/// Reader-group message closing a step for writers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    /// Step the readers finished.
    pub step: StepId,
    /// Whether every reader kept its request layout locked.
    pub readers_locked: bool,
    /// Encoded pooled read pattern, when it changed or the step was full.
    pub pattern: Option<Arc<[u8]>>,
}

/// One writer's step buffer pushed to one reader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parcel {
    /// Step the bytes belong to.
    pub step: StepId,
    /// Where the writer believes the bytes belong in the reader's
    /// receive buffer.
    pub offset: usize,
    /// The writer's whole step buffer.
    pub payload: Arc<[u8]>,
}

/// Result of polling for a step announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Polled<T> {
    /// The step was published.
    Ready(T),
    /// Nothing yet; try again later.
    NotReady,
    /// The writers closed the stream before this step.
    EndOfStream,
}

/// Cross-group transport between a writer group and a reader group.
///
/// Implementations must be shareable between all ranks of both groups;
/// every method names the rank(s) it acts for. `timeout = None` waits
/// indefinitely and `Some(Duration::ZERO)` never blocks.
pub trait StreamTransport: Send + Sync {
    /// Number of writer ranks.
    fn writer_count(&self) -> usize;

    /// Number of reader ranks.
    fn reader_count(&self) -> usize;

    /// Publish a step to every reader.
    fn announce(&self, announcement: Announcement) -> Result<(), CommError>;

    /// No step at or after `first_missing` will ever be announced.
    fn announce_end(&self, first_missing: StepId) -> Result<(), CommError>;

    /// Wait for the announcement of `step`, as seen by `reader`.
    fn poll_announcement(
        &self,
        reader: Rank,
        step: StepId,
        timeout: Option<Duration>,
    ) -> Result<Polled<Announcement>, CommError>;

    /// Publish the reader group's notice for a finished step.
    fn post_notice(&self, notice: Notice) -> Result<(), CommError>;

    /// Wait for the readers' notice for `step`, as seen by `writer`.
    ///
    /// Fails with [`CommError::Disconnected`] once the readers have left.
    fn await_notice(
        &self,
        writer: Rank,
        step: StepId,
        timeout: Option<Duration>,
    ) -> Result<Notice, CommError>;

    /// The reader group is leaving; no further notices will come.
    fn depart_readers(&self);

    /// Expose `writer`'s step buffer for one-sided access.
    fn expose(&self, writer: Rank, step: StepId, data: Arc<[u8]>) -> Result<(), CommError>;

    /// One-sided read of `range` from `writer`'s exposed buffer.
    fn fetch(&self, writer: Rank, step: StepId, range: Range<usize>) -> Result<Vec<u8>, CommError>;

    /// Withdraw a window. Retiring an absent window is a no-op.
    fn retire(&self, writer: Rank, step: StepId);

    /// Push a parcel from `writer` to `reader`.
    fn send(&self, writer: Rank, reader: Rank, parcel: Parcel) -> Result<(), CommError>;

    /// Receive the next parcel from `writer` at `reader`.
    fn recv(
        &self,
        reader: Rank,
        writer: Rank,
        timeout: Option<Duration>,
    ) -> Result<Parcel, CommError>;
}
