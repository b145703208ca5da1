//! Scoped one-sided transfer windows.

use sluice_core::{Rank, StepId};
use std::fmt;
use std::sync::Arc;

use crate::error::CommError;
use crate::transport::StreamTransport;

/// A writer's step buffer exposed for one-sided reads.
///
/// The window is retired exactly once: by [`release`](Self::release),
/// or on drop, which covers every early-return and error path.
pub struct TransferWindow {
    transport: Arc<dyn StreamTransport>,
    writer: Rank,
    step: StepId,
    len: usize,
    released: bool,
}

impl TransferWindow {
    /// Expose `data` as `writer`'s window for `step`.
    pub fn expose(
        transport: Arc<dyn StreamTransport>,
        writer: Rank,
        step: StepId,
        data: Arc<[u8]>,
    ) -> Result<Self, CommError> {
        let len = data.len();
        transport.expose(writer, step, data)?;
        tracing::trace!(%writer, %step, len, "window exposed");
        Ok(Self {
            transport,
            writer,
            step,
            len,
            released: false,
        })
    }

    /// Step the window belongs to.
    pub fn step(&self) -> StepId {
        self.step
    }

    /// Exposed byte count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the exposed buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Retire the window now.
    pub fn release(mut self) {
        self.retire();
    }

    fn retire(&mut self) {
        if !self.released {
            self.released = true;
            self.transport.retire(self.writer, self.step);
            tracing::trace!(writer = %self.writer, step = %self.step, "window retired");
        }
    }
}

impl Drop for TransferWindow {
    fn drop(&mut self) {
        self.retire();
    }
}

impl fmt::Debug for TransferWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferWindow")
            .field("writer", &self.writer)
            .field("step", &self.step)
            .field("len", &self.len)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFabric;

    #[test]
    fn drop_retires() {
        let fabric = LocalFabric::new(1, 1);
        {
            let w = TransferWindow::expose(
                fabric.clone(),
                Rank(0),
                StepId(0),
                Arc::from(&[1u8][..]),
            )
            .unwrap();
            assert_eq!(w.len(), 1);
            assert_eq!(fabric.open_windows(), 1);
        }
        assert_eq!(fabric.open_windows(), 0);
    }

    #[test]
    fn release_retires_once() {
        let fabric = LocalFabric::new(1, 1);
        let w = TransferWindow::expose(fabric.clone(), Rank(0), StepId(5), Arc::from(&[][..]))
            .unwrap();
        assert!(w.is_empty());
        w.release();
        assert_eq!(fabric.open_windows(), 0);
        // A fresh window for the same step is allowed after release.
        let again = TransferWindow::expose(fabric.clone(), Rank(0), StepId(5), Arc::from(&[][..]));
        assert!(again.is_ok());
    }

    #[test]
    fn failed_expose_leaves_nothing_behind() {
        let fabric = LocalFabric::new(1, 1);
        let bad = TransferWindow::expose(fabric.clone(), Rank(3), StepId(0), Arc::from(&[][..]));
        assert!(matches!(bad, Err(CommError::RankOutOfRange { .. })));
        assert_eq!(fabric.open_windows(), 0);
    }
}
