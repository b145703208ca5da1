//! Strongly-typed identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a process within its group (writer group or reader group).
///
/// Ranks are dense: a group of size `n` has ranks `0..n`. Rank order is
/// the canonical order used for buffer positioning, so two processes that
/// agree on a set of ranks also agree on every byte offset derived from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rank(pub usize);

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for Rank {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

/// Monotonically increasing step counter.
///
/// Step 0 is the first step of a stream. Writers and readers advance the
/// counter in lockstep, one `begin_step`/`end_step` pair at a time.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl StepId {
    /// The step following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StepId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_id_advances() {
        assert_eq!(StepId(0).next(), StepId(1));
        assert_eq!(StepId::default(), StepId(0));
    }

    #[test]
    fn rank_orders_numerically() {
        let mut ranks = vec![Rank(3), Rank(0), Rank(2)];
        ranks.sort();
        assert_eq!(ranks, vec![Rank(0), Rank(2), Rank(3)]);
        assert_eq!(Rank::from(5).to_string(), "5");
    }
}
