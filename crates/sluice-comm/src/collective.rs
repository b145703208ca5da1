//! Collective operations within one process group.

use sluice_core::Rank;

use crate::error::CommError;

/// A fixed group of cooperating ranks.
///
/// Every rank of the group must enter each collective in the same
/// order. Only [`all_gather`](Collective::all_gather) is required; the
/// other collectives are built on it.
pub trait Collective: Send + Sync {
    /// This rank's position in the group.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Contribute `data` and receive every rank's contribution, indexed
    /// by rank.
    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError>;

    /// Receive `root`'s `data` on every rank. Non-root payloads are
    /// ignored.
    fn broadcast(&self, data: Vec<u8>, root: Rank) -> Result<Vec<u8>, CommError> {
        if root.0 >= self.size() {
            return Err(CommError::RankOutOfRange {
                rank: root,
                size: self.size(),
            });
        }
        let mine = if self.rank() == root { data } else { Vec::new() };
        let mut all = self.all_gather(mine)?;
        Ok(std::mem::take(&mut all[root.0]))
    }

    /// Maximum of `value` across the group.
    fn all_reduce_max(&self, value: u64) -> Result<u64, CommError> {
        let all = self.all_gather(value.to_le_bytes().to_vec())?;
        all.iter().try_fold(0u64, |acc, bytes| -> Result<u64, CommError> {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                CommError::ProtocolViolation(format!(
                    "reduction payload of {} bytes",
                    bytes.len()
                ))
            })?;
            Ok(acc.max(u64::from_le_bytes(raw)))
        })
    }

    /// Whether `flag` holds on every rank.
    fn all_true(&self, flag: bool) -> Result<bool, CommError> {
        Ok(self.all_reduce_max(u64::from(!flag))? == 0)
    }

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(Vec::new()).map(|_| ())
    }
}
