//! Byte positions inside a reader's flat receive buffer.
//!
//! A reader's receive buffer is the concatenation, in ascending writer
//! rank, of the complete step buffers of every writer it overlaps. Each
//! writer's buffer is its block payloads plus one leading control byte,
//! so positions follow from the write pattern alone:
//!
//! ```text
//! reader 0 overlaps writers {0, 2}
//! | w0: ctl + payload | w2: ctl + payload |
//! 0                   len(w0)             len(w0) + len(w2)
//! ```
//!
//! Writers run the same walk for every reader they feed and keep only
//! their own entry, which is why no offsets ever need to be exchanged.

use sluice_core::Rank;

use crate::descriptor::{ReadPattern, ReadRequest, WritePattern};
use crate::error::PatternError;
use crate::overlap::{readers_for, writer_set, writers_for};

/// "Move `byte_length` bytes between this rank and `peer`, at
/// `buffer_offset` of the reader's receive buffer."
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OverlapAssignment {
    /// The other side of the transfer.
    pub peer: Rank,
    /// Offset in the reader's receive buffer.
    pub buffer_offset: usize,
    /// Bytes to move.
    pub byte_length: usize,
}

impl OverlapAssignment {
    /// One past the last byte covered.
    pub fn end(&self) -> usize {
        self.buffer_offset + self.byte_length
    }
}

/// Reader side: one assignment per overlapping writer, ascending rank.
///
/// Fails if any request is fatally unresolvable against `writes`
/// (type mismatch, missing block, unknown variable).
pub fn reader_positions(
    writes: &WritePattern,
    requests: &[ReadRequest],
) -> Result<Vec<OverlapAssignment>, PatternError> {
    for req in requests {
        writers_for(writes, req)?;
    }
    let mut position = 0;
    Ok(writer_set(writes, requests)
        .into_iter()
        .map(|w| {
            let byte_length = writes.payload_len(w);
            let a = OverlapAssignment {
                peer: w,
                buffer_offset: position,
                byte_length,
            };
            position += byte_length;
            a
        })
        .collect())
}

/// Total receive buffer size implied by a set of reader assignments.
pub fn receive_len(assignments: &[OverlapAssignment]) -> usize {
    assignments.iter().map(OverlapAssignment::end).max().unwrap_or(0)
}

/// Writer side: for every reader needing `me`'s data, where `me`'s
/// buffer lands in that reader's receive buffer.
pub fn writer_positions(
    writes: &WritePattern,
    me: Rank,
    reads: &ReadPattern,
) -> Vec<OverlapAssignment> {
    readers_for(writes.rank(me), reads)
        .into_iter()
        .filter_map(|reader| {
            let mut position = 0;
            for w in writer_set(writes, reads.rank(reader)) {
                let len = writes.payload_len(w);
                if w == me {
                    return Some(OverlapAssignment {
                        peer: reader,
                        buffer_offset: position,
                        byte_length: len,
                    });
                }
                position += len;
            }
            None
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::fixtures::*;
    use crate::descriptor::WriteBlock;
    use proptest::prelude::*;

    fn scenario() -> (WritePattern, ReadPattern) {
        let writes = WritePattern::from_ranks(vec![
            vec![block("u", &[0, 0], &[5, 5], &[10, 5])],
            vec![block("u", &[5, 0], &[5, 5], &[10, 5])],
        ]);
        let reads = ReadPattern::from_ranks(vec![vec![request("u", &[3, 0], &[4, 5])]]);
        (writes, reads)
    }

    #[test]
    fn reader_walks_writers_in_rank_order() {
        let (writes, reads) = scenario();
        let a = reader_positions(&writes, reads.rank(Rank(0))).unwrap();
        assert_eq!(
            a,
            vec![
                OverlapAssignment {
                    peer: Rank(0),
                    buffer_offset: 0,
                    byte_length: 201
                },
                OverlapAssignment {
                    peer: Rank(1),
                    buffer_offset: 201,
                    byte_length: 201
                },
            ]
        );
        assert_eq!(receive_len(&a), 402);
    }

    #[test]
    fn writer_and_reader_agree() {
        let (writes, reads) = scenario();
        let reader = reader_positions(&writes, reads.rank(Rank(0))).unwrap();
        for w in 0..2 {
            let mine = writer_positions(&writes, Rank(w), &reads);
            assert_eq!(mine.len(), 1);
            assert_eq!(mine[0].peer, Rank(0));
            assert_eq!(mine[0].buffer_offset, reader[w].buffer_offset);
            assert_eq!(mine[0].byte_length, reader[w].byte_length);
        }
    }

    #[test]
    fn non_overlapping_writer_gets_no_slot() {
        let writes = row_pattern(3, 10);
        let reads = ReadPattern::from_ranks(vec![vec![request("x", &[22], &[3])]]);
        assert!(writer_positions(&writes, Rank(0), &reads).is_empty());
        let a = reader_positions(&writes, reads.rank(Rank(0))).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!((a[0].peer, a[0].buffer_offset), (Rank(2), 0));
    }

    #[test]
    fn reader_errors_propagate() {
        let writes = row_pattern(1, 4);
        let mut req = request("x", &[0], &[4]);
        req.block_id = Some(7);
        assert!(matches!(
            reader_positions(&writes, &[req]),
            Err(PatternError::LayoutConflict { .. })
        ));
    }

    fn arb_layout() -> impl Strategy<Value = (WritePattern, ReadPattern)> {
        let writers = proptest::collection::vec(1usize..6, 1..5);
        let readers = proptest::collection::vec((0usize..20, 1usize..8), 1..4);
        (writers, readers).prop_map(|(lens, reqs)| {
            let total: usize = lens.iter().sum();
            let mut offset = 0;
            let blocks: Vec<Vec<WriteBlock>> = lens
                .iter()
                .map(|&len| {
                    let b = block("x", &[offset], &[len], &[total]);
                    offset += len;
                    vec![b]
                })
                .collect();
            let requests = reqs
                .into_iter()
                .map(|(s, c)| {
                    let s = s % total;
                    vec![request("x", &[s], &[c.min(total - s)])]
                })
                .collect();
            (WritePattern::from_ranks(blocks), ReadPattern::from_ranks(requests))
        })
    }

    proptest! {
        #[test]
        fn positions_are_deterministic_and_consistent((writes, reads) in arb_layout()) {
            for (reader, requests) in reads.iter() {
                let first = reader_positions(&writes, requests).unwrap();
                let again = reader_positions(&writes, requests).unwrap();
                prop_assert_eq!(&first, &again);

                // Contiguous, ascending, non-overlapping.
                let mut expected_offset = 0;
                for a in &first {
                    prop_assert_eq!(a.buffer_offset, expected_offset);
                    expected_offset = a.end();
                }

                // Evaluate writers in reverse: every writer finds the
                // slot the reader computed.
                for w in (0..writes.writer_count()).rev() {
                    let mine = writer_positions(&writes, Rank(w), &reads);
                    let slot = mine.iter().find(|a| a.peer == reader);
                    let expected = first.iter().find(|a| a.peer == Rank(w));
                    match (slot, expected) {
                        (Some(s), Some(e)) => {
                            prop_assert_eq!(s.buffer_offset, e.buffer_offset);
                            prop_assert_eq!(s.byte_length, e.byte_length);
                        }
                        (None, None) => {}
                        _ => prop_assert!(false, "writer {} and reader {} disagree", w, reader),
                    }
                }
            }
        }
    }
}
