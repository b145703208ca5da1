//! In-process implementations of [`Collective`] and [`StreamTransport`].
//!
//! Ranks are threads. A [`LocalGroup`] handle is created per rank and
//! shares one gather state with its peers; a [`LocalFabric`] is shared
//! (behind an `Arc`) by every writer and reader thread of a stream.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sluice_core::{Rank, StepId};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::collective::Collective;
use crate::error::CommError;
use crate::transport::{Announcement, Notice, Parcel, Polled, StreamTransport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cv` while `blocked` holds, up to `timeout`.
///
/// Returns the guard and whether the wait gave up with the condition
/// still blocked.
fn wait_while<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Option<Duration>,
    blocked: impl FnMut(&mut T) -> bool,
) -> (MutexGuard<'a, T>, bool) {
    match timeout {
        None => (
            cv.wait_while(guard, blocked)
                .unwrap_or_else(PoisonError::into_inner),
            false,
        ),
        Some(t) => {
            let (guard, result) = cv
                .wait_timeout_while(guard, t, blocked)
                .unwrap_or_else(PoisonError::into_inner);
            (guard, result.timed_out())
        }
    }
}

// ── LocalGroup ─────────────────────────────────────────────────────

struct GatherState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    last: Arc<Vec<Vec<u8>>>,
}

struct GroupShared {
    size: usize,
    timeout: Option<Duration>,
    state: Mutex<GatherState>,
    round_done: Condvar,
}

/// One rank's handle on an in-process process group.
///
/// Collectives are generation-counted rounds: the last rank to arrive
/// publishes the gathered result and opens the next round. A round
/// cannot complete until every rank has consumed the previous one,
/// since each rank must arrive again.
#[derive(Clone)]
pub struct LocalGroup {
    rank: Rank,
    shared: Arc<GroupShared>,
}

impl LocalGroup {
    /// Create handles for a group of `size` ranks, one per rank, with
    /// unbounded waits.
    pub fn create(size: usize) -> Vec<LocalGroup> {
        Self::create_with_timeout(size, None)
    }

    /// Like [`create`](Self::create), but every collective fails with
    /// [`CommError::Timeout`] if a round does not complete in `timeout`.
    /// A timed-out group is unusable afterwards.
    pub fn create_with_timeout(size: usize, timeout: Option<Duration>) -> Vec<LocalGroup> {
        let shared = Arc::new(GroupShared {
            size,
            timeout,
            state: Mutex::new(GatherState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                last: Arc::new(Vec::new()),
            }),
            round_done: Condvar::new(),
        });
        (0..size)
            .map(|r| LocalGroup {
                rank: Rank(r),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, CommError> {
        let shared = &*self.shared;
        let mut st = lock(&shared.state);
        let generation = st.generation;
        st.slots[self.rank.0] = Some(data);
        st.arrived += 1;

        if st.arrived == shared.size {
            let gathered: Vec<Vec<u8>> = st
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            st.last = Arc::new(gathered);
            st.arrived = 0;
            st.generation += 1;
            shared.round_done.notify_all();
            return Ok(st.last.as_ref().clone());
        }

        let (st, timed_out) = wait_while(&shared.round_done, st, shared.timeout, |st| {
            st.generation == generation
        });
        if timed_out {
            return Err(CommError::Timeout {
                waiting_for: "group collective",
            });
        }
        Ok(st.last.as_ref().clone())
    }
}

// ── LocalFabric ────────────────────────────────────────────────────

struct Posted<T> {
    value: T,
    seen: usize,
}

#[derive(Default)]
struct Board {
    announcements: BTreeMap<StepId, Posted<Announcement>>,
    end_at: Option<StepId>,
    notices: BTreeMap<StepId, Posted<Notice>>,
    readers_departed: bool,
    windows: HashMap<(Rank, StepId), Arc<[u8]>>,
}

impl Board {
    fn ended_before(&self, step: StepId) -> bool {
        self.end_at.is_some_and(|end| step >= end)
    }
}

struct Lane {
    tx: Sender<Parcel>,
    rx: Receiver<Parcel>,
}

/// In-process [`StreamTransport`] shared by all ranks of one stream.
///
/// Announcements and notices are kept until every rank of the
/// receiving group has taken them, then dropped. Parcels travel over
/// one unbounded channel per (writer, reader) pair.
pub struct LocalFabric {
    writers: usize,
    readers: usize,
    board: Mutex<Board>,
    changed: Condvar,
    lanes: Vec<Lane>,
}

impl LocalFabric {
    /// Create a fabric connecting `writers` writer ranks to `readers`
    /// reader ranks.
    pub fn new(writers: usize, readers: usize) -> Arc<Self> {
        let lanes = (0..writers * readers)
            .map(|_| {
                let (tx, rx) = crossbeam_channel::unbounded();
                Lane { tx, rx }
            })
            .collect();
        Arc::new(Self {
            writers,
            readers,
            board: Mutex::new(Board::default()),
            changed: Condvar::new(),
            lanes,
        })
    }

    /// Number of windows currently exposed.
    pub fn open_windows(&self) -> usize {
        lock(&self.board).windows.len()
    }

    /// Number of announcements not yet taken by every reader.
    pub fn pending_announcements(&self) -> usize {
        lock(&self.board).announcements.len()
    }

    fn check(rank: Rank, size: usize) -> Result<(), CommError> {
        if rank.0 < size {
            Ok(())
        } else {
            Err(CommError::RankOutOfRange { rank, size })
        }
    }

    fn lane(&self, writer: Rank, reader: Rank) -> Result<&Lane, CommError> {
        Self::check(writer, self.writers)?;
        Self::check(reader, self.readers)?;
        Ok(&self.lanes[writer.0 * self.readers + reader.0])
    }
}

impl std::fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFabric")
            .field("writers", &self.writers)
            .field("readers", &self.readers)
            .finish_non_exhaustive()
    }
}

impl StreamTransport for LocalFabric {
    fn writer_count(&self) -> usize {
        self.writers
    }

    fn reader_count(&self) -> usize {
        self.readers
    }

    fn announce(&self, announcement: Announcement) -> Result<(), CommError> {
        let mut board = lock(&self.board);
        let step = announcement.step;
        if board.ended_before(step) {
            return Err(CommError::ProtocolViolation(format!(
                "step {step} announced after end of stream"
            )));
        }
        if board.announcements.contains_key(&step) {
            return Err(CommError::ProtocolViolation(format!(
                "step {step} announced twice"
            )));
        }
        tracing::trace!(%step, locked = announcement.writers_locked, "announce");
        board.announcements.insert(
            step,
            Posted {
                value: announcement,
                seen: 0,
            },
        );
        self.changed.notify_all();
        Ok(())
    }

    fn announce_end(&self, first_missing: StepId) -> Result<(), CommError> {
        let mut board = lock(&self.board);
        tracing::trace!(step = %first_missing, "announce end of stream");
        board.end_at = Some(first_missing);
        self.changed.notify_all();
        Ok(())
    }

    fn poll_announcement(
        &self,
        reader: Rank,
        step: StepId,
        timeout: Option<Duration>,
    ) -> Result<Polled<Announcement>, CommError> {
        Self::check(reader, self.readers)?;
        let board = lock(&self.board);
        let (mut board, _) = wait_while(&self.changed, board, timeout, |b| {
            !b.announcements.contains_key(&step) && !b.ended_before(step)
        });
        let readers = self.readers;
        if let Some(posted) = board.announcements.get_mut(&step) {
            posted.seen += 1;
            let value = posted.value.clone();
            if posted.seen >= readers {
                board.announcements.remove(&step);
            }
            return Ok(Polled::Ready(value));
        }
        if board.ended_before(step) {
            Ok(Polled::EndOfStream)
        } else {
            Ok(Polled::NotReady)
        }
    }

    fn post_notice(&self, notice: Notice) -> Result<(), CommError> {
        let mut board = lock(&self.board);
        let step = notice.step;
        if board.notices.contains_key(&step) {
            return Err(CommError::ProtocolViolation(format!(
                "notice for step {step} posted twice"
            )));
        }
        tracing::trace!(%step, locked = notice.readers_locked, "post notice");
        board.notices.insert(
            step,
            Posted {
                value: notice,
                seen: 0,
            },
        );
        self.changed.notify_all();
        Ok(())
    }

    fn await_notice(
        &self,
        writer: Rank,
        step: StepId,
        timeout: Option<Duration>,
    ) -> Result<Notice, CommError> {
        Self::check(writer, self.writers)?;
        let board = lock(&self.board);
        let (mut board, _) = wait_while(&self.changed, board, timeout, |b| {
            !b.notices.contains_key(&step) && !b.readers_departed
        });
        let writers = self.writers;
        if let Some(posted) = board.notices.get_mut(&step) {
            posted.seen += 1;
            let value = posted.value.clone();
            if posted.seen >= writers {
                board.notices.remove(&step);
            }
            return Ok(value);
        }
        if board.readers_departed {
            Err(CommError::Disconnected)
        } else {
            Err(CommError::Timeout {
                waiting_for: "step notice",
            })
        }
    }

    fn depart_readers(&self) {
        let mut board = lock(&self.board);
        board.readers_departed = true;
        self.changed.notify_all();
    }

    fn expose(&self, writer: Rank, step: StepId, data: Arc<[u8]>) -> Result<(), CommError> {
        Self::check(writer, self.writers)?;
        let mut board = lock(&self.board);
        if board.windows.contains_key(&(writer, step)) {
            return Err(CommError::ProtocolViolation(format!(
                "writer {writer} exposed step {step} twice"
            )));
        }
        board.windows.insert((writer, step), data);
        Ok(())
    }

    fn fetch(&self, writer: Rank, step: StepId, range: Range<usize>) -> Result<Vec<u8>, CommError> {
        let board = lock(&self.board);
        let data = board
            .windows
            .get(&(writer, step))
            .ok_or(CommError::WindowUnavailable { writer, step })?;
        data.get(range.clone()).map(<[u8]>::to_vec).ok_or_else(|| {
            CommError::ProtocolViolation(format!(
                "fetch {range:?} outside window of {} bytes",
                data.len()
            ))
        })
    }

    fn retire(&self, writer: Rank, step: StepId) {
        lock(&self.board).windows.remove(&(writer, step));
    }

    fn send(&self, writer: Rank, reader: Rank, parcel: Parcel) -> Result<(), CommError> {
        self.lane(writer, reader)?
            .tx
            .send(parcel)
            .map_err(|_| CommError::Disconnected)
    }

    fn recv(
        &self,
        reader: Rank,
        writer: Rank,
        timeout: Option<Duration>,
    ) -> Result<Parcel, CommError> {
        let lane = self.lane(writer, reader)?;
        match timeout {
            None => lane.rx.recv().map_err(|_| CommError::Disconnected),
            Some(t) => lane.rx.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => CommError::Timeout {
                    waiting_for: "parcel",
                },
                RecvTimeoutError::Disconnected => CommError::Disconnected,
            }),
        }
    }
}

// Compile-time assertions: handles cross thread boundaries.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<LocalGroup>();
    assert::<LocalFabric>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn run_group<T: Send>(n: usize, f: impl Fn(LocalGroup) -> T + Sync) -> Vec<T> {
        let handles = LocalGroup::create(n);
        thread::scope(|s| {
            let joins: Vec<_> = handles
                .into_iter()
                .map(|h| {
                    let f = &f;
                    s.spawn(move || f(h))
                })
                .collect();
            joins.into_iter().map(|j| j.join().unwrap()).collect()
        })
    }

    #[test]
    fn all_gather_orders_by_rank() {
        let results = run_group(4, |g| g.all_gather(vec![g.rank().0 as u8; 2]).unwrap());
        for r in results {
            assert_eq!(r, vec![vec![0, 0], vec![1, 1], vec![2, 2], vec![3, 3]]);
        }
    }

    #[test]
    fn rounds_do_not_interleave() {
        let results = run_group(3, |g| {
            (0..50u8)
                .map(|round| {
                    let all = g.all_gather(vec![round]).unwrap();
                    all.iter().all(|v| v == &vec![round])
                })
                .all(|ok| ok)
        });
        assert!(results.into_iter().all(|ok| ok));
    }

    #[test]
    fn derived_collectives() {
        let results = run_group(3, |g| {
            let b = g.broadcast(vec![g.rank().0 as u8 + 10], Rank(1)).unwrap();
            let m = g.all_reduce_max(g.rank().0 as u64 * 7).unwrap();
            let all = g.all_true(g.rank() != Rank(2)).unwrap();
            g.barrier().unwrap();
            (b, m, all)
        });
        for (b, m, all) in results {
            assert_eq!(b, vec![11]);
            assert_eq!(m, 14);
            assert!(!all);
        }
    }

    #[test]
    fn broadcast_rejects_bad_root() {
        let g = LocalGroup::create(1).remove(0);
        assert_eq!(
            g.broadcast(vec![], Rank(4)),
            Err(CommError::RankOutOfRange {
                rank: Rank(4),
                size: 1
            })
        );
    }

    #[test]
    fn collective_times_out_without_peers() {
        let g = LocalGroup::create_with_timeout(2, Some(Duration::from_millis(20))).remove(0);
        assert!(matches!(g.barrier(), Err(CommError::Timeout { .. })));
    }

    fn announcement(step: u64) -> Announcement {
        Announcement {
            step: StepId(step),
            writers_locked: false,
            pattern: Some(Arc::from(&b"[]"[..])),
        }
    }

    #[test]
    fn poll_is_not_ready_then_ready() {
        let fabric = LocalFabric::new(1, 2);
        assert_eq!(
            fabric
                .poll_announcement(Rank(0), StepId(0), Some(Duration::ZERO))
                .unwrap(),
            Polled::NotReady
        );
        fabric.announce(announcement(0)).unwrap();
        for r in 0..2 {
            match fabric.poll_announcement(Rank(r), StepId(0), None).unwrap() {
                Polled::Ready(a) => assert_eq!(a.step, StepId(0)),
                other => panic!("expected Ready, got {other:?}"),
            }
        }
        assert_eq!(fabric.pending_announcements(), 0);
    }

    #[test]
    fn end_of_stream_wakes_long_poll() {
        let fabric = LocalFabric::new(1, 1);
        let started = Instant::now();
        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                fabric.announce_end(StepId(0)).unwrap();
            });
            let polled = fabric
                .poll_announcement(Rank(0), StepId(0), Some(Duration::from_secs(30)))
                .unwrap();
            assert_eq!(polled, Polled::EndOfStream);
        });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn announce_after_end_is_violation() {
        let fabric = LocalFabric::new(1, 1);
        fabric.announce_end(StepId(2)).unwrap();
        assert!(fabric.announce(announcement(1)).is_ok());
        assert!(matches!(
            fabric.announce(announcement(2)),
            Err(CommError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn notices_reach_every_writer_then_drop() {
        let fabric = LocalFabric::new(2, 1);
        fabric
            .post_notice(Notice {
                step: StepId(3),
                readers_locked: true,
                pattern: None,
            })
            .unwrap();
        for w in 0..2 {
            let n = fabric.await_notice(Rank(w), StepId(3), None).unwrap();
            assert!(n.readers_locked);
        }
        assert!(matches!(
            fabric.await_notice(Rank(0), StepId(3), Some(Duration::from_millis(5))),
            Err(CommError::Timeout { .. })
        ));
        fabric.depart_readers();
        assert_eq!(
            fabric.await_notice(Rank(0), StepId(4), None),
            Err(CommError::Disconnected)
        );
    }

    #[test]
    fn windows_expose_fetch_retire() {
        let fabric = LocalFabric::new(1, 1);
        fabric
            .expose(Rank(0), StepId(0), Arc::from(&[1u8, 2, 3, 4][..]))
            .unwrap();
        assert_eq!(fabric.fetch(Rank(0), StepId(0), 1..3).unwrap(), vec![2, 3]);
        assert!(matches!(
            fabric.fetch(Rank(0), StepId(0), 2..9),
            Err(CommError::ProtocolViolation(_))
        ));
        fabric.retire(Rank(0), StepId(0));
        assert_eq!(fabric.open_windows(), 0);
        assert_eq!(
            fabric.fetch(Rank(0), StepId(0), 0..1),
            Err(CommError::WindowUnavailable {
                writer: Rank(0),
                step: StepId(0)
            })
        );
    }

    #[test]
    fn parcels_travel_per_lane() {
        let fabric = LocalFabric::new(2, 2);
        let parcel = Parcel {
            step: StepId(1),
            offset: 7,
            payload: Arc::from(&[9u8][..]),
        };
        fabric.send(Rank(1), Rank(0), parcel.clone()).unwrap();
        assert!(matches!(
            fabric.recv(Rank(0), Rank(0), Some(Duration::from_millis(5))),
            Err(CommError::Timeout { .. })
        ));
        assert_eq!(fabric.recv(Rank(0), Rank(1), None).unwrap(), parcel);
        assert!(matches!(
            fabric.send(Rank(2), Rank(0), parcel),
            Err(CommError::RankOutOfRange { .. })
        ));
    }
}
