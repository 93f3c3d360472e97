// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Priority scheduling of write-blocked streams.
//!
//! Streams that have data to send register here and are handed back to the
//! connection one at a time, ordered by urgency (lower is more urgent),
//! with static streams (control, headers) always ahead of everything else.
//! Within one urgency class, ordering is first-come-first-served, with a
//! batching rule that lets the stream currently being drained keep the
//! head of the line until it has written a batch worth of bytes
//! (non-incremental streams keep it until they run out of data entirely).

use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::Arc;

use intrusive_collections::intrusive_adapter;
use intrusive_collections::KeyAdapter;
use intrusive_collections::RBTree;
use intrusive_collections::RBTreeAtomicLink;

use smallvec::SmallVec;

use crate::Config;
use crate::Error;
use crate::Result;

/// The urgency given to streams registered without an explicit priority.
pub const DEFAULT_URGENCY: u8 = 127;

/// A simple no-op hasher for stream IDs.
///
/// Stream ID uniqueness is guaranteed upstream, so we can save effort by
/// avoiding a real hash algorithm.
#[derive(Default)]
pub struct StreamIdHasher {
    id: u64,
}

impl std::hash::Hasher for StreamIdHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.id
    }

    #[inline]
    fn write_u64(&mut self, id: u64) {
        self.id = id;
    }

    #[inline]
    fn write(&mut self, _: &[u8]) {
        // We need a default write() for the trait but stream IDs will
        // always be a u64 so we just delegate to write_u64.
        unimplemented!()
    }
}

type BuildStreamIdHasher = std::hash::BuildHasherDefault<StreamIdHasher>;

pub type StreamIdHashMap<V> = HashMap<u64, V, BuildStreamIdHasher>;

/// Scheduling priority of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamPriority {
    /// The stream's urgency (lower is better).
    pub urgency: u8,

    /// Whether the stream is drained in round-robin slices rather than to
    /// completion.
    pub incremental: bool,
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority {
            urgency: DEFAULT_URGENCY,
            incremental: true,
        }
    }
}

/// The ordering key of one blocked stream.
///
/// Keys are immutable while linked into the blocked tree; re-prioritizing
/// or re-queueing a stream replaces its key with a fresh one.
struct BlockedKey {
    id: u64,
    is_static: bool,
    urgency: u8,

    /// Enqueue tick, providing first-come-first-served order among equal
    /// ranks.
    seq: u64,

    link: RBTreeAtomicLink,
}

intrusive_adapter!(BlockedAdapter = Arc<BlockedKey>: BlockedKey { link: RBTreeAtomicLink });

impl<'a> KeyAdapter<'a> for BlockedAdapter {
    type Key = (bool, u8, u64);

    fn get_key(&self, k: &'a BlockedKey) -> Self::Key {
        // Static streams outrank every urgency value and keep plain FIFO
        // order among themselves.
        let urgency = if k.is_static { 0 } else { k.urgency };

        (!k.is_static, urgency, k.seq)
    }
}

struct StreamEntry {
    is_static: bool,
    urgency: u8,
    incremental: bool,

    /// The stream's key in the blocked tree, while blocked.
    key: Option<Arc<BlockedKey>>,
}

/// The stream currently entitled to the head of its urgency class.
struct FrontRunner {
    id: u64,
    seq: u64,
    bytes_left: u64,
}

/// Tracks which streams are ready to write and in what order they should
/// be drained.
pub struct WriteScheduler {
    /// All registered streams, blocked or not.
    streams: StreamIdHashMap<StreamEntry>,

    /// Blocked streams, ordered by (static, urgency, enqueue tick).
    blocked: RBTree<BlockedAdapter>,

    blocked_count: usize,

    next_seq: u64,

    /// Whether a popped stream may keep the head of the line across pops.
    batching: bool,

    /// Bytes a stream may write before ceding the head of the line.
    batch_size: u64,

    front_runner: Option<FrontRunner>,
}

impl WriteScheduler {
    pub fn new(config: &Config) -> Self {
        WriteScheduler {
            streams: StreamIdHashMap::default(),
            blocked: RBTree::new(BlockedAdapter::new()),
            blocked_count: 0,
            next_seq: 0,
            batching: config.stream_batching,
            batch_size: config.stream_batch_size,
            front_runner: None,
        }
    }

    /// Registers a stream with the scheduler.
    ///
    /// Registering an already-registered stream is a caller bug and fails
    /// with [`Error::InvalidStreamState`].
    pub fn register_stream(
        &mut self, id: u64, is_static: bool, priority: StreamPriority,
    ) -> Result<()> {
        match self.streams.entry(id) {
            hash_map::Entry::Occupied(_) =>
                Err(Error::InvalidStreamState(id)),

            hash_map::Entry::Vacant(v) => {
                v.insert(StreamEntry {
                    is_static,
                    urgency: priority.urgency,
                    incremental: priority.incremental,
                    key: None,
                });

                Ok(())
            },
        }
    }

    /// Unregisters a stream, removing it from the blocked set if present.
    pub fn unregister_stream(&mut self, id: u64) -> Result<()> {
        let entry = self
            .streams
            .remove(&id)
            .ok_or(Error::InvalidStreamState(id))?;

        if let Some(key) = entry.key {
            if key.link.is_linked() {
                let ptr = Arc::as_ptr(&key);
                unsafe { self.blocked.cursor_mut_from_ptr(ptr) }.remove();
                self.blocked_count -= 1;
            }
        }

        if let Some(fr) = &self.front_runner {
            if fr.id == id {
                self.front_runner = None;
            }
        }

        Ok(())
    }

    /// Changes a stream's priority.
    ///
    /// Forbidden on static streams. A blocked stream keeps its queue
    /// position among its new urgency peers.
    pub fn update_stream_priority(
        &mut self, id: u64, priority: StreamPriority,
    ) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(Error::InvalidStreamState(id))?;

        if entry.is_static {
            return Err(Error::InvalidState);
        }

        if entry.urgency == priority.urgency &&
            entry.incremental == priority.incremental
        {
            return Ok(());
        }

        entry.urgency = priority.urgency;
        entry.incremental = priority.incremental;

        // Re-key the blocked tree entry, keeping the enqueue tick.
        if let Some(old) = entry.key.take() {
            if old.link.is_linked() {
                let ptr = Arc::as_ptr(&old);
                unsafe { self.blocked.cursor_mut_from_ptr(ptr) }.remove();
            }

            let new_key = Arc::new(BlockedKey {
                id,
                is_static: false,
                urgency: priority.urgency,
                seq: old.seq,
                link: RBTreeAtomicLink::new(),
            });

            entry.key = Some(Arc::clone(&new_key));
            self.blocked.insert(new_key);
        }

        Ok(())
    }

    /// Marks a stream as having data ready to write.
    ///
    /// Adding an already-blocked stream is a no-op: a stream appears in
    /// the blocked set at most once.
    pub fn add_stream(&mut self, id: u64) -> Result<()> {
        let entry = self
            .streams
            .get_mut(&id)
            .ok_or(Error::InvalidStreamState(id))?;

        if entry.key.is_some() {
            return Ok(());
        }

        // The front-runner retakes the head of its class; everyone else
        // joins the tail.
        let continues = match &self.front_runner {
            Some(fr) if fr.id == id =>
                !entry.incremental || (self.batching && fr.bytes_left > 0),

            _ => false,
        };

        let seq = if continues {
            self.front_runner.as_ref().unwrap().seq
        } else {
            self.next_seq += 1;
            self.next_seq
        };

        let key = Arc::new(BlockedKey {
            id,
            is_static: entry.is_static,
            urgency: entry.urgency,
            seq,
            link: RBTreeAtomicLink::new(),
        });

        entry.key = Some(Arc::clone(&key));
        self.blocked.insert(key);
        self.blocked_count += 1;

        Ok(())
    }

    /// Removes and returns the next stream to write.
    ///
    /// Returns [`Error::Done`] when no stream is blocked.
    pub fn pop_front(&mut self) -> Result<u64> {
        let key = self.blocked.front_mut().remove().ok_or(Error::Done)?;

        self.blocked_count -= 1;

        if let Some(entry) = self.streams.get_mut(&key.id) {
            entry.key = None;
        }

        // A stream popping again while entitled to continue keeps whatever
        // batch budget it has left; anyone else starts a fresh batch.
        let bytes_left = match &self.front_runner {
            Some(fr) if fr.id == key.id => fr.bytes_left,
            _ => self.batch_size,
        };

        self.front_runner = Some(FrontRunner {
            id: key.id,
            seq: key.seq,
            bytes_left,
        });

        Ok(key.id)
    }

    /// Records bytes written by the stream most recently popped, counting
    /// against its batch budget.
    pub fn update_bytes_for_stream(&mut self, id: u64, bytes: u64) {
        if let Some(fr) = &mut self.front_runner {
            if fr.id == id {
                fr.bytes_left = fr.bytes_left.saturating_sub(bytes);
            }
        }
    }

    /// Whether some blocked stream would be popped ahead of `id`.
    pub fn should_yield(&self, id: u64) -> Result<bool> {
        let entry =
            self.streams.get(&id).ok_or(Error::InvalidStreamState(id))?;

        let front = match self.blocked.front().get() {
            Some(front) => front,
            None => return Ok(false),
        };

        if front.id == id {
            return Ok(false);
        }

        // Rank `id` exactly as pop_front would see it if it were added
        // right now, continuation right included.
        let seq = match &self.front_runner {
            Some(fr)
                if fr.id == id &&
                    (!entry.incremental ||
                        (self.batching && fr.bytes_left > 0)) =>
                fr.seq,

            _ => self.next_seq + 1,
        };

        let urgency = if entry.is_static { 0 } else { entry.urgency };
        let own = (!entry.is_static, urgency, seq);

        let front_urgency = if front.is_static { 0 } else { front.urgency };
        let other = (!front.is_static, front_urgency, front.seq);

        Ok(other < own)
    }

    /// The number of currently blocked streams.
    pub fn num_blocked_streams(&self) -> usize {
        self.blocked_count
    }

    /// Whether any stream is blocked.
    pub fn has_blocked_streams(&self) -> bool {
        self.blocked_count > 0
    }

    /// Whether the given stream is currently in the blocked set.
    pub fn is_stream_blocked(&self, id: u64) -> bool {
        self.streams
            .get(&id)
            .is_some_and(|entry| entry.key.is_some())
    }

    /// A snapshot of the blocked streams, in the order `pop_front` would
    /// return them.
    pub fn blocked(&self) -> StreamIter {
        StreamIter {
            streams: self.blocked.iter().map(|k| k.id).collect(),
            index: 0,
        }
    }
}

/// An iterator over stream IDs.
#[derive(Default)]
pub struct StreamIter {
    streams: SmallVec<[u64; 8]>,
    index: usize,
}

impl Iterator for StreamIter {
    type Item = u64;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let v = self.streams.get(self.index)?;
        self.index += 1;
        Some(*v)
    }
}

impl ExactSizeIterator for StreamIter {
    #[inline]
    fn len(&self) -> usize {
        self.streams.len() - self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn scheduler() -> WriteScheduler {
        WriteScheduler::new(&Config::new())
    }

    fn prio(urgency: u8, incremental: bool) -> StreamPriority {
        StreamPriority {
            urgency,
            incremental,
        }
    }

    #[test]
    fn register_duplicate_is_an_error() {
        let mut s = scheduler();

        assert_eq!(s.register_stream(4, false, Default::default()), Ok(()));
        assert_eq!(
            s.register_stream(4, false, Default::default()),
            Err(Error::InvalidStreamState(4))
        );
    }

    #[test]
    fn unregister_unknown_is_an_error() {
        let mut s = scheduler();

        assert_eq!(
            s.unregister_stream(4),
            Err(Error::InvalidStreamState(4))
        );
    }

    #[test]
    fn update_priority_on_static_is_an_error() {
        let mut s = scheduler();

        s.register_stream(2, true, Default::default()).unwrap();

        assert_eq!(
            s.update_stream_priority(2, prio(0, false)),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn statics_then_urgency_then_fifo() {
        let mut s = scheduler();

        // Registration order: low urgency value means more urgent, so
        // stream 1 is the least urgent here.
        s.register_stream(1, false, prio(7, false)).unwrap();
        s.register_stream(2, false, prio(1, false)).unwrap();
        s.register_stream(3, false, prio(1, false)).unwrap();
        s.register_stream(4, true, Default::default()).unwrap();
        s.register_stream(5, true, Default::default()).unwrap();

        for id in 1..=5 {
            s.add_stream(id).unwrap();
        }

        // Static streams first in insertion order, then urgency buckets,
        // FIFO within each.
        assert_eq!(s.blocked().collect::<Vec<u64>>(), vec![4, 5, 2, 3, 1]);

        assert_eq!(s.pop_front(), Ok(4));
        assert_eq!(s.pop_front(), Ok(5));
        assert_eq!(s.pop_front(), Ok(2));
        assert_eq!(s.pop_front(), Ok(3));
        assert_eq!(s.pop_front(), Ok(1));
        assert_eq!(s.pop_front(), Err(Error::Done));
    }

    #[test]
    fn add_stream_is_idempotent() {
        let mut s = scheduler();

        s.register_stream(1, false, Default::default()).unwrap();
        s.register_stream(2, false, Default::default()).unwrap();

        s.add_stream(2).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(1).unwrap();
        s.add_stream(1).unwrap();

        assert_eq!(s.num_blocked_streams(), 2);

        s.pop_front().unwrap();

        assert_eq!(s.num_blocked_streams(), 1);
    }

    #[test]
    fn unregister_blocked_stream_unblocks_it() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(1, true)).unwrap();
        s.register_stream(2, false, prio(2, true)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();

        s.unregister_stream(1).unwrap();

        assert_eq!(s.num_blocked_streams(), 1);
        assert!(!s.is_stream_blocked(1));
        assert_eq!(s.pop_front(), Ok(2));
    }

    #[test]
    fn update_priority_keeps_queue_position() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(3, true)).unwrap();
        s.register_stream(3, false, prio(3, true)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();
        s.add_stream(3).unwrap();

        // Toggling the incremental flag alone must not reorder peers.
        s.update_stream_priority(2, prio(3, false)).unwrap();

        assert_eq!(s.pop_front(), Ok(1));
        assert_eq!(s.pop_front(), Ok(2));
        assert_eq!(s.pop_front(), Ok(3));
    }

    #[test]
    fn update_priority_moves_between_buckets() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(3, true)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();

        s.update_stream_priority(2, prio(0, true)).unwrap();

        assert_eq!(s.pop_front(), Ok(2));
        assert_eq!(s.pop_front(), Ok(1));
    }

    #[rstest]
    fn incremental_round_robin(#[values(true, false)] batching: bool) {
        let mut config = Config::new();
        config.enable_stream_batching(batching);

        let mut s = WriteScheduler::new(&config);

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(3, true)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();

        assert_eq!(s.pop_front(), Ok(1));
        s.update_bytes_for_stream(1, 1000);
        s.add_stream(1).unwrap();

        if batching {
            // Still within the batch budget: stream 1 keeps the head.
            assert_eq!(s.pop_front(), Ok(1));
            s.update_bytes_for_stream(1, 20_000);
            s.add_stream(1).unwrap();
        }

        // Budget exhausted (or batching off): strict round-robin.
        assert_eq!(s.pop_front(), Ok(2));
        s.update_bytes_for_stream(2, 20_000);
        s.add_stream(2).unwrap();

        assert_eq!(s.pop_front(), Ok(1));
    }

    #[test]
    fn non_incremental_writes_to_completion() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, false)).unwrap();
        s.register_stream(2, false, prio(3, false)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();

        // Stream 1 keeps being selected however much it writes, until it
        // stops re-adding itself.
        for _ in 0..3 {
            assert_eq!(s.pop_front(), Ok(1));
            s.update_bytes_for_stream(1, 64 * 1024);
            s.add_stream(1).unwrap();
        }

        assert_eq!(s.pop_front(), Ok(1));

        // No more data on stream 1: it is not re-added.
        assert_eq!(s.pop_front(), Ok(2));
    }

    #[test]
    fn higher_urgency_arrival_preempts_batch() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(0, true)).unwrap();

        s.add_stream(1).unwrap();

        assert_eq!(s.pop_front(), Ok(1));
        s.update_bytes_for_stream(1, 100);
        s.add_stream(1).unwrap();

        // A more urgent stream arrives mid-batch.
        s.add_stream(2).unwrap();

        assert_eq!(s.pop_front(), Ok(2));
        assert_eq!(s.pop_front(), Ok(1));
    }

    #[test]
    fn should_yield_follows_pop_order() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(3, true)).unwrap();
        s.register_stream(3, true, Default::default()).unwrap();

        assert_eq!(s.should_yield(1), Ok(false));

        s.add_stream(1).unwrap();

        // Stream 1 is the front of the blocked set.
        assert_eq!(s.should_yield(1), Ok(false));

        // An equal-urgency stream that got there first outranks stream 2.
        assert_eq!(s.should_yield(2), Ok(true));

        // A static stream never yields to data streams.
        assert_eq!(s.should_yield(3), Ok(false));

        s.add_stream(3).unwrap();
        assert_eq!(s.should_yield(1), Ok(true));

        assert_eq!(s.should_yield(4), Err(Error::InvalidStreamState(4)));
    }

    #[test]
    fn front_runner_survives_pop_of_same_stream() {
        let mut s = scheduler();

        s.register_stream(1, false, prio(3, true)).unwrap();
        s.register_stream(2, false, prio(3, true)).unwrap();

        s.add_stream(1).unwrap();
        s.add_stream(2).unwrap();

        assert_eq!(s.pop_front(), Ok(1));
        s.update_bytes_for_stream(1, 100);
        s.add_stream(1).unwrap();

        // The continuing stream still outranks its peer.
        assert_eq!(s.should_yield(1), Ok(false));
        assert_eq!(s.pop_front(), Ok(1));
    }
}
