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

//! Time-wait tracking of terminated connections.
//!
//! After a connection is torn down its identifiers stay recognizable for a
//! bounded grace period, so stray and duplicate packets from the peer get
//! a deterministic answer (a cached close, a stateless reset, or silence)
//! instead of being mistaken for new connections. Memory is bounded: the
//! registry holds at most a configured number of entries and evicts the
//! oldest first, and blocked writes queue up to a configured cap.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use ring::hmac;
use ring::rand::SecureRandom;
use ring::rand::SystemRandom;

use smallvec::SmallVec;

use crate::packet;
use crate::packet::ConnectionId;
use crate::Config;

const RESET_TOKEN_LEN: usize = 16;

/// Minimum padding for a stateless reset to pass as a short-header packet.
const MIN_RESET_PADDING_LEN: usize = 5;

/// What to do with stray packets for a tracked connection ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeWaitAction {
    /// Drop stray packets silently.
    DoNothing,

    /// Answer short-header packets with a stateless reset, with
    /// exponential backoff.
    SendStatelessReset,

    /// Replay the cached termination packets.
    SendTerminationPackets,

    /// Replay the cached CONNECTION_CLOSE packets.
    SendConnectionClosePackets,
}

/// Everything the registry needs to remember about one terminated
/// connection.
pub struct TimeWaitConnectionInfo {
    /// All identifiers the peer may still use to reach the connection.
    pub connection_ids: SmallVec<[ConnectionId<'static>; 2]>,

    /// Pre-serialized packets to replay to the peer, shared across all the
    /// connection's IDs and immutable once stored.
    pub termination_packets: Option<Arc<Vec<Vec<u8>>>>,

    /// Whether the termination packets were built in a long-header
    /// (pre-1-RTT) context.
    pub pre_handshake: bool,

    /// Overrides the configured retention period for this connection.
    pub ttl: Option<Duration>,
}

/// Result of handing a packet to a [`PacketWriter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// The packet left the socket.
    Written,

    /// The socket cannot accept more data right now; retry after
    /// [`TimeWaitList::on_writer_unblocked()`].
    Blocked,

    /// The packet could not be written and should be forgotten.
    Error,
}

/// The socket abstraction the registry replies through.
pub trait PacketWriter {
    /// Writes a single packet towards `peer_addr`.
    fn write_packet(
        &mut self, buf: &[u8], self_addr: SocketAddr, peer_addr: SocketAddr,
    ) -> WriteStatus;

    /// Whether the writer is currently blocked.
    fn is_write_blocked(&self) -> bool;
}

/// Callbacks produced by the registry towards its owner.
pub trait TimeWaitVisitor {
    /// The underlying writer reported itself blocked; the owner should
    /// arrange for [`TimeWaitList::on_writer_unblocked()`] to be called
    /// once the socket drains.
    fn on_write_blocked(&mut self) {}
}

impl TimeWaitVisitor for () {}

struct Entry {
    /// Monotonic insertion tick; the queue is ordered by it.
    seq: u64,

    connection_ids: SmallVec<[ConnectionId<'static>; 2]>,

    action: TimeWaitAction,

    termination_packets: Option<Arc<Vec<Vec<u8>>>>,

    pre_handshake: bool,

    insertion_time: Instant,

    ttl: Duration,

    /// Packets received for any of this entry's IDs since insertion.
    num_packets: u64,
}

struct PendingWrite {
    buf: Vec<u8>,
    self_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// Registry of terminated connections still in their time-wait period.
pub struct TimeWaitList<W, V> {
    /// Entries in insertion order, which is also expiry order.
    entries: VecDeque<Entry>,

    /// Connection ID to entry tick index.
    index: HashMap<ConnectionId<'static>, u64>,

    next_seq: u64,

    max_connections: usize,

    default_ttl: Duration,

    /// Writes held back while the writer is blocked, oldest first.
    pending: VecDeque<PendingWrite>,

    max_pending: usize,

    writer: W,

    visitor: V,

    reset_key: Option<hmac::Key>,

    rng: SystemRandom,
}

impl<W: PacketWriter, V: TimeWaitVisitor> TimeWaitList<W, V> {
    pub fn new(config: &Config, writer: W, visitor: V) -> Self {
        let reset_key = config
            .stateless_reset_secret
            .as_ref()
            .map(|secret| hmac::Key::new(hmac::HMAC_SHA256, secret));

        TimeWaitList {
            entries: VecDeque::new(),
            index: HashMap::new(),
            next_seq: 0,
            max_connections: config.max_time_wait_connections,
            default_ttl: config.time_wait_ttl,
            pending: VecDeque::new(),
            max_pending: config.max_pending_time_wait_packets,
            writer,
            visitor,
            reset_key,
            rng: SystemRandom::new(),
        }
    }

    /// Starts (or restarts) the time-wait period for all of a connection's
    /// identifiers.
    ///
    /// IDs that are already tracked move into the new entry, so a
    /// connection record is never duplicated and a re-add both resets the
    /// retention clock and may escalate the action. The oldest entry is
    /// evicted if the registry is full.
    pub fn add_connection_ids(
        &mut self, action: TimeWaitAction, info: TimeWaitConnectionInfo,
        now: Instant,
    ) {
        // Detach IDs from any entry they currently belong to.
        for cid in &info.connection_ids {
            self.remove_connection_id(cid);
        }

        while self.entries.len() >= self.max_connections {
            self.evict_oldest();
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        for cid in &info.connection_ids {
            self.index.insert(cid.clone(), seq);
        }

        self.entries.push_back(Entry {
            seq,
            connection_ids: info.connection_ids,
            action,
            termination_packets: info.termination_packets,
            pre_handshake: info.pre_handshake,
            insertion_time: now,
            ttl: info.ttl.unwrap_or(self.default_ttl),
            num_packets: 0,
        });
    }

    /// Handles a packet addressed to a tracked connection ID.
    ///
    /// Returns whether the ID was tracked; untracked IDs are the caller's
    /// problem (usually a new connection or a drop).
    pub fn process_packet(
        &mut self, self_addr: SocketAddr, peer_addr: SocketAddr,
        cid: &ConnectionId, packet_type: packet::Type, packet_len: usize,
    ) -> bool {
        let seq = match self.index.get(cid.as_ref()) {
            Some(&seq) => seq,
            None => return false,
        };

        let Ok(idx) = self.entries.binary_search_by_key(&seq, |e| e.seq)
        else {
            return false;
        };

        let entry = &mut self.entries[idx];
        entry.num_packets += 1;

        let num_packets = entry.num_packets;
        let action = entry.action;
        let pre_handshake = entry.pre_handshake;
        let termination_packets = entry.termination_packets.clone();

        match action {
            TimeWaitAction::DoNothing => {
                trace!("time-wait drop pkt {packet_type:?} cid={cid:?}");
            },

            TimeWaitAction::SendStatelessReset => {
                self.maybe_send_reset(
                    self_addr,
                    peer_addr,
                    cid,
                    packet_type,
                    packet_len,
                    num_packets,
                );
            },

            TimeWaitAction::SendTerminationPackets |
            TimeWaitAction::SendConnectionClosePackets => {
                if packet_type == packet::Type::Short && pre_handshake {
                    // The peer already has 1-RTT keys but the cached close
                    // predates them and would be ignored.
                    self.maybe_send_reset(
                        self_addr,
                        peer_addr,
                        cid,
                        packet_type,
                        packet_len,
                        num_packets,
                    );
                } else if let Some(packets) = termination_packets {
                    trace!(
                        "time-wait replaying {} packets cid={cid:?}",
                        packets.len()
                    );

                    for pkt in packets.iter() {
                        self.send_or_queue(pkt.clone(), self_addr, peer_addr);
                    }
                }
            },
        }

        true
    }

    /// Drops every entry whose retention period has elapsed.
    ///
    /// Insertion order is expiry order, so the sweep stops at the first
    /// entry still within its period. [`Self::next_expiry()`] tells the
    /// caller when to sweep again.
    pub fn cleanup_expired(&mut self, now: Instant) {
        while let Some(deadline) =
            self.entries.front().map(|e| e.insertion_time + e.ttl)
        {
            if deadline > now {
                break;
            }

            let entry = self.entries.pop_front().unwrap();

            trace!(
                "time-wait expired for {} ids after {:?}",
                entry.connection_ids.len(),
                entry.ttl
            );

            for cid in &entry.connection_ids {
                self.index.remove(cid);
            }
        }
    }

    /// When the next tracked connection leaves time-wait.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.insertion_time + e.ttl)
    }

    /// Retries the queued writes, in their original order, after the
    /// writer reported itself writable again.
    pub fn on_writer_unblocked(&mut self) {
        while !self.pending.is_empty() {
            let status = {
                let front = self.pending.front().unwrap();
                self.writer.write_packet(
                    &front.buf,
                    front.self_addr,
                    front.peer_addr,
                )
            };

            match status {
                WriteStatus::Written => {
                    self.pending.pop_front();
                },

                WriteStatus::Blocked => {
                    self.visitor.on_write_blocked();
                    break;
                },

                WriteStatus::Error => {
                    // Forget the packet, keep draining.
                    self.pending.pop_front();
                },
            }
        }
    }

    /// Whether the given connection ID is in its time-wait period.
    pub fn is_connection_id_in_time_wait(&self, cid: &ConnectionId) -> bool {
        self.index.contains_key(cid.as_ref())
    }

    /// The number of tracked (logical) connections.
    pub fn num_connections(&self) -> usize {
        self.entries.len()
    }

    /// The number of writes held back by a blocked writer.
    pub fn num_pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Packets received for the given connection ID's entry since it was
    /// inserted.
    pub fn num_packets_received(&self, cid: &ConnectionId) -> Option<u64> {
        let seq = *self.index.get(cid.as_ref())?;
        let idx = self.entries.binary_search_by_key(&seq, |e| e.seq).ok()?;

        Some(self.entries[idx].num_packets)
    }

    /// A mutable reference to the injected packet writer.
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    fn remove_connection_id(&mut self, cid: &ConnectionId) {
        let Some(seq) = self.index.remove(cid.as_ref()) else {
            return;
        };

        let Ok(idx) = self.entries.binary_search_by_key(&seq, |e| e.seq)
        else {
            return;
        };

        self.entries[idx]
            .connection_ids
            .retain(|id| id.as_ref() != cid.as_ref());

        if self.entries[idx].connection_ids.is_empty() {
            self.entries.remove(idx);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            trace!(
                "time-wait full, evicting entry with {} ids",
                entry.connection_ids.len()
            );

            for cid in &entry.connection_ids {
                self.index.remove(cid);
            }
        }
    }

    fn maybe_send_reset(
        &mut self, self_addr: SocketAddr, peer_addr: SocketAddr,
        cid: &ConnectionId, packet_type: packet::Type, packet_len: usize,
        num_packets: u64,
    ) {
        if packet_type.is_long() {
            // Long-header packets are never answered with a reset: the
            // peer is still handshaking and would not recognize it.
            trace!("no reset for long header pkt cid={cid:?}");
            return;
        }

        // Exponential backoff: reply only when the per-connection receive
        // count is a power of two, i.e. to the 1st, 2nd, 4th, 8th, ...
        // packet.
        if num_packets & (num_packets - 1) != 0 {
            return;
        }

        match self.build_stateless_reset(cid, packet_len) {
            Some(buf) => self.send_or_queue(buf, self_addr, peer_addr),

            // An unbuildable reset (no key, or the inciting packet is too
            // small to answer without amplification) is skipped, not an
            // error.
            None => trace!("skipping stateless reset cid={cid:?}"),
        }
    }

    /// Builds a stateless reset: random padding shaped like a short-header
    /// packet, followed by the 16-byte token derived from the connection
    /// ID.
    fn build_stateless_reset(
        &self, cid: &ConnectionId, inciting_len: usize,
    ) -> Option<Vec<u8>> {
        let key = self.reset_key.as_ref()?;

        // Stay at least one byte smaller than the inciting packet so two
        // endpoints cannot chase each other's resets forever.
        let headroom = inciting_len.checked_sub(RESET_TOKEN_LEN)?;
        if headroom <= MIN_RESET_PADDING_LEN {
            return None;
        }

        let padding_len = (headroom - 1)
            .min(MIN_RESET_PADDING_LEN + packet::MAX_CONN_ID_LEN);

        let mut buf = vec![0u8; padding_len];
        self.rng.fill(&mut buf).ok()?;

        buf[0] = 0b0100_0000 | (buf[0] >> 2);

        let tag = hmac::sign(key, cid);
        buf.extend_from_slice(&tag.as_ref()[..RESET_TOKEN_LEN]);

        Some(buf)
    }

    fn send_or_queue(
        &mut self, buf: Vec<u8>, self_addr: SocketAddr, peer_addr: SocketAddr,
    ) {
        // Never overtake writes that are already queued.
        if self.writer.is_write_blocked() || !self.pending.is_empty() {
            self.queue_pending(buf, self_addr, peer_addr);
            self.visitor.on_write_blocked();
            return;
        }

        match self.writer.write_packet(&buf, self_addr, peer_addr) {
            WriteStatus::Written => (),

            WriteStatus::Blocked => {
                self.queue_pending(buf, self_addr, peer_addr);
                self.visitor.on_write_blocked();
            },

            WriteStatus::Error => {
                trace!("time-wait write failed, dropping packet");
            },
        }
    }

    fn queue_pending(
        &mut self, buf: Vec<u8>, self_addr: SocketAddr, peer_addr: SocketAddr,
    ) {
        if self.pending.len() >= self.max_pending {
            self.pending.pop_front();

            trace!("pending time-wait queue full, dropping oldest");
        }

        self.pending.push_back(PendingWrite {
            buf,
            self_addr,
            peer_addr,
        });
    }
}
