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

//! Delayed-ACK scheduling across packet number spaces.
//!
//! Every received packet is recorded here, per epoch, and the manager
//! answers the one question the connection's event loop cares about: by
//! when must an ACK frame leave. The policy trades acknowledgment latency
//! against overhead: out-of-order receipts that close a hole are
//! acknowledged immediately, every configured Nth packet is acknowledged
//! immediately, and once a connection has proven itself ACKs are decimated
//! down to a fraction of the RTT.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use crate::packet::EcnCounts;
use crate::packet::Epoch;
use crate::ranges::RangeSet;
use crate::rtt::RttStats;
use crate::Config;

/// Packets acknowledged every other packet before decimation kicks in.
const DEFAULT_ACK_FREQUENCY: u64 = 2;

/// Under decimation, an ACK goes out at the latest after this many
/// retransmittable packets, however short the RTT.
const MAX_UNACKED_BEFORE_IMMEDIATE_ACK: u64 = 10;

/// The contents of the next ACK frame for one packet number space.
#[derive(Clone, Debug)]
pub struct AckFrame {
    /// How long the largest observed packet has been held unacknowledged.
    pub ack_delay: Duration,

    /// The acknowledged packet number ranges.
    pub ranges: RangeSet,

    /// Receipt timestamps of recently received packets, in receive order.
    pub timestamps: Vec<(u64, Instant)>,

    /// ECN marks observed on received packets.
    pub ecn_counts: EcnCounts,
}

/// Receive-side state of one packet number space.
struct ReceivedPacketSpace {
    /// Received packet numbers, capped in range count.
    recv_pkt_num: RangeSet,

    largest_observed: Option<u64>,

    /// When the largest observed packet was received.
    largest_observed_time: Option<Instant>,

    /// The deadline by which an ACK must be emitted, once armed.
    ack_timeout: Option<Instant>,

    /// Receipt times for timestamp reporting, oldest first.
    recv_pkt_times: VecDeque<(u64, Instant)>,

    ecn_counts: EcnCounts,

    /// Whether anything changed since the last emitted frame.
    ack_frame_updated: bool,

    /// Whether the most recently recorded packet closed a hole below the
    /// largest observed packet.
    last_packet_filled_hole: bool,

    /// Retransmittable packets received since the last ACK was flushed.
    unacked_count: u64,
}

impl ReceivedPacketSpace {
    fn new(max_ranges: usize) -> Self {
        ReceivedPacketSpace {
            recv_pkt_num: RangeSet::new(max_ranges),
            largest_observed: None,
            largest_observed_time: None,
            ack_timeout: None,
            recv_pkt_times: VecDeque::new(),
            ecn_counts: EcnCounts::default(),
            ack_frame_updated: false,
            last_packet_filled_hole: false,
            unacked_count: 0,
        }
    }

    /// Arms or advances the deadline; an armed deadline only ever moves
    /// earlier.
    fn update_ack_timeout(&mut self, deadline: Instant) {
        self.ack_timeout = Some(match self.ack_timeout {
            Some(current) => current.min(deadline),
            None => deadline,
        });
    }
}

/// Tracks received packets and schedules delayed ACKs for every packet
/// number space of a connection.
pub struct AckManager {
    spaces: [ReceivedPacketSpace; Epoch::count()],

    /// Whether each epoch keeps independent state. When off, everything
    /// routes to a single shared space.
    multiple_spaces: bool,

    /// Explicitly configured every-Nth-packet ACK frequency; disables
    /// decimation when set.
    ack_frequency: Option<u64>,

    delayed_ack_timeout: Duration,

    /// Largest packet number after which ACK decimation engages.
    min_received_before_decimation: u64,

    /// Fraction of the minimum RTT to delay decimated ACKs by.
    decimation_fraction: f64,

    max_receive_timestamps: usize,
}

impl AckManager {
    pub fn new(config: &Config) -> Self {
        AckManager {
            spaces: [
                ReceivedPacketSpace::new(config.max_ack_ranges),
                ReceivedPacketSpace::new(config.max_ack_ranges),
                ReceivedPacketSpace::new(config.max_ack_ranges),
            ],
            multiple_spaces: config.multiple_packet_number_spaces,
            ack_frequency: config.ack_frequency,
            delayed_ack_timeout: config.delayed_ack_timeout,
            min_received_before_decimation: config
                .min_received_before_ack_decimation,
            decimation_fraction: config.ack_decimation_fraction,
            max_receive_timestamps: config.max_ack_receive_timestamps,
        }
    }

    /// Records receipt of packet `pn` in the given space.
    ///
    /// Duplicates are ignored. The tracked range count is bounded, with
    /// the oldest history compacted first, and the receive-timestamp list
    /// skips samples whose clock went backwards (reception itself is still
    /// recorded).
    pub fn record_packet_received(
        &mut self, epoch: Epoch, pn: u64, receipt_time: Instant, ecn: u8,
    ) {
        let max_timestamps = self.max_receive_timestamps;
        let space = self.space_mut(epoch);

        if space.recv_pkt_num.contains(pn) {
            trace!("ignoring duplicate packet {pn}");
            return;
        }

        space.last_packet_filled_hole = pn > 0 &&
            space.recv_pkt_num.contains(pn - 1) &&
            space.recv_pkt_num.contains(pn + 1);

        space.recv_pkt_num.push_item(pn);

        if Some(pn) > space.largest_observed {
            space.largest_observed = Some(pn);
            space.largest_observed_time = Some(receipt_time);
        }

        let monotonic = match space.recv_pkt_times.back() {
            Some((_, last)) => *last <= receipt_time,
            None => true,
        };

        if monotonic {
            space.recv_pkt_times.push_back((pn, receipt_time));

            while space.recv_pkt_times.len() > max_timestamps {
                space.recv_pkt_times.pop_front();
            }
        }

        space.ecn_counts.on_packet_received(ecn);

        space.ack_frame_updated = true;
    }

    /// Re-evaluates the space's ACK deadline after a packet was recorded.
    ///
    /// In priority order: a packet that closed a hole below the largest
    /// observed forces an immediate ACK; packets that do not instigate
    /// ACKs leave the deadline alone; an explicitly configured frequency
    /// acknowledges every Nth packet immediately; under decimation an ACK
    /// is delayed by a fraction of the minimum RTT (with a hard cap on
    /// outstanding packets); otherwise the default delayed-ACK timeout
    /// applies. An armed deadline only ever moves earlier.
    pub fn maybe_update_ack_timeout(
        &mut self, should_instigate_ack: bool, epoch: Epoch, last_pn: u64,
        now: Instant, rtt_stats: &RttStats,
    ) {
        let ack_frequency = self.ack_frequency;
        let min_before_decimation = self.min_received_before_decimation;
        let delayed_ack = self.delayed_ack_timeout;
        let fraction = self.decimation_fraction;

        let space = self.space_mut(epoch);

        if !space.ack_frame_updated {
            // Nothing new to acknowledge.
            return;
        }

        if space.last_packet_filled_hole {
            trace!("pkt {last_pn} filled a hole, acking immediately");
            space.update_ack_timeout(now);
            return;
        }

        if !should_instigate_ack {
            return;
        }

        space.unacked_count += 1;

        if let Some(frequency) = ack_frequency {
            if space.unacked_count >= frequency {
                space.update_ack_timeout(now);
            } else {
                space.update_ack_timeout(now + delayed_ack);
            }

            return;
        }

        if last_pn > min_before_decimation {
            // Decimation: mostly wait a fraction of the RTT, but never let
            // too many packets go unacknowledged.
            if space.unacked_count >= MAX_UNACKED_BEFORE_IMMEDIATE_ACK {
                space.update_ack_timeout(now);
            } else {
                let min_rtt =
                    rtt_stats.min_rtt().unwrap_or_else(|| rtt_stats.rtt());

                let delay = delayed_ack.min(min_rtt.mul_f64(fraction));
                space.update_ack_timeout(now + delay);
            }
        } else if space.unacked_count >= DEFAULT_ACK_FREQUENCY {
            space.update_ack_timeout(now);
        } else {
            space.update_ack_timeout(now + delayed_ack);
        }
    }

    /// Produces the data for the space's next ACK frame and marks the
    /// frame as emitted.
    pub fn ack_frame(&mut self, epoch: Epoch, now: Instant) -> AckFrame {
        let space = self.space_mut(epoch);

        space.ack_frame_updated = false;

        AckFrame {
            ack_delay: space
                .largest_observed_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO),
            ranges: space.recv_pkt_num.clone(),
            timestamps: space.recv_pkt_times.iter().copied().collect(),
            ecn_counts: space.ecn_counts,
        }
    }

    /// Stops tracking packet numbers below `least_unacked`, e.g. after the
    /// space's keys were discarded.
    pub fn dont_wait_for_packets_before(
        &mut self, epoch: Epoch, least_unacked: u64,
    ) {
        let space = self.space_mut(epoch);

        if least_unacked > 0 {
            space.recv_pkt_num.remove_until(least_unacked - 1);
        }

        space.recv_pkt_times.retain(|(pn, _)| *pn >= least_unacked);
    }

    /// Flushes the space's ACK state: deadline, pending-packet counter and
    /// the frame-updated flag. Idempotent.
    pub fn reset_ack_states(&mut self, epoch: Epoch) {
        let space = self.space_mut(epoch);

        space.ack_timeout = None;
        space.ack_frame_updated = false;
        space.last_packet_filled_hole = false;
        space.unacked_count = 0;
    }

    /// The space's armed ACK deadline, if any.
    pub fn ack_timeout(&self, epoch: Epoch) -> Option<Instant> {
        self.space(epoch).ack_timeout
    }

    /// The earliest armed ACK deadline across all spaces, for the caller's
    /// single wake-up alarm.
    pub fn earliest_ack_timeout(&self) -> Option<Instant> {
        if !self.multiple_spaces {
            return self.spaces[Epoch::Application].ack_timeout;
        }

        self.spaces
            .iter()
            .filter_map(|space| space.ack_timeout)
            .min()
    }

    /// Whether any space changed since its last emitted frame.
    pub fn is_ack_frame_updated(&self) -> bool {
        if !self.multiple_spaces {
            return self.spaces[Epoch::Application].ack_frame_updated;
        }

        self.spaces.iter().any(|space| space.ack_frame_updated)
    }

    /// The largest packet number observed in the space.
    pub fn largest_observed(&self, epoch: Epoch) -> Option<u64> {
        self.space(epoch).largest_observed
    }

    fn space(&self, epoch: Epoch) -> &ReceivedPacketSpace {
        &self.spaces[self.route(epoch)]
    }

    fn space_mut(&mut self, epoch: Epoch) -> &mut ReceivedPacketSpace {
        let epoch = self.route(epoch);
        &mut self.spaces[epoch]
    }

    fn route(&self, epoch: Epoch) -> Epoch {
        if self.multiple_spaces {
            epoch
        } else {
            Epoch::Application
        }
    }
}
