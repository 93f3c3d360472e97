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

//! The congestion-controller interface consumed by the [`Pacer`].
//!
//! The algorithms themselves (CUBIC, BBR, ...) live with the connection's
//! loss recovery and are injected here; the pacer only asks *how much* may
//! be sent and wraps the answer with *when*.
//!
//! [`Pacer`]: crate::pacer::Pacer

use std::fmt::Debug;
use std::time::Instant;

use crate::bandwidth::Bandwidth;
use crate::rtt::RttStats;

/// A packet declared lost by loss recovery.
#[derive(Debug)]
pub struct Lost {
    /// The lost packet's number.
    pub packet_number: u64,

    /// The lost packet's size in bytes.
    pub bytes_lost: usize,
}

/// A packet newly acknowledged by the peer.
#[derive(Debug)]
pub struct Acked {
    /// The acknowledged packet's number.
    pub pkt_num: u64,

    /// When the packet was sent.
    pub time_sent: Instant,

    /// The acknowledged packet's size in bytes.
    pub size: usize,
}

/// The capability set a congestion-control algorithm exposes to the pacer.
pub trait CongestionControl: Debug {
    /// Returns the size of the current congestion window in bytes. Note,
    /// this is not the *available* window. Some send algorithms may not use
    /// a congestion window and will return 0.
    fn get_congestion_window(&self) -> usize;

    /// Returns the size of the current congestion window in packets. Note,
    /// this is not the *available* window. Some send algorithms may not use
    /// a congestion window and will return 0.
    fn get_congestion_window_in_packets(&self) -> usize;

    /// Make decision on whether the sender can send right now. Note that
    /// even when this method returns true, the sending can be delayed due
    /// to pacing.
    fn can_send(&self, bytes_in_flight: usize) -> bool;

    /// Inform that we sent `bytes` to the wire, and if the packet is
    /// retransmittable. `bytes_in_flight` is the number of bytes in flight
    /// before the packet was sent. Note: this function must be called for
    /// every packet sent to the wire.
    fn on_packet_sent(
        &mut self, sent_time: Instant, bytes_in_flight: usize,
        packet_number: u64, bytes: usize, is_retransmissible: bool,
        rtt_stats: &RttStats,
    );

    /// Indicates an update to the congestion state, caused either by an
    /// incoming ack or loss event timeout. `rtt_updated` indicates whether
    /// a new `latest_rtt` sample has been taken, `prior_in_flight` the
    /// bytes in flight prior to the congestion event. `acked_packets` and
    /// `lost_packets` are any packets considered acked or lost as a result
    /// of the congestion event.
    #[allow(clippy::too_many_arguments)]
    fn on_congestion_event(
        &mut self, rtt_updated: bool, prior_in_flight: usize,
        bytes_in_flight: usize, event_time: Instant, acked_packets: &[Acked],
        lost_packets: &[Lost], least_unacked: u64, rtt_stats: &RttStats,
    );

    /// Called when an RTO fires.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Adjust the current cwnd to a new maximal size.
    fn limit_cwnd(&mut self, _max_cwnd: usize) {}

    fn is_in_recovery(&self) -> bool;

    fn is_cwnd_limited(&self, bytes_in_flight: usize) -> bool;

    fn is_app_limited(&self, bytes_in_flight: usize) -> bool {
        !self.is_cwnd_limited(bytes_in_flight)
    }

    fn pacing_rate(
        &self, bytes_in_flight: usize, rtt_stats: &RttStats,
    ) -> Bandwidth;

    fn bandwidth_estimate(&self, rtt_stats: &RttStats) -> Bandwidth;

    fn update_mss(&mut self, new_mss: usize);

    fn on_app_limited(&mut self, _bytes_in_flight: usize) {}
}
