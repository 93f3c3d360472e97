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

//! ⏱ Packet pacing, write scheduling and teardown bookkeeping for QUIC.
//!
//! tempo is a sans-I/O library implementing the timing-sensitive core of a
//! QUIC endpoint's send and teardown path. The application is responsible
//! for sockets and the event loop; tempo answers four questions:
//!
//! - *When may the next packet leave?* [`pacer::Pacer`], wrapping an
//!   injected congestion controller.
//! - *Which stream writes next?* [`scheduler::WriteScheduler`], ordering
//!   write-blocked streams by urgency with fair batching.
//! - *What do stray packets for dead connections get?*
//!   [`timewait::TimeWaitList`], the bounded time-wait registry.
//! - *By when must an ACK go out?* [`ack::AckManager`], tracking received
//!   packets per packet number space.
//!
//! All components are synchronous and single-threaded; "waiting" is always
//! expressed as a returned delay or deadline for the caller's timer.
//!
//! ## Configuration
//!
//! Behavior is tuned through a [`Config`] object passed to each component
//! constructor, instead of process-wide flags:
//!
//! ```
//! let mut config = tempo::Config::new();
//! config.set_initial_burst_packets(6);
//! config.enable_stream_batching(true);
//! ```
//!
//! ## Scheduling stream writes
//!
//! ```
//! use tempo::scheduler::WriteScheduler;
//!
//! let config = tempo::Config::new();
//! let mut scheduler = WriteScheduler::new(&config);
//!
//! scheduler.register_stream(0, false, Default::default())?;
//! scheduler.register_stream(4, false, Default::default())?;
//!
//! scheduler.add_stream(4)?;
//! assert_eq!(scheduler.pop_front(), Ok(4));
//! # Ok::<(), tempo::Error>(())
//! ```
//!
//! ## Tracking received packets
//!
//! ```
//! use std::time::Instant;
//!
//! use tempo::ack::AckManager;
//! use tempo::packet::Epoch;
//! use tempo::packet::ECN_NOT_ECT;
//! use tempo::rtt::RttStats;
//!
//! let config = tempo::Config::new();
//! let mut acks = AckManager::new(&config);
//! let rtt_stats = RttStats::new(std::time::Duration::from_millis(25));
//!
//! let now = Instant::now();
//! acks.record_packet_received(Epoch::Application, 0, now, ECN_NOT_ECT);
//! acks.maybe_update_ack_timeout(true, Epoch::Application, 0, now, &rtt_stats);
//!
//! // The event loop arms its ACK alarm from the earliest deadline.
//! assert!(acks.earliest_ack_timeout().is_some());
//! ```

#[macro_use]
extern crate log;

use std::time::Duration;

pub use crate::error::Error;
pub use crate::error::Result;

use crate::bandwidth::Bandwidth;

/// Stores configuration shared between multiple components.
///
/// Every tunable has a reasonable default; `set_*` methods override them
/// before the configuration is handed to component constructors. A
/// `Config` is immutable as far as the components are concerned: they copy
/// what they need at construction time.
pub struct Config {
    pacing: bool,
    max_pacing_rate: Option<u64>,
    pacing_granularity: Duration,
    initial_burst_packets: usize,
    lumpy_pacing_size: usize,
    lumpy_pacing_cwnd_fraction: f64,
    lumpy_pacing_min_bandwidth: Bandwidth,

    stream_batching: bool,
    stream_batch_size: u64,

    delayed_ack_timeout: Duration,
    ack_frequency: Option<u64>,
    min_received_before_ack_decimation: u64,
    ack_decimation_fraction: f64,
    max_ack_ranges: usize,
    max_ack_receive_timestamps: usize,
    multiple_packet_number_spaces: bool,

    time_wait_ttl: Duration,
    max_time_wait_connections: usize,
    max_pending_time_wait_packets: usize,
    stateless_reset_secret: Option<Vec<u8>>,
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Config {
            pacing: true,
            max_pacing_rate: None,
            pacing_granularity: Duration::from_millis(1),
            initial_burst_packets: 10,
            lumpy_pacing_size: 2,
            lumpy_pacing_cwnd_fraction: 0.25,
            lumpy_pacing_min_bandwidth: Bandwidth::from_kbits_per_second(
                1_200,
            ),

            stream_batching: true,
            stream_batch_size: 16 * 1024,

            delayed_ack_timeout: Duration::from_millis(25),
            ack_frequency: None,
            min_received_before_ack_decimation: 100,
            ack_decimation_fraction: 0.25,
            max_ack_ranges: 68,
            max_ack_receive_timestamps: 32,
            multiple_packet_number_spaces: false,

            time_wait_ttl: Duration::from_secs(200),
            max_time_wait_connections: 600_000,
            max_pending_time_wait_packets: 16,
            stateless_reset_secret: None,
        }
    }

    /// Enables or disables packet pacing.
    ///
    /// The default value is `true`.
    pub fn enable_pacing(&mut self, v: bool) {
        self.pacing = v;
    }

    /// Sets the max value for pacing rate, in bytes per second.
    ///
    /// By default pacing is only limited by the congestion controller.
    pub fn set_max_pacing_rate(&mut self, v: Option<u64>) {
        self.max_pacing_rate = v;
    }

    /// Sets the scheduling granularity below which the pacer releases a
    /// packet immediately rather than splitting hairs.
    ///
    /// The default value is 1 millisecond.
    pub fn set_pacing_granularity(&mut self, v: Duration) {
        self.pacing_granularity = v;
    }

    /// Sets the number of packets sendable without pacing delay at
    /// connection start and when leaving quiescence.
    ///
    /// The default value is 10.
    pub fn set_initial_burst_packets(&mut self, v: usize) {
        self.initial_burst_packets = v;
    }

    /// Sets the maximum number of packets released as one lumpy batch.
    ///
    /// The default value is 2.
    pub fn set_lumpy_pacing_size(&mut self, v: usize) {
        self.lumpy_pacing_size = v;
    }

    /// Sets the fraction of the congestion window a lumpy batch may cover.
    ///
    /// The default value is 0.25.
    pub fn set_lumpy_pacing_cwnd_fraction(&mut self, v: f64) {
        self.lumpy_pacing_cwnd_fraction = v;
    }

    /// Enables or disables batched stream scheduling.
    ///
    /// When enabled, the stream at the head of an urgency class keeps
    /// writing until it wrote a batch worth of bytes; when disabled every
    /// pop round-robins. The default value is `true`.
    pub fn enable_stream_batching(&mut self, v: bool) {
        self.stream_batching = v;
    }

    /// Sets the number of bytes a stream may write before ceding its turn.
    ///
    /// The default value is 16384.
    pub fn set_stream_batch_size(&mut self, v: u64) {
        self.stream_batch_size = v;
    }

    /// Sets the default delayed-ACK timeout.
    ///
    /// The default value is 25 milliseconds.
    pub fn set_delayed_ack_timeout(&mut self, v: Duration) {
        self.delayed_ack_timeout = v;
    }

    /// Acknowledges every `n`th ack-eliciting packet immediately,
    /// disabling ACK decimation.
    ///
    /// By default no explicit frequency is set and decimation applies.
    pub fn set_ack_frequency(&mut self, n: Option<u64>) {
        self.ack_frequency = n;
    }

    /// Sets the packet number past which ACK decimation engages.
    ///
    /// The default value is 100.
    pub fn set_min_received_before_ack_decimation(&mut self, v: u64) {
        self.min_received_before_ack_decimation = v;
    }

    /// Sets the fraction of the minimum RTT that decimated ACKs wait for.
    ///
    /// The default value is 0.25.
    pub fn set_ack_decimation_fraction(&mut self, v: f64) {
        self.ack_decimation_fraction = v;
    }

    /// Sets the maximum number of tracked ACK ranges per packet number
    /// space.
    ///
    /// The default value is 68.
    pub fn set_max_ack_ranges(&mut self, v: usize) {
        self.max_ack_ranges = v;
    }

    /// Sets the maximum number of receive timestamps reported per packet
    /// number space.
    ///
    /// The default value is 32.
    pub fn set_max_ack_receive_timestamps(&mut self, v: usize) {
        self.max_ack_receive_timestamps = v;
    }

    /// Enables independent ACK state per packet number space.
    ///
    /// The default value is `false`, where all spaces share one state.
    pub fn set_multiple_packet_number_spaces(&mut self, v: bool) {
        self.multiple_packet_number_spaces = v;
    }

    /// Sets how long terminated connection IDs stay recognizable.
    ///
    /// The default value is 200 seconds.
    pub fn set_time_wait_ttl(&mut self, v: Duration) {
        self.time_wait_ttl = v;
    }

    /// Sets the maximum number of connections tracked in time-wait; the
    /// oldest entry is evicted beyond it.
    ///
    /// The default value is 600000.
    pub fn set_max_time_wait_connections(&mut self, v: usize) {
        self.max_time_wait_connections = v;
    }

    /// Sets the maximum number of time-wait replies queued while the
    /// writer is blocked; the oldest queued write is dropped beyond it.
    ///
    /// The default value is 16.
    pub fn set_max_pending_time_wait_packets(&mut self, v: usize) {
        self.max_pending_time_wait_packets = v;
    }

    /// Sets the secret used to derive stateless reset tokens from
    /// connection IDs.
    ///
    /// Without a secret, stateless resets are silently skipped.
    pub fn set_stateless_reset_secret(&mut self, secret: &[u8]) {
        self.stateless_reset_secret = Some(secret.to_vec());
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

pub mod ack;
pub mod bandwidth;
pub mod congestion;
mod error;
pub mod pacer;
pub mod packet;
pub mod ranges;
pub mod rtt;
pub mod scheduler;
pub mod timewait;
