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

//! Packet pacing on top of an injected congestion controller.
//!
//! The controller decides *how much* may be in flight; the [`Pacer`]
//! spreads those sends over time so the congestion window leaves as a
//! smooth stream instead of a line-rate burst. Bursts are still allowed
//! where they are harmless: at connection start, when leaving quiescence,
//! and in small "lumpy" batches that avoid waking the sender for every
//! single packet.

use std::time::Duration;
use std::time::Instant;

use crate::bandwidth::Bandwidth;
use crate::congestion::Acked;
use crate::congestion::CongestionControl;
use crate::congestion::Lost;
use crate::rtt::RttStats;
use crate::Config;

/// When the pacer thinks the next packet may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The packet may be sent immediately.
    Now,

    /// The packet should be held for the given delay.
    After(Duration),

    /// The congestion controller does not allow sending at all; pacing
    /// does not apply until it does.
    Blocked,
}

/// Pacing decorator around a [`CongestionControl`] implementation.
///
/// `Pacer` implements [`CongestionControl`] itself, forwarding every
/// congestion query to the wrapped sender, so callers interact with a
/// single object for both admission and timing.
#[derive(Debug)]
pub struct Pacer<T> {
    /// Whether release decisions are made at all.
    enabled: bool,

    /// Underlying sender.
    sender: T,

    /// The maximum rate the pacer will use, if throttled.
    max_pacing_rate: Option<Bandwidth>,

    /// Number of unpaced packets to be sent before packets are delayed.
    burst_tokens: usize,

    initial_burst_size: usize,

    /// Number of unpaced packets to be sent before packets are delayed.
    /// Consumed after `burst_tokens` ran out.
    lumpy_tokens: usize,

    lumpy_pacing_size: usize,
    lumpy_pacing_cwnd_fraction: f64,
    lumpy_pacing_min_bandwidth: Bandwidth,

    /// Sends scheduled within this much of the ideal time go out
    /// immediately instead of being split into sub-granular delays.
    granularity: Duration,

    /// When the next packet should ideally leave. Unset while bursting.
    ideal_next_packet_send_time: Option<Instant>,

    /// Whether the last release query had to delay the caller.
    was_last_send_delayed: bool,

    /// Whether pacing throttled the previous send. If false, no send-time
    /// debt is carried forward.
    pacing_limited: bool,
}

impl<T: CongestionControl> Pacer<T> {
    /// Creates a pacer around `sender`, configured from `config`.
    pub fn new(config: &Config, sender: T) -> Self {
        Pacer {
            enabled: config.pacing,
            sender,
            max_pacing_rate: config
                .max_pacing_rate
                .map(Bandwidth::from_bytes_per_second),
            burst_tokens: config.initial_burst_packets,
            initial_burst_size: config.initial_burst_packets,
            lumpy_tokens: 0,
            lumpy_pacing_size: config.lumpy_pacing_size,
            lumpy_pacing_cwnd_fraction: config.lumpy_pacing_cwnd_fraction,
            lumpy_pacing_min_bandwidth: config.lumpy_pacing_min_bandwidth,
            granularity: config.pacing_granularity,
            ideal_next_packet_send_time: None,
            was_last_send_delayed: false,
            pacing_limited: false,
        }
    }

    /// Decides whether the next packet may leave now, and if not, how long
    /// it must be held.
    ///
    /// Timing is deadline-based: a delayed caller is expected to ask again
    /// once the delay elapsed, at which point the answer collapses to
    /// [`Release::Now`].
    pub fn time_until_send(
        &mut self, now: Instant, bytes_in_flight: usize,
    ) -> Release {
        if !self.sender.can_send(bytes_in_flight) {
            return Release::Blocked;
        }

        if !self.enabled || self.burst_tokens > 0 || bytes_in_flight == 0 {
            // Sending is still unpaced: either a burst allowance remains, or
            // the connection is leaving quiescence with a make-up send.
            return Release::Now;
        }

        match self.ideal_next_packet_send_time {
            Some(ideal) if ideal > now + self.granularity => {
                self.was_last_send_delayed = true;
                Release::After(ideal - now)
            },

            _ => Release::Now,
        }
    }

    /// A reference to the wrapped congestion controller.
    pub fn sender(&self) -> &T {
        &self.sender
    }

    /// A mutable reference to the wrapped congestion controller.
    pub fn sender_mut(&mut self) -> &mut T {
        &mut self.sender
    }

    /// Remaining unpaced startup/quiescence burst allowance.
    pub fn burst_tokens(&self) -> usize {
        self.burst_tokens
    }

    /// Remaining unpaced batch allowance.
    pub fn lumpy_tokens(&self) -> usize {
        self.lumpy_tokens
    }

    /// The earliest instant the next packet should ideally leave, if
    /// pacing currently constrains it.
    pub fn ideal_next_packet_send_time(&self) -> Option<Instant> {
        self.ideal_next_packet_send_time
    }

    /// Whether the last release query delayed the caller.
    pub fn was_last_send_delayed(&self) -> bool {
        self.was_last_send_delayed
    }
}

impl<T: CongestionControl> CongestionControl for Pacer<T> {
    fn get_congestion_window(&self) -> usize {
        self.sender.get_congestion_window()
    }

    fn get_congestion_window_in_packets(&self) -> usize {
        self.sender.get_congestion_window_in_packets()
    }

    fn can_send(&self, bytes_in_flight: usize) -> bool {
        self.sender.can_send(bytes_in_flight)
    }

    fn on_packet_sent(
        &mut self, sent_time: Instant, bytes_in_flight: usize,
        packet_number: u64, bytes: usize, is_retransmissible: bool,
        rtt_stats: &RttStats,
    ) {
        self.sender.on_packet_sent(
            sent_time,
            bytes_in_flight,
            packet_number,
            bytes,
            is_retransmissible,
            rtt_stats,
        );

        if !self.enabled || !is_retransmissible {
            return;
        }

        // If in recovery, the connection is not coming out of quiescence.
        if bytes_in_flight == 0 && !self.sender.is_in_recovery() {
            // Leaving quiescence: allow a fresh burst, capped at the current
            // CWND in packets, and forget any accumulated pacing debt so
            // idle time is not "made up" with a line-rate blast.
            self.burst_tokens = self
                .initial_burst_size
                .min(self.sender.get_congestion_window_in_packets());

            self.ideal_next_packet_send_time = None;
            self.was_last_send_delayed = false;

            trace!(
                "leaving quiescence burst_tokens={} pkt={}",
                self.burst_tokens,
                packet_number
            );
        }

        if self.burst_tokens > 0 {
            self.burst_tokens -= 1;
            self.ideal_next_packet_send_time = None;
            self.was_last_send_delayed = false;
            self.pacing_limited = false;
            return;
        }

        // The next packet should be sent as soon as the current packet has
        // been transferred. The pacing rate is based on the bytes in flight
        // including this packet.
        let delay = self
            .pacing_rate(bytes_in_flight + bytes, rtt_stats)
            .transfer_time(bytes);

        if !self.pacing_limited || self.lumpy_tokens == 0 {
            // Reset lumpy_tokens if either application or cwnd throttled
            // sending, or the batch ran out.
            self.lumpy_tokens = 1.max(self.lumpy_pacing_size.min(
                (self.sender.get_congestion_window_in_packets() as f64 *
                    self.lumpy_pacing_cwnd_fraction)
                    as usize,
            ));

            if self.sender.bandwidth_estimate(rtt_stats) <
                self.lumpy_pacing_min_bandwidth
            {
                // On a slow path one full-sized packet is already a sizable
                // chunk of queueing delay, so release one at a time.
                self.lumpy_tokens = 1;
            }

            if bytes_in_flight + bytes >= self.sender.get_congestion_window() {
                // CWND-limited: no batching on top of the window edge.
                self.lumpy_tokens = 1;
            }
        }

        self.lumpy_tokens -= 1;

        let base = match self.ideal_next_packet_send_time {
            Some(ideal) => ideal.max(sent_time),
            None => sent_time,
        };

        self.ideal_next_packet_send_time = Some(base + delay);

        // Stop making up for lost time if the underlying sender prevents
        // sending.
        self.pacing_limited = self.sender.can_send(bytes_in_flight + bytes);
        self.was_last_send_delayed = false;
    }

    fn on_congestion_event(
        &mut self, rtt_updated: bool, prior_in_flight: usize,
        bytes_in_flight: usize, event_time: Instant, acked_packets: &[Acked],
        lost_packets: &[Lost], least_unacked: u64, rtt_stats: &RttStats,
    ) {
        self.sender.on_congestion_event(
            rtt_updated,
            prior_in_flight,
            bytes_in_flight,
            event_time,
            acked_packets,
            lost_packets,
            least_unacked,
            rtt_stats,
        );

        if !self.enabled {
            return;
        }

        if !lost_packets.is_empty() {
            // Clear any burst tokens when entering recovery.
            self.burst_tokens = 0;

            trace!("burst tokens cleared after {} losses", lost_packets.len());
        }

        if let Some(max_pacing_rate) = self.max_pacing_rate {
            if rtt_updated {
                let max_rate = max_pacing_rate * 1.25;
                let max_cwnd = max_rate.to_bytes_per_period(rtt_stats.rtt());
                self.sender.limit_cwnd(max_cwnd as usize);
            }
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.sender.on_retransmission_timeout(packets_retransmitted)
    }

    fn limit_cwnd(&mut self, max_cwnd: usize) {
        self.sender.limit_cwnd(max_cwnd)
    }

    fn is_in_recovery(&self) -> bool {
        self.sender.is_in_recovery()
    }

    fn is_cwnd_limited(&self, bytes_in_flight: usize) -> bool {
        !self.pacing_limited && self.sender.is_cwnd_limited(bytes_in_flight)
    }

    fn pacing_rate(
        &self, bytes_in_flight: usize, rtt_stats: &RttStats,
    ) -> Bandwidth {
        let sender_rate = self.sender.pacing_rate(bytes_in_flight, rtt_stats);

        match self.max_pacing_rate {
            Some(rate) if self.enabled => rate.min(sender_rate),
            _ => sender_rate,
        }
    }

    fn bandwidth_estimate(&self, rtt_stats: &RttStats) -> Bandwidth {
        self.sender.bandwidth_estimate(rtt_stats)
    }

    fn on_app_limited(&mut self, bytes_in_flight: usize) {
        // The application, not the network, is the bottleneck: carry no
        // pacing debt forward.
        self.pacing_limited = false;
        self.sender.on_app_limited(bytes_in_flight);
    }

    fn update_mss(&mut self, new_mss: usize) {
        self.sender.update_mss(new_mss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: usize = 1200;

    /// A fixed-behavior sender driving the pacer in isolation.
    #[derive(Debug)]
    struct TestSender {
        cwnd: usize,
        pacing_rate: Bandwidth,
        in_recovery: bool,
        lost_seen: usize,
        limited_cwnd: Option<usize>,
    }

    impl TestSender {
        fn new(cwnd_packets: usize, pacing_rate: Bandwidth) -> Self {
            TestSender {
                cwnd: cwnd_packets * MSS,
                pacing_rate,
                in_recovery: false,
                lost_seen: 0,
                limited_cwnd: None,
            }
        }
    }

    impl CongestionControl for TestSender {
        fn get_congestion_window(&self) -> usize {
            self.cwnd
        }

        fn get_congestion_window_in_packets(&self) -> usize {
            self.cwnd / MSS
        }

        fn can_send(&self, bytes_in_flight: usize) -> bool {
            bytes_in_flight < self.cwnd
        }

        fn on_packet_sent(
            &mut self, _sent_time: Instant, _bytes_in_flight: usize,
            _packet_number: u64, _bytes: usize, _is_retransmissible: bool,
            _rtt_stats: &RttStats,
        ) {
        }

        fn on_congestion_event(
            &mut self, _rtt_updated: bool, _prior_in_flight: usize,
            _bytes_in_flight: usize, _event_time: Instant,
            _acked_packets: &[Acked], lost_packets: &[Lost],
            _least_unacked: u64, _rtt_stats: &RttStats,
        ) {
            self.lost_seen += lost_packets.len();
        }

        fn on_retransmission_timeout(&mut self, _packets_retransmitted: bool) {}

        fn limit_cwnd(&mut self, max_cwnd: usize) {
            self.limited_cwnd = Some(max_cwnd);
        }

        fn is_in_recovery(&self) -> bool {
            self.in_recovery
        }

        fn is_cwnd_limited(&self, bytes_in_flight: usize) -> bool {
            bytes_in_flight >= self.cwnd
        }

        fn pacing_rate(
            &self, _bytes_in_flight: usize, _rtt_stats: &RttStats,
        ) -> Bandwidth {
            self.pacing_rate
        }

        fn bandwidth_estimate(&self, _rtt_stats: &RttStats) -> Bandwidth {
            self.pacing_rate
        }

        fn update_mss(&mut self, _new_mss: usize) {}

        fn on_app_limited(&mut self, _bytes_in_flight: usize) {}
    }

    fn one_packet_per_ms() -> Bandwidth {
        Bandwidth::from_bytes_and_time_delta(MSS, Duration::from_millis(1))
    }

    fn send(
        pacer: &mut Pacer<TestSender>, now: Instant, bytes_in_flight: usize,
        pkt: u64, rtt: &RttStats,
    ) {
        pacer.on_packet_sent(now, bytes_in_flight, pkt, MSS, true, rtt);
    }

    #[test]
    fn disabled_pacer_never_delays() {
        let mut config = Config::new();
        config.enable_pacing(false);

        let mut pacer =
            Pacer::new(&config, TestSender::new(10, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        for i in 0..20 {
            assert_eq!(
                pacer.time_until_send(now, i * MSS),
                Release::Now,
                "packet {i}"
            );
            send(&mut pacer, now, i * MSS, i as u64, &rtt);
        }
    }

    #[test]
    fn blocked_when_window_full() {
        let config = Config::new();
        let mut pacer =
            Pacer::new(&config, TestSender::new(10, one_packet_per_ms()));

        let now = Instant::now();

        assert_eq!(pacer.time_until_send(now, 10 * MSS), Release::Blocked);
    }

    #[test]
    fn ideal_send_time_is_monotonic() {
        let mut config = Config::new();
        config.set_initial_burst_packets(0);

        let mut pacer =
            Pacer::new(&config, TestSender::new(100, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);

        let start = Instant::now();
        let mut last_ideal = None;

        // Non-decreasing sent times, including repeats.
        let offsets_ms = [0u64, 0, 1, 1, 3, 3, 3, 10];

        for (i, off) in offsets_ms.iter().enumerate() {
            let now = start + Duration::from_millis(*off);
            send(&mut pacer, now, (i + 1) * MSS, i as u64, &rtt);

            let ideal = pacer.ideal_next_packet_send_time().unwrap();
            if let Some(last) = last_ideal {
                assert!(ideal >= last, "ideal send time regressed at {i}");
            }
            assert!(ideal >= now);

            last_ideal = Some(ideal);
        }
    }

    #[test]
    fn burst_then_pace() {
        let mut config = Config::new();
        config.set_initial_burst_packets(0);

        let mut pacer =
            Pacer::new(&config, TestSender::new(10, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        // First attempt is the make-up send out of quiescence.
        assert_eq!(pacer.time_until_send(now, 0), Release::Now);
        send(&mut pacer, now, 0, 0, &rtt);

        // Second attempt is within one granularity of the ideal time.
        assert_eq!(pacer.time_until_send(now, MSS), Release::Now);
        send(&mut pacer, now, MSS, 1, &rtt);

        // Third consecutive attempt without elapsed time pays the full
        // accumulated delay.
        assert_eq!(
            pacer.time_until_send(now, 2 * MSS),
            Release::After(Duration::from_millis(2))
        );
        assert!(pacer.was_last_send_delayed());
    }

    #[test]
    fn initial_burst_is_unpaced() {
        let config = Config::new();
        let mut pacer =
            Pacer::new(&config, TestSender::new(100, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        // The configured default of 10 burst tokens, all immediate.
        for i in 0..10 {
            assert_eq!(pacer.time_until_send(now, i * MSS), Release::Now);
            send(&mut pacer, now, i * MSS, i as u64, &rtt);
        }

        assert_eq!(pacer.burst_tokens(), 0);
        assert!(pacer.ideal_next_packet_send_time().is_none());
    }

    #[test]
    fn loss_clears_burst_tokens() {
        let config = Config::new();
        let mut pacer =
            Pacer::new(&config, TestSender::new(10, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        assert_eq!(pacer.burst_tokens(), 10);

        let lost = [Lost {
            packet_number: 0,
            bytes_lost: MSS,
        }];

        pacer.on_congestion_event(false, MSS, 0, now, &[], &lost, 1, &rtt);

        assert_eq!(pacer.burst_tokens(), 0);
        assert_eq!(pacer.sender().lost_seen, 1);
    }

    #[test]
    fn quiescence_replenishes_burst() {
        let mut config = Config::new();
        config.set_initial_burst_packets(10);

        // CWND of 4 packets caps the quiescence burst below the configured
        // initial size.
        let mut pacer =
            Pacer::new(&config, TestSender::new(4, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        let lost = [Lost {
            packet_number: 0,
            bytes_lost: MSS,
        }];
        pacer.on_congestion_event(false, MSS, 0, now, &[], &lost, 1, &rtt);
        assert_eq!(pacer.burst_tokens(), 0);

        // Everything acked; next send leaves quiescence.
        send(&mut pacer, now, 0, 1, &rtt);

        // One token was spent on the packet itself.
        assert_eq!(pacer.burst_tokens(), 3);
    }

    #[test]
    fn lumpy_tokens_follow_cwnd_fraction() {
        let mut config = Config::new();
        config.set_initial_burst_packets(0);

        // 25% of a 100-packet window is far above the lumpy size cap of 2.
        let mut pacer =
            Pacer::new(&config, TestSender::new(100, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        send(&mut pacer, now, MSS, 0, &rtt);

        // The refill granted 2 tokens and the send consumed one.
        assert_eq!(pacer.lumpy_tokens(), 1);
    }

    #[test]
    fn no_lumpy_batch_on_slow_paths() {
        let mut config = Config::new();
        config.set_initial_burst_packets(0);

        // 1 Mbps estimate is below the 1.2 Mbps lumpy floor.
        let slow = Bandwidth::from_kbits_per_second(1_000);
        let mut pacer = Pacer::new(&config, TestSender::new(100, slow));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        send(&mut pacer, now, MSS, 0, &rtt);

        assert_eq!(pacer.lumpy_tokens(), 0);
    }

    #[test]
    fn max_pacing_rate_caps_sender_rate() {
        let mut config = Config::new();
        config.set_max_pacing_rate(Some(MSS as u64 * 500));

        let mut pacer =
            Pacer::new(&config, TestSender::new(10, one_packet_per_ms()));
        let mut rtt = RttStats::new(Duration::ZERO);

        // Sender asks for 1 packet/ms, the cap allows half that.
        let capped = pacer.pacing_rate(0, &rtt);
        assert_eq!(capped, Bandwidth::from_bytes_per_second(MSS as u64 * 500));

        // A fresh RTT sample also caps the sender's window at what the
        // throttled rate can move in one round trip (plus 25% slack).
        rtt.update_rtt(
            Duration::from_millis(100),
            Duration::ZERO,
            Instant::now(),
        );
        pacer.on_congestion_event(
            true,
            MSS,
            0,
            Instant::now(),
            &[],
            &[],
            1,
            &rtt,
        );

        let max_rate =
            Bandwidth::from_bytes_per_second(MSS as u64 * 500) * 1.25;
        let expected =
            max_rate.to_bytes_per_period(Duration::from_millis(100)) as usize;

        assert_eq!(pacer.sender().limited_cwnd, Some(expected));
    }

    #[test]
    fn app_limited_clears_pacing_debt() {
        let mut config = Config::new();
        config.set_initial_burst_packets(0);

        let mut pacer =
            Pacer::new(&config, TestSender::new(100, one_packet_per_ms()));
        let rtt = RttStats::new(Duration::ZERO);
        let now = Instant::now();

        // The send leaves the pacer pacing-limited, which masks the
        // sender's own cwnd-limited signal.
        send(&mut pacer, now, MSS, 0, &rtt);
        assert!(!pacer.is_cwnd_limited(100 * MSS));

        pacer.on_app_limited(MSS);

        // With the pacing-limited latch cleared, cwnd-limited reporting is
        // back in the sender's hands.
        assert!(pacer.is_cwnd_limited(100 * MSS));
    }
}
