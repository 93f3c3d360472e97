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

//! Round-trip time estimates consumed by the pacer and the ACK manager.
//!
//! The components in this crate only read these estimates; the connection's
//! loss-recovery machinery owns the samples and feeds them in.

use std::time::Duration;
use std::time::Instant;

pub(crate) const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Round-trip time estimates for a connection.
pub struct RttStats {
    /// The most recent RTT sample.
    pub latest_rtt: Duration,

    /// The exponentially weighted smoothed RTT, unset until the first
    /// sample.
    pub smoothed_rtt: Option<Duration>,

    /// The mean deviation of RTT samples.
    pub rttvar: Duration,

    /// The smallest RTT sample observed.
    min_rtt: Duration,

    /// The maximum delay the peer may add to its acknowledgments.
    pub max_ack_delay: Duration,
}

impl RttStats {
    pub fn new(max_ack_delay: Duration) -> Self {
        RttStats {
            latest_rtt: Duration::ZERO,
            smoothed_rtt: None,
            rttvar: INITIAL_RTT / 2,
            min_rtt: Duration::ZERO,
            max_ack_delay,
        }
    }

    /// Folds a new RTT sample into the estimates.
    pub fn update_rtt(
        &mut self, latest_rtt: Duration, ack_delay: Duration, _now: Instant,
    ) {
        self.latest_rtt = latest_rtt;

        match self.smoothed_rtt {
            // First sample seeds everything.
            None => {
                self.min_rtt = latest_rtt;
                self.smoothed_rtt = Some(latest_rtt);
                self.rttvar = latest_rtt / 2;
            },

            Some(srtt) => {
                self.min_rtt = self.min_rtt.min(latest_rtt);

                let ack_delay = self.max_ack_delay.min(ack_delay);

                // Only adjust for the peer's ack delay when doing so cannot
                // push the sample below the minimum.
                let adjusted_rtt = if latest_rtt > self.min_rtt + ack_delay {
                    latest_rtt - ack_delay
                } else {
                    latest_rtt
                };

                let abs_difference = srtt
                    .saturating_sub(adjusted_rtt)
                    .max(adjusted_rtt.saturating_sub(srtt));

                self.rttvar = self.rttvar.mul_f64(3.0 / 4.0) +
                    abs_difference.mul_f64(1.0 / 4.0);

                self.smoothed_rtt = Some(
                    srtt.mul_f64(7.0 / 8.0) + adjusted_rtt.mul_f64(1.0 / 8.0),
                );
            },
        }
    }

    /// The smoothed RTT, or the conventional initial value before any
    /// sample arrived.
    pub fn rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(INITIAL_RTT)
    }

    /// The minimum RTT, if any sample has been observed.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt.ne(&Duration::ZERO).then_some(self.min_rtt)
    }
}
