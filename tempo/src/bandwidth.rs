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

use std::time::Duration;

const NUM_MICROS_PER_SECOND: u64 = 1_000_000;

/// A transfer rate, stored with bit-per-second granularity.
///
/// Keeping the rate integral avoids the truncation pitfalls of a plain
/// bytes-per-duration division: a nonzero rate always produces a nonzero
/// transfer time for a nonzero amount of bytes.
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone, Copy)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    /// Derives the rate at which `bytes` were moved over `time_delta`.
    pub const fn from_bytes_and_time_delta(
        bytes: usize, time_delta: Duration,
    ) -> Self {
        if bytes == 0 {
            return Bandwidth { bits_per_second: 0 };
        }

        let mut micros = time_delta.as_micros() as u64;
        if micros == 0 {
            micros = 1;
        }

        let num_micro_bits = 8 * bytes as u64 * NUM_MICROS_PER_SECOND;
        if num_micro_bits < micros {
            // Round very slow rates up so they stay observable.
            return Bandwidth { bits_per_second: 1 };
        }

        Bandwidth {
            bits_per_second: num_micro_bits / micros,
        }
    }

    pub const fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: bytes_per_second * 8,
        }
    }

    pub const fn from_kbits_per_second(k_bits_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: k_bits_per_second * 1_000,
        }
    }

    pub const fn from_mbits_per_second(m_bits_per_second: u64) -> Self {
        Bandwidth::from_kbits_per_second(m_bits_per_second * 1_000)
    }

    pub const fn to_bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    pub const fn zero() -> Self {
        Bandwidth { bits_per_second: 0 }
    }

    pub const fn is_zero(self) -> bool {
        self.bits_per_second == 0
    }

    /// How long moving `bytes` takes at this rate.
    ///
    /// A zero rate yields a zero transfer time, leaving the caller's
    /// scheduling unchanged.
    pub fn transfer_time(&self, bytes: usize) -> Duration {
        if self.bits_per_second == 0 {
            return Duration::ZERO;
        }

        Duration::from_micros(
            bytes as u64 * 8 * NUM_MICROS_PER_SECOND / self.bits_per_second,
        )
    }

    /// How many bytes this rate moves over `time_period`.
    pub fn to_bytes_per_period(self, time_period: Duration) -> u64 {
        self.bits_per_second * time_period.as_micros() as u64 /
            8 /
            NUM_MICROS_PER_SECOND
    }
}

impl std::ops::Mul<f64> for Bandwidth {
    type Output = Bandwidth;

    fn mul(self, rhs: f64) -> Self::Output {
        Bandwidth {
            bits_per_second: (self.bits_per_second as f64 * rhs).round() as u64,
        }
    }
}

impl std::fmt::Debug for Bandwidth {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.bits_per_second {
            x if x < 1_000_000 => write!(f, "{:.2} Kbps", x as f64 / 1_000.),
            x if x < 1_000_000_000 => {
                write!(f, "{:.2} Mbps", x as f64 / 1_000_000.)
            },
            x => write!(f, "{:.2} Gbps", x as f64 / 1_000_000_000.),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_time_round_trip() {
        // 1200 bytes per millisecond.
        let rate =
            Bandwidth::from_bytes_and_time_delta(1200, Duration::from_millis(1));

        assert_eq!(rate.to_bits_per_second(), 9_600_000);
        assert_eq!(rate.transfer_time(1200), Duration::from_millis(1));
        assert_eq!(rate.transfer_time(600), Duration::from_micros(500));
    }

    #[test]
    fn slow_rates_are_nonzero() {
        let rate =
            Bandwidth::from_bytes_and_time_delta(1, Duration::from_secs(60));

        assert!(!rate.is_zero());
    }

    #[test]
    fn zero_rate_zero_time() {
        assert_eq!(Bandwidth::zero().transfer_time(1200), Duration::ZERO);
    }

    #[test]
    fn scaling() {
        let rate = Bandwidth::from_kbits_per_second(1_000);

        assert_eq!(rate * 1.25, Bandwidth::from_kbits_per_second(1_250));
        assert_eq!(
            rate.to_bytes_per_period(Duration::from_secs(1)),
            125_000
        );
    }

    #[test]
    fn ordering() {
        assert!(
            Bandwidth::from_kbits_per_second(1_199) <
                Bandwidth::from_kbits_per_second(1_200)
        );
        assert!(
            Bandwidth::from_mbits_per_second(1) ==
                Bandwidth::from_kbits_per_second(1_000)
        );
    }
}
