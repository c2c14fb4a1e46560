//! Monotonic timing and the UTC onset stamp shared by the logger and the
//! hardware module interfaces.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

/// Monotonic microsecond timer.
///
/// Wraps [`Instant`] so callers deal in integer microseconds, matching the
/// timestamp unit used on the wire and in the event log.
#[derive(Debug, Clone)]
pub struct MicrosTimer {
    origin: Instant,
}

impl MicrosTimer {
    /// Starts a new timer at the current instant.
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Resets the timer origin to the current instant.
    pub fn reset(&mut self) {
        self.origin = Instant::now();
    }

    /// Microseconds elapsed since construction or the last [`reset`](Self::reset).
    pub fn elapsed_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Busy-waits until `delay_us` microseconds have elapsed since the timer
    /// origin. Sub-millisecond precision; burns a core while waiting.
    pub fn delay_blocking(&self, delay_us: u64) {
        while self.elapsed_us() < delay_us {
            std::hint::spin_loop();
        }
    }

    /// Sleeps until `delay_us` microseconds have elapsed since the timer
    /// origin, yielding the core between coarse sleep slices.
    pub fn delay_cooperative(&self, delay_us: u64) {
        loop {
            let elapsed = self.elapsed_us();
            if elapsed >= delay_us {
                return;
            }
            let remaining = delay_us - elapsed;
            // Sleep in halves so scheduler overshoot cannot push us far past
            // the deadline; the final slice is handled by yielding.
            if remaining > 2_000 {
                thread::sleep(Duration::from_micros(remaining / 2));
            } else {
                thread::yield_now();
            }
        }
    }
}

/// Microseconds elapsed since the UTC epoch, as of the call.
pub fn utc_now_us() -> u64 {
    Utc::now().timestamp_micros() as u64
}

/// The onset stamp persisted as the first entry of every log source:
/// microseconds since the UTC epoch, little-endian.
pub fn utc_onset_bytes() -> [u8; 8] {
    utc_now_us().to_le_bytes()
}

/// Decodes an onset stamp written by [`utc_onset_bytes`].
pub fn decode_onset_bytes(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_monotonic() {
        let timer = MicrosTimer::start();
        let first = timer.elapsed_us();
        let second = timer.elapsed_us();
        assert!(second >= first);
    }

    #[test]
    fn reset_rewinds_origin() {
        let mut timer = MicrosTimer::start();
        timer.delay_cooperative(3_000);
        timer.reset();
        assert!(timer.elapsed_us() < 3_000);
    }

    #[test]
    fn delay_blocking_waits_full_duration() {
        let mut timer = MicrosTimer::start();
        timer.reset();
        timer.delay_blocking(2_000);
        assert!(timer.elapsed_us() >= 2_000);
    }

    #[test]
    fn onset_round_trips() {
        let bytes = utc_onset_bytes();
        let decoded = decode_onset_bytes(&bytes).unwrap();
        // Sanity: the stamp is after 2020-01-01 and within a second of now.
        assert!(decoded > 1_577_836_800_000_000);
        assert!(utc_now_us() - decoded < 1_000_000);
    }
}
