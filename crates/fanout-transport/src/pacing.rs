//! # Rate Shaper
//!
//! Token-bucket pacing for multicast emission. One shaper is shared by the
//! sender's multicast path and all of its retransmission workers, so total
//! egress — original and repair traffic together — stays under the
//! configured rate.
//!
//! The bucket refills continuously from a monotonic clock and is debited
//! by packet size. A caller that finds the bucket short sleeps for exactly
//! the time the deficit takes to accumulate, then re-checks; there are no
//! timers, signals, or background threads.

use quanta::Instant;
use std::sync::Mutex;
use std::time::Duration;

/// Refill granularity: deficits smaller than one interval still sleep a
/// full interval, matching the bucket's token quantum.
const TOKEN_INTERVAL: Duration = Duration::from_micros(200);

/// Burst window: the bucket never holds more than this much send credit.
const BURST_WINDOW_SECS: f64 = 0.005;

struct BucketState {
    /// Configured rate in bytes per second. Zero disables shaping.
    rate: f64,
    /// Current send credit in bytes.
    tokens: f64,
    /// Burst ceiling in bytes (`rate × 5 ms` plus one refill quantum).
    volume: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.volume);
    }
}

/// Shared token-bucket rate shaper.
pub struct RateShaper {
    state: Mutex<BucketState>,
}

impl RateShaper {
    /// Create a shaper limited to `rate_bps` bits per second.
    /// A rate of zero (or less) disables shaping entirely.
    pub fn new(rate_bps: f64) -> Self {
        let shaper = RateShaper {
            state: Mutex::new(BucketState {
                rate: 0.0,
                tokens: 0.0,
                volume: 0.0,
                last_refill: Instant::now(),
            }),
        };
        shaper.set_rate(rate_bps);
        shaper
    }

    /// Reconfigure the rate. Takes effect on the next `retrieve`.
    pub fn set_rate(&self, rate_bps: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let rate = (rate_bps / 8.0).max(0.0);
        let token_unit = rate * TOKEN_INTERVAL.as_secs_f64();
        state.rate = rate;
        state.volume = rate * BURST_WINDOW_SECS + token_unit;
        state.tokens = state.tokens.min(state.volume);
        state.last_refill = Instant::now();
    }

    /// Current rate in bits per second.
    pub fn rate_bps(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.rate * 8.0
    }

    /// Consume `n_tokens` bytes of send credit, sleeping until the bucket
    /// can cover them. Never blocks on anything but the clock.
    pub fn retrieve(&self, n_tokens: usize) {
        let need = n_tokens as f64;
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.rate <= 0.0 {
                    return;
                }
                state.refill(Instant::now());
                if state.tokens >= need {
                    state.tokens -= need;
                    return;
                }
                let deficit = need - state.tokens;
                Duration::from_secs_f64(deficit / state.rate).max(TOKEN_INTERVAL)
            };
            std::thread::sleep(wait);
        }
    }
}
