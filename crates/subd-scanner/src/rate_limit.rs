//! I/O pacing against measured capacity
//!
//! A [`RateLimiter`] knows the maximum speed of a device or link and the
//! percentage of it the Sub may use. Readers report the bytes they consumed
//! and pause for however long keeps them under the limit.
//!
//! ## Architecture
//!
//! - Pacing is accounted in chunks of [`CHUNK_LEN`] bytes: a reader only
//!   pauses once a full chunk has been read since its last pause
//! - The limiter is decoupled from the stream it paces; the scanner wraps
//!   files in a [`RateLimitedReader`], the fetcher calls
//!   [`RateLimiter::pace`] per network chunk
//! - While the maximum speed is unknown the limiter never pauses, so the
//!   first full-speed pass can measure it

use std::fmt;
use std::io::Read;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::info;

/// Bytes read between pacing decisions
pub const CHUNK_LEN: u64 = 1024 * 1024;

#[derive(Debug)]
struct RateState {
    max_bytes_per_second: u64,
    speed_percent: u8,
    bytes_since_pause: u64,
    last_pause: Instant,
}

/// Stateful pacing object with a runtime-adjustable speed percentage.
#[derive(Debug)]
pub struct RateLimiter {
    name: &'static str,
    state: Mutex<RateState>,
}

impl RateLimiter {
    /// Creates a limiter. A `max_bytes_per_second` of 0 means "not measured".
    pub fn new(name: &'static str, max_bytes_per_second: u64, speed_percent: u8) -> Self {
        Self {
            name,
            state: Mutex::new(RateState {
                max_bytes_per_second,
                speed_percent: speed_percent.min(100),
                bytes_since_pause: 0,
                last_pause: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn speed_percent(&self) -> u8 {
        self.lock().speed_percent
    }

    /// Sets the usable share of capacity; values above 100 are clamped.
    pub fn set_speed_percent(&self, percent: u8) {
        let percent = percent.min(100);
        self.lock().speed_percent = percent;
        info!(limiter = self.name, percent, "Speed limit changed");
    }

    /// Measured capacity in bytes per second, 0 if unknown.
    pub fn max_bytes_per_second(&self) -> u64 {
        self.lock().max_bytes_per_second
    }

    pub fn is_calibrated(&self) -> bool {
        self.max_bytes_per_second() > 0
    }

    /// Records the measured capacity.
    pub fn set_max_bytes_per_second(&self, bytes_per_second: u64) {
        let mut state = self.lock();
        state.max_bytes_per_second = bytes_per_second;
        state.bytes_since_pause = 0;
        state.last_pause = Instant::now();
        info!(
            limiter = self.name,
            max = %format_bytes_per_second(bytes_per_second),
            "Maximum speed set"
        );
    }

    /// Accounts for `bytes` just read and returns how long to pause.
    pub fn account(&self, bytes: u64) -> Duration {
        self.account_at(bytes, Instant::now())
    }

    /// [`RateLimiter::account`] against an explicit clock reading.
    pub fn account_at(&self, bytes: u64, now: Instant) -> Duration {
        let mut state = self.lock();
        if state.speed_percent >= 100 || state.max_bytes_per_second == 0 {
            return Duration::ZERO;
        }
        state.bytes_since_pause += bytes;
        if state.bytes_since_pause < CHUNK_LEN {
            return Duration::ZERO;
        }
        let allowed_per_second =
            (state.max_bytes_per_second * u64::from(state.speed_percent) / 100).max(1);
        let budget = Duration::from_secs_f64(state.bytes_since_pause as f64 / allowed_per_second as f64);
        let target = state.last_pause + budget;
        let pause = target.saturating_duration_since(now);
        state.bytes_since_pause = 0;
        state.last_pause = now + pause;
        pause
    }

    /// Accounts for `bytes` and sleeps the current thread as required.
    pub fn pace_blocking(&self, bytes: u64) {
        let pause = self.account(bytes);
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }

    /// Accounts for `bytes` and suspends the current task as required.
    pub async fn pace(&self, bytes: u64) {
        let pause = self.account(bytes);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    /// Wraps a reader so every read is paced by this limiter.
    pub fn reader<R: Read>(&self, inner: R) -> RateLimitedReader<'_, R> {
        RateLimitedReader {
            limiter: self,
            inner,
        }
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        let limit = state.max_bytes_per_second * u64::from(state.speed_percent) / 100;
        write!(
            f,
            "max speed={} limit={}% {}",
            format_bytes_per_second(state.max_bytes_per_second),
            state.speed_percent,
            format_bytes_per_second(limit)
        )
    }
}

/// Human-readable speed with a unit chosen to keep the number above 100.
pub fn format_bytes_per_second(bps: u64) -> String {
    if bps >> 30 > 100 {
        format!("{} GiB/s", bps >> 30)
    } else if bps >> 20 > 100 {
        format!("{} MiB/s", bps >> 20)
    } else if bps >> 10 > 100 {
        format!("{} KiB/s", bps >> 10)
    } else {
        format!("{bps} B/s")
    }
}

/// Blocking reader paced by a [`RateLimiter`].
pub struct RateLimitedReader<'a, R> {
    limiter: &'a RateLimiter,
    inner: R,
}

impl<R: Read> Read for RateLimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.limiter.pace_blocking(n as u64);
        }
        Ok(n)
    }
}
