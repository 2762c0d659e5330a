//! Token bucket admission
//!
//! Capacity equals one second of the configured rate. Refill happens
//! lazily on each call from the time elapsed since the previous refill.

use crate::{Result, ShaperError};
use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for tokens
pub const DEFAULT_MAX_WAIT_STEP: Duration = Duration::from_millis(1);

/// Outcome of [`TokenBucket::admit`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Enough tokens were available
    Immediate,
    /// Caller slept this long before being admitted
    Delayed(Duration),
}

impl Admission {
    pub fn waited(&self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Delayed(d) => *d,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.rate);
        self.last_refill = now;
    }
}

/// Token bucket
///
/// `admit` blocks the calling thread until the packet fits. On the capture
/// thread this paces every packet behind it; run one bucket per queue
/// thread if independent pacing is wanted.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_wait_step: Duration,
}

impl TokenBucket {
    /// Create a full bucket refilling at `rate` bytes per second
    pub fn new(rate: u64) -> Result<Self> {
        Self::with_wait_step(rate, DEFAULT_MAX_WAIT_STEP)
    }

    pub fn with_wait_step(rate: u64, max_wait_step: Duration) -> Result<Self> {
        check_rate(rate)?;
        if max_wait_step.is_zero() {
            return Err(ShaperError::InvalidParameter {
                name: "max_wait_step",
                reason: "must be positive".into(),
            });
        }

        let rate = rate as f64;
        Ok(Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate,
                last_refill: Instant::now(),
            }),
            max_wait_step,
        })
    }

    /// Admit `len` bytes, sleeping in bounded steps until they fit.
    ///
    /// A packet larger than the capacity waits for a full bucket and then
    /// empties it.
    pub fn admit(&self, len: usize) -> Admission {
        let start = Instant::now();
        let mut slept = false;

        loop {
            let wait = {
                let mut state = self.state.lock();
                state.refill(Instant::now());

                let need = (len as f64).min(state.rate);
                if state.tokens >= need {
                    state.tokens -= need;
                    break;
                }
                Duration::from_secs_f64((need - state.tokens) / state.rate)
            };

            thread::sleep(wait.min(self.max_wait_step));
            slept = true;
        }

        if slept {
            Admission::Delayed(start.elapsed())
        } else {
            Admission::Immediate
        }
    }

    /// Debit without waiting; `false` leaves the bucket untouched
    pub fn try_admit(&self, len: usize) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now());

        let need = len as f64;
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Change the rate; current tokens are clamped to the new capacity
    pub fn set_rate(&self, rate: u64) -> Result<()> {
        check_rate(rate)?;

        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.rate = rate as f64;
        state.tokens = state.tokens.min(state.rate);
        Ok(())
    }

    /// Bytes per second
    pub fn rate(&self) -> u64 {
        self.state.lock().rate as u64
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens as u64
    }
}

fn check_rate(rate: u64) -> Result<()> {
    if rate == 0 {
        return Err(ShaperError::InvalidParameter {
            name: "rate",
            reason: "must be positive".into(),
        });
    }
    Ok(())
}
