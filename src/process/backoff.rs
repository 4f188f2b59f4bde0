use rand::Rng;
use std::time::{Duration, Instant};

/// Per-child restart state implementing the exponential backoff policy.
///
/// The delay grows by `backoff` on every restart, is clamped to
/// `max_delay`, and collapses back to `initial_delay` once the child has
/// stayed alive for at least `reset_interval`. Every returned delay carries
/// a uniform jitter of up to ±10% so that a cluster-wide crash does not
/// produce a thundering herd of simultaneous restarts.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial_delay: u32,
    max_delay: u32,
    backoff: f64,
    reset_interval: u32,
    current: f64,
    last_start: Option<Instant>,
}

impl RestartBackoff {
    pub fn new(initial_delay: u32, max_delay: u32, backoff: f64, reset_interval: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff,
            reset_interval,
            current: f64::from(initial_delay),
            last_start: None,
        }
    }

    /// State for a command that failed construction and can never launch.
    pub fn unset() -> Self {
        Self::new(0, 0, 0.0, 0)
    }

    /// Compute the delay for the next restart and advance the backoff.
    ///
    /// A child that has been alive at least `reset_interval` restarts from
    /// `initial_delay` again. The `max(1.0)` guard makes the backoff grow
    /// even when the current delay is zero.
    pub fn get_and_update(&mut self, now: Instant) -> u32 {
        let reset = match self.last_start {
            None => true,
            Some(started) => now
                .checked_duration_since(started)
                .map_or(false, |alive| alive.as_secs_f64() >= f64::from(self.reset_interval)),
        };
        if reset {
            self.current = f64::from(self.initial_delay);
        }

        let lo = (-0.1 * self.current).floor() as i64;
        let hi = (0.1 * self.current).ceil() as i64;
        let jitter = rand::thread_rng().gen_range(lo..=hi);
        let delay = (self.current.round() as i64 + jitter).max(0) as u32;

        self.current = (self.backoff * self.current.max(1.0)).min(f64::from(self.max_delay));

        delay
    }

    /// Record a launch. `delay_secs` is the pre-start sleep performed inside
    /// the child, so the effective start time lies that far in the future.
    pub fn record_start(&mut self, now: Instant, delay_secs: u32) {
        self.last_start = Some(now + Duration::from_secs(u64::from(delay_secs)));
    }

    /// Adopt the policy fields of a freshly constructed state while keeping
    /// the in-flight delay and start time, clamping the delay into the new
    /// `[initial_delay, max_delay]` bounds.
    pub fn update_policy(&mut self, other: &RestartBackoff) {
        self.initial_delay = other.initial_delay;
        self.max_delay = other.max_delay;
        self.backoff = other.backoff;
        self.reset_interval = other.reset_interval;

        self.current = self.current.min(f64::from(self.max_delay));
        self.current = self.current.max(f64::from(self.initial_delay));
    }

    /// The pre-jitter delay that the next restart would use.
    pub fn current_delay(&self) -> f64 {
        self.current
    }

    pub fn initial_delay(&self) -> u32 {
        self.initial_delay
    }

    pub fn max_delay(&self) -> u32 {
        self.max_delay
    }
}
