use rand::Rng;
use std::time::Duration;

const GROWTH: u32 = 2;

/// Doubling reconnect delay with ±25% jitter, capped at `max`.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, never exceed `max` (before jitter).
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// Next delay to sleep for; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = Duration::try_from_secs_f64(self.current.as_secs_f64() * jitter)
            .unwrap_or(self.max);
        self.current = self.current.saturating_mul(GROWTH).min(self.max);
        delay
    }

    /// Go back to the initial delay after a successful reconnect.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}
