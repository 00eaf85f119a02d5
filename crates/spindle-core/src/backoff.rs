use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Defaults shared by the selection policies.
pub const DEFAULT_INITIAL_SLEEP: Duration = Duration::from_millis(300);
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(3);
pub const DEFAULT_TIME_TO_RESET: Duration = Duration::from_secs(10);
pub const DEFAULT_GROWTH: f64 = 2.0;

struct State {
    current_sleep: Duration,
    last_sleep: Option<Instant>,
}

/// An exponentially-growing sleep with a time-based reset.
///
/// Each call sleeps the current duration and then multiplies it by the
/// growth factor, capped at the maximum. If the backoff has been idle for
/// longer than the reset threshold, the sleep drops back to the initial
/// duration. Bookkeeping happens under a mutex that is released before
/// sleeping, so concurrent callers never serialise on the sleep itself.
pub struct Backoff {
    initial_sleep: Duration,
    max_sleep: Duration,
    time_to_reset: Duration,
    growth: f64,
    state: Mutex<State>,
}

impl Backoff {
    pub fn new(
        initial_sleep: Duration,
        max_sleep: Duration,
        time_to_reset: Duration,
        growth: f64,
    ) -> Self {
        Self {
            initial_sleep,
            max_sleep,
            time_to_reset,
            growth,
            state: Mutex::new(State {
                current_sleep: initial_sleep,
                last_sleep: None,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_INITIAL_SLEEP,
            DEFAULT_MAX_SLEEP,
            DEFAULT_TIME_TO_RESET,
            DEFAULT_GROWTH,
        )
    }

    /// Sleeps for the current backoff duration and grows it for the next
    /// caller.
    pub async fn wait_a_bit(&self) {
        let time_to_sleep = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let mut time_to_sleep = state.current_sleep;
            let idle_past_reset = state
                .last_sleep
                .is_none_or(|last| now.duration_since(last) > self.time_to_reset);
            if idle_past_reset {
                time_to_sleep = self.initial_sleep;
            }
            state.last_sleep = Some(now);
            let grown = time_to_sleep.mul_f64(self.growth);
            state.current_sleep = if grown > self.max_sleep {
                self.max_sleep
            } else {
                grown
            };
            time_to_sleep
        };

        trace!("backing off for {:?}", time_to_sleep);
        tokio::time::sleep(time_to_sleep).await;
    }

    #[cfg(test)]
    fn current_sleep(&self) -> Duration {
        self.state.lock().current_sleep
    }
}
