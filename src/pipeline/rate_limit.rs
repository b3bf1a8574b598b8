use std::{collections::VecDeque, time::Duration};

use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};
use tracing::debug;

const QUOTA_WINDOW: Duration = Duration::from_secs(60);

/// Per-minute quotas shared by every generation call in the process.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub max_rpm: u32,
    pub max_tpm: u64,
}

/// Point-in-time view of the limiter, for logs and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
    pub calls_in_window: usize,
    pub tokens_available: u64,
}

/// Scheduling gate enforcing a rolling call window and a refillable token reservoir.
///
/// Callers queue on a single async mutex, which tokio hands out in FIFO order. The head
/// of the queue keeps the lock while it sleeps, so later callers can never overtake it and
/// every counter update is serialized.
pub struct RateLimiter {
    limits: RateLimits,
    window: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    starts: VecDeque<Instant>,
    reservoir: u64,
    refilled_at: Instant,
}

impl LimiterState {
    fn refill(&mut self, now: Instant, window: Duration, capacity: u64) {
        let elapsed = now.saturating_duration_since(self.refilled_at);
        if elapsed < window {
            return;
        }
        let periods = (elapsed.as_nanos() / window.as_nanos()) as u32;
        self.refilled_at += window * periods;
        self.reservoir = capacity;
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.starts.front() {
            if *front + window <= now {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self::with_window(limits, QUOTA_WINDOW)
    }

    pub fn with_window(limits: RateLimits, window: Duration) -> Self {
        let limits = RateLimits {
            max_rpm: limits.max_rpm.max(1),
            max_tpm: limits.max_tpm.max(1),
        };
        Self {
            limits,
            window,
            state: Mutex::new(LimiterState {
                starts: VecDeque::with_capacity(limits.max_rpm as usize),
                reservoir: limits.max_tpm,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait until one call costing `weight` tokens may start, then account for it.
    ///
    /// Returns how long the caller was held back. A weight above the reservoir size is
    /// charged as the full reservoir.
    pub async fn acquire(&self, weight: u64) -> Duration {
        let requested_at = Instant::now();
        let weight = weight.min(self.limits.max_tpm);
        let mut state = self.state.lock().await;

        loop {
            let now = Instant::now();
            state.refill(now, self.window, self.limits.max_tpm);
            state.prune(now, self.window);

            let rpm_wait = if state.starts.len() >= self.limits.max_rpm as usize {
                state
                    .starts
                    .front()
                    .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            } else {
                None
            };

            let tpm_wait = if state.reservoir < weight {
                Some((state.refilled_at + self.window).saturating_duration_since(now))
            } else {
                None
            };

            match rpm_wait.into_iter().chain(tpm_wait).max() {
                None => {
                    state.starts.push_back(now);
                    state.reservoir -= weight;
                    let waited = now.saturating_duration_since(requested_at);
                    if !waited.is_zero() {
                        debug!(
                            waited_ms = waited.as_millis() as u64,
                            weight,
                            tokens_left = state.reservoir,
                            "rate limiter released call"
                        );
                    }
                    return waited;
                }
                Some(wait) => {
                    sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Current counters, or `None` while a caller is queued on the gate.
    ///
    /// Never waits: the head waiter holds the lock for as long as it sleeps.
    pub fn try_snapshot(&self) -> Option<LimiterSnapshot> {
        let mut state = self.state.try_lock().ok()?;
        let now = Instant::now();
        state.refill(now, self.window, self.limits.max_tpm);
        state.prune(now, self.window);
        Some(LimiterSnapshot {
            calls_in_window: state.starts.len(),
            tokens_available: state.reservoir,
        })
    }
}
