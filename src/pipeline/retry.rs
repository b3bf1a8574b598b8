use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    llm::{Completion, GenerationError, TextGenerator, approximate_token_count},
    pipeline::rate_limit::RateLimiter,
};

/// Retry knobs for one logical generation call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed for non-throttling failures, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Wait used when the provider throttles without a hint.
    pub throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            throttle_wait: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial_delay.saturating_mul(1_u32 << exponent)
    }
}

/// Wraps a [`TextGenerator`] with the shared rate limiter and the retry policy.
#[derive(Clone)]
pub struct RetryingClient {
    generator: Arc<dyn TextGenerator>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    output_token_budget: u64,
}

impl RetryingClient {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
        output_token_budget: u64,
    ) -> Self {
        Self {
            generator,
            limiter,
            policy,
            output_token_budget,
        }
    }

    fn estimated_cost(&self, prompt: &str) -> u64 {
        approximate_token_count(prompt) as u64 + self.output_token_budget
    }

    /// Generate text for `prompt`, retrying until success or until the failure budget runs out.
    ///
    /// Throttling is retried for as long as the provider keeps asking; it never consumes the
    /// failure budget. Dropping the returned future stops the loop at the next await.
    pub async fn generate(&self, prompt: &str) -> Result<Completion, GenerationError> {
        let cost = self.estimated_cost(prompt);
        let mut failures = 0_u32;
        let mut throttles = 0_u64;

        loop {
            let waited = self.limiter.acquire(cost).await;
            if !waited.is_zero() {
                debug!(
                    waited_ms = waited.as_millis() as u64,
                    cost, "rate limiter delayed generation attempt"
                );
            }

            match self.generator.generate(prompt).await {
                Ok(completion) => {
                    debug!(
                        failures,
                        throttles,
                        tokens = completion.token_usage.total_tokens,
                        "generation attempt succeeded"
                    );
                    return Ok(completion);
                }
                Err(GenerationError::Throttled { retry_after }) => {
                    throttles += 1;
                    let wait = retry_after.unwrap_or(self.policy.throttle_wait);
                    let quota = self.limiter.try_snapshot();
                    warn!(
                        throttles,
                        calls_in_window = quota.map(|q| q.calls_in_window),
                        tokens_available = quota.map(|q| q.tokens_available),
                        wait_ms = wait.as_millis() as u64,
                        hinted = retry_after.is_some(),
                        "generation throttled, waiting before retry"
                    );
                    sleep(wait).await;
                }
                Err(err) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        warn!(
                            ?err,
                            attempt = failures,
                            max_attempts = self.policy.max_attempts,
                            "generation failed, retry budget exhausted"
                        );
                        return Err(err);
                    }

                    let delay = self.policy.backoff_delay(failures);
                    warn!(
                        ?err,
                        attempt = failures,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "generation failed, will retry"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::llm::TokenUsage;

    /// One scripted provider answer.
    #[derive(Debug, Clone)]
    pub enum Reply {
        Echo,
        Throttle(Option<Duration>),
        Fail(&'static str),
    }

    /// Fake provider: answers `A:<prompt>` unless a script says otherwise.
    #[derive(Default)]
    pub struct ScriptedGenerator {
        default_script: Mutex<VecDeque<Reply>>,
        per_prompt: Mutex<HashMap<String, VecDeque<Reply>>>,
        always_fail: Mutex<Vec<String>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_script(replies: impl IntoIterator<Item = Reply>) -> Self {
            let generator = Self::default();
            generator
                .default_script
                .lock()
                .unwrap()
                .extend(replies);
            generator
        }

        pub fn failing_on(self, prompt: &str) -> Self {
            self.always_fail.lock().unwrap().push(prompt.to_string());
            self
        }

        pub fn scripted_for(self, prompt: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
            self.per_prompt
                .lock()
                .unwrap()
                .entry(prompt.to_string())
                .or_default()
                .extend(replies);
            self
        }

        pub fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn next_reply(&self, prompt: &str) -> Reply {
            if self.always_fail.lock().unwrap().iter().any(|p| p == prompt) {
                return Reply::Fail("provider unavailable");
            }
            if let Some(reply) = self
                .per_prompt
                .lock()
                .unwrap()
                .get_mut(prompt)
                .and_then(|queue| queue.pop_front())
            {
                return reply;
            }
            self.default_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Echo)
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<Completion, GenerationError> {
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), Instant::now()));

            match self.next_reply(prompt) {
                Reply::Echo => Ok(Completion {
                    text: format!("A:{prompt}"),
                    token_usage: TokenUsage::default(),
                }),
                Reply::Throttle(retry_after) => Err(GenerationError::Throttled { retry_after }),
                Reply::Fail(message) => Err(GenerationError::Failed(anyhow!(message))),
            }
        }
    }

    pub fn open_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(crate::pipeline::rate_limit::RateLimits {
            max_rpm: 1_000_000,
            max_tpm: u64::MAX,
        }))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::{
        testing::{Reply, ScriptedGenerator, open_limiter},
        *,
    };
    use crate::pipeline::rate_limit::RateLimits;

    fn client(generator: Arc<ScriptedGenerator>) -> RetryingClient {
        RetryingClient::new(generator, open_limiter(), RetryPolicy::default(), 0)
    }

    #[test]
    fn backoff_doubles_from_initial_delay() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=4).map(|n| policy.backoff_delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
        assert_eq!(policy.backoff_delay(200), Duration::from_secs(1 << 31));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_never_consumes_failure_budget() {
        let script = std::iter::repeat_n(Reply::Throttle(None), 12).chain([Reply::Echo]);
        let generator = Arc::new(ScriptedGenerator::with_script(script));
        let started = Instant::now();

        let completion = client(generator.clone()).generate("P1").await.unwrap();

        assert_eq!(completion.text, "A:P1");
        assert_eq!(generator.call_count(), 13);
        assert!(Instant::now().duration_since(started) >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_hint_overrides_default_wait() {
        let generator = Arc::new(ScriptedGenerator::with_script([
            Reply::Throttle(Some(Duration::from_secs(7))),
            Reply::Echo,
        ]));

        client(generator.clone()).generate("P1").await.unwrap();

        let calls = generator.calls();
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(gap >= Duration::from_secs(7) && gap < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_surface_last_error() {
        let generator = Arc::new(ScriptedGenerator::new().failing_on("P1"));
        let started = Instant::now();

        let err = client(generator.clone()).generate("P1").await.unwrap_err();

        assert!(matches!(err, GenerationError::Failed(_)));
        assert!(err.to_string().contains("provider unavailable"));
        assert_eq!(generator.call_count(), 5);

        let calls = generator.calls();
        let gaps: Vec<_> = calls
            .windows(2)
            .map(|pair| pair[1].1.duration_since(pair[0].1).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4, 8]);
        assert!(Instant::now().duration_since(started) < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures_mixed_with_throttles() {
        let generator = Arc::new(ScriptedGenerator::with_script([
            Reply::Fail("boom"),
            Reply::Throttle(None),
            Reply::Fail("boom"),
            Reply::Throttle(None),
            Reply::Fail("boom"),
            Reply::Fail("boom"),
            Reply::Echo,
        ]));

        let completion = client(generator.clone()).generate("P").await.unwrap();
        assert_eq!(completion.text, "A:P");
        assert_eq!(generator.call_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_passes_the_limiter() {
        let generator = Arc::new(ScriptedGenerator::with_script([
            Reply::Throttle(Some(Duration::ZERO)),
            Reply::Throttle(Some(Duration::ZERO)),
            Reply::Echo,
        ]));
        let limiter = Arc::new(RateLimiter::new(RateLimits {
            max_rpm: 2,
            max_tpm: 1_000,
        }));
        let client =
            RetryingClient::new(generator.clone(), limiter.clone(), RetryPolicy::default(), 10);

        client.generate("one two three").await.unwrap();

        let calls = generator.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].1.duration_since(calls[0].1) >= Duration::from_secs(60));
        assert_eq!(limiter.try_snapshot().unwrap().tokens_available, 1_000 - 13);
    }
}
