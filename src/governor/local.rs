//! In-process token bucket for single-worker deployments.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::GovernorConfig;

const RATE_LIMIT_HOLD: Duration = Duration::from_secs(10);
const MINUTE: Duration = Duration::from_secs(60);

struct LocalState {
    tokens: f64,
    last_refill: Instant,
    requests_this_minute: u32,
    weight_this_minute: f64,
    minute_start: Instant,
    rate_limited_until: Option<Instant>,
}

impl LocalState {
    fn refill(&mut self, now: Instant, config: &GovernorConfig) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(config.max_tokens);
        self.last_refill = now;
    }

    fn roll_minute(&mut self, now: Instant) {
        if now.duration_since(self.minute_start) >= MINUTE {
            self.requests_this_minute = 0;
            self.weight_this_minute = 0.0;
            self.minute_start = now;
        }
    }
}

enum Decision {
    Granted,
    Wait(Duration),
}

/// Process-local token bucket. Same algorithm as the distributed governor,
/// minus the row lock.
pub struct LocalGovernor {
    config: GovernorConfig,
    state: Mutex<LocalState>,
}

impl LocalGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let now = Instant::now();
        let state = Mutex::new(LocalState {
            tokens: config.max_tokens,
            last_refill: now,
            requests_this_minute: 0,
            weight_this_minute: 0.0,
            minute_start: now,
            rate_limited_until: None,
        });
        Self { config, state }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Block until `cost` tokens are available. The lock is never held while
    /// sleeping.
    pub async fn acquire(&self, cost: f64) -> u64 {
        let mut waited_ms: u64 = 0;
        loop {
            let decision = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill(now, &self.config);
                state.roll_minute(now);
                match state.rate_limited_until {
                    Some(until) if until > now => Decision::Wait(until - now),
                    _ => {
                        state.rate_limited_until = None;
                        if state.tokens >= cost {
                            state.tokens -= cost;
                            state.requests_this_minute += 1;
                            state.weight_this_minute += cost;
                            Decision::Granted
                        } else {
                            let wait_secs =
                                ((cost - state.tokens) / self.config.refill_rate).ceil();
                            Decision::Wait(Duration::from_secs_f64(wait_secs.max(1.0)))
                        }
                    }
                }
            };

            match decision {
                Decision::Granted => return waited_ms,
                Decision::Wait(wait) => {
                    tokio::time::sleep(wait).await;
                    waited_ms += wait.as_millis() as u64;
                }
            }
        }
    }

    /// Non-blocking acquire.
    pub async fn try_acquire(&self, cost: f64) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now, &self.config);
        state.roll_minute(now);
        if matches!(state.rate_limited_until, Some(until) if until > now) {
            return false;
        }
        if state.tokens >= cost {
            state.tokens -= cost;
            state.requests_this_minute += 1;
            state.weight_this_minute += cost;
            true
        } else {
            false
        }
    }

    pub async fn report_rate_limited(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.tokens = 0.0;
        state.last_refill = now;
        state.rate_limited_until = Some(now + RATE_LIMIT_HOLD);
    }

    pub async fn adjust_for_response(&self, items_returned: usize) {
        let extra = super::response_weight_extra(items_returned, self.config.default_cost);
        if extra <= 0.0 {
            return;
        }
        let mut state = self.state.lock().await;
        state.tokens = (state.tokens - extra).max(0.0);
        state.weight_this_minute += extra;
    }

    pub async fn available_requests(&self, cost: f64) -> u32 {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now, &self.config);
        state.roll_minute(now);
        if matches!(state.rate_limited_until, Some(until) if until > now) {
            return 0;
        }
        (state.tokens / cost).floor() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GovernorConfig {
        GovernorConfig {
            max_tokens: 100.0,
            refill_rate: 0.67,
            default_cost: 20.0,
            distributed: false,
            state_key: "hyperliquid".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_capacity_then_refill_wait() {
        let governor = LocalGovernor::new(test_config());

        for _ in 0..5 {
            assert_eq!(governor.acquire(20.0).await, 0);
        }

        // Bucket is empty; the sixth acquire waits ceil(20 / 0.67) = 30 s.
        let waited = governor.acquire(20.0).await;
        assert_eq!(waited, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_hold_blocks_acquires() {
        let governor = LocalGovernor::new(test_config());
        governor.report_rate_limited().await;

        assert_eq!(governor.available_requests(20.0).await, 0);

        // 10 s hold, then the drained bucket still has to refill.
        let waited = governor.acquire(20.0).await;
        assert!(waited >= 10_000, "waited only {waited} ms");
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_is_non_blocking() {
        let governor = LocalGovernor::new(test_config());
        for _ in 0..5 {
            assert!(governor.try_acquire(20.0).await);
        }
        assert!(!governor.try_acquire(20.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn response_surcharge_drains_tokens() {
        let governor = LocalGovernor::new(test_config());
        governor.acquire(20.0).await;
        // 100 items → weight 25, 5 beyond the upfront cost.
        governor.adjust_for_response(100).await;
        assert_eq!(governor.available_requests(20.0).await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn available_requests_reflects_bucket() {
        let governor = LocalGovernor::new(test_config());
        assert_eq!(governor.available_requests(20.0).await, 5);
        governor.acquire(20.0).await;
        assert_eq!(governor.available_requests(20.0).await, 4);
    }
}
