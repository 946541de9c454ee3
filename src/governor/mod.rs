//! Shared token-bucket rate limiter for upstream calls.
//!
//! Every fetch in every worker passes through one governor. The default
//! [`DistributedGovernor`] coordinates through a single row in
//! `rate_limit_state` so the budget holds across processes; the
//! [`LocalGovernor`] is an in-process fallback for single-worker deployments.

mod distributed;
mod local;

pub use distributed::DistributedGovernor;
pub use local::LocalGovernor;

use crate::config::GovernorConfig;
use crate::error::IngestError;
use sqlx::PgPool;

/// Extra weight owed for a response beyond the upfront default cost.
///
/// The upstream prices a request at `20 + items/20` weight, so large
/// responses are debited after the fact.
pub fn response_weight_extra(items_returned: usize, default_cost: f64) -> f64 {
    let weight = 20.0 + (items_returned / 20) as f64;
    (weight - default_cost).max(0.0)
}

/// Process-wide rate limit governor. Constructed once per process.
pub enum Governor {
    Distributed(DistributedGovernor),
    Local(LocalGovernor),
}

impl Governor {
    pub fn new(pool: PgPool, config: GovernorConfig) -> Self {
        if config.distributed {
            Governor::Distributed(DistributedGovernor::new(pool, config))
        } else {
            Governor::Local(LocalGovernor::new(config))
        }
    }

    fn config(&self) -> &GovernorConfig {
        match self {
            Governor::Distributed(g) => g.config(),
            Governor::Local(g) => g.config(),
        }
    }

    pub fn default_cost(&self) -> f64 {
        self.config().default_cost
    }

    /// Block until `cost` tokens are available, then deduct them. Returns how
    /// long the caller waited, in milliseconds.
    pub async fn acquire(&self, cost: f64) -> Result<u64, IngestError> {
        match self {
            Governor::Distributed(g) => g.acquire(cost).await,
            Governor::Local(g) => Ok(g.acquire(cost).await),
        }
    }

    /// `acquire` at the default request cost.
    pub async fn acquire_default(&self) -> Result<u64, IngestError> {
        self.acquire(self.config().default_cost).await
    }

    /// Non-blocking acquire. Only the local governor supports this; the
    /// distributed bucket cannot answer without taking the row lock and
    /// racing other workers.
    pub async fn try_acquire(&self, cost: f64) -> Result<bool, IngestError> {
        match self {
            Governor::Distributed(_) => Err(IngestError::Unsupported("try_acquire")),
            Governor::Local(g) => Ok(g.try_acquire(cost).await),
        }
    }

    /// The upstream rejected us: drain the bucket and hold all acquires for
    /// 10 seconds.
    pub async fn report_rate_limited(&self) -> Result<(), IngestError> {
        match self {
            Governor::Distributed(g) => g.report_rate_limited().await,
            Governor::Local(g) => {
                g.report_rate_limited().await;
                Ok(())
            }
        }
    }

    /// Debit the response-weighted surcharge after a fetch returns.
    pub async fn adjust_for_response(&self, items_returned: usize) -> Result<(), IngestError> {
        match self {
            Governor::Distributed(g) => g.adjust_for_response(items_returned).await,
            Governor::Local(g) => {
                g.adjust_for_response(items_returned).await;
                Ok(())
            }
        }
    }

    /// Estimate of how many default-cost acquires would succeed right now.
    /// Advisory only; the scheduler uses it for admission control.
    pub async fn available_requests(&self) -> Result<u32, IngestError> {
        match self {
            Governor::Distributed(g) => g.available_requests(self.default_cost()).await,
            Governor::Local(g) => Ok(g.available_requests(self.default_cost()).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_responses_cost_nothing_extra() {
        assert_eq!(response_weight_extra(0, 20.0), 0.0);
        assert_eq!(response_weight_extra(19, 20.0), 0.0);
    }

    #[test]
    fn large_responses_are_debited_after_the_fact() {
        assert_eq!(response_weight_extra(20, 20.0), 1.0);
        assert_eq!(response_weight_extra(100, 20.0), 5.0);
        assert_eq!(response_weight_extra(2000, 20.0), 100.0);
    }
}
