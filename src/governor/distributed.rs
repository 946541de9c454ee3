//! Database-backed token bucket shared by all workers.
//!
//! All state lives in one `rate_limit_state` row. Every mutating operation
//! runs a short transaction that takes the row lock with `FOR UPDATE`,
//! applies refill + the operation, and commits. The lock is never held
//! across a sleep, so a waiting worker does not starve the others.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::warn;

use crate::config::GovernorConfig;
use crate::error::IngestError;

const RATE_LIMIT_HOLD_SECS: i64 = 10;
const MINUTE_SECS: i64 = 60;

#[derive(Debug, FromRow)]
struct StateRow {
    tokens: f64,
    last_refill: DateTime<Utc>,
    requests_this_minute: i32,
    weight_this_minute: f64,
    minute_start: DateTime<Utc>,
    is_rate_limited: bool,
    rate_limited_until: Option<DateTime<Utc>>,
}

impl StateRow {
    fn refill(&mut self, now: DateTime<Utc>, config: &GovernorConfig) {
        let elapsed_ms = (now - self.last_refill).num_milliseconds().max(0);
        let gained = elapsed_ms as f64 / 1000.0 * config.refill_rate;
        self.tokens = (self.tokens + gained).min(config.max_tokens);
        self.last_refill = now;
    }

    fn roll_minute(&mut self, now: DateTime<Utc>) {
        if (now - self.minute_start).num_seconds() >= MINUTE_SECS {
            self.requests_this_minute = 0;
            self.weight_this_minute = 0.0;
            self.minute_start = now;
        }
    }
}

pub struct DistributedGovernor {
    pool: PgPool,
    config: GovernorConfig,
}

impl DistributedGovernor {
    pub fn new(pool: PgPool, config: GovernorConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Take the row lock, inserting the singleton row if a fresh database
    /// does not carry it yet.
    async fn lock_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<StateRow, IngestError> {
        let existing = sqlx::query_as::<_, StateRow>(
            "SELECT tokens, last_refill, requests_this_minute, weight_this_minute,
                    minute_start, is_rate_limited, rate_limited_until
             FROM rate_limit_state WHERE key = $1 FOR UPDATE",
        )
        .bind(&self.config.state_key)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = existing {
            return Ok(row);
        }

        let row = sqlx::query_as::<_, StateRow>(
            "INSERT INTO rate_limit_state
                 (key, tokens, last_refill, requests_this_minute, weight_this_minute,
                  minute_start, is_rate_limited)
             VALUES ($1, $2, now(), 0, 0, now(), false)
             RETURNING tokens, last_refill, requests_this_minute, weight_this_minute,
                       minute_start, is_rate_limited, rate_limited_until",
        )
        .bind(&self.config.state_key)
        .bind(self.config.max_tokens)
        .fetch_one(&mut **tx)
        .await?;
        Ok(row)
    }

    async fn save_state(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        state: &StateRow,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE rate_limit_state
             SET tokens = $2, last_refill = $3, requests_this_minute = $4,
                 weight_this_minute = $5, minute_start = $6,
                 is_rate_limited = $7, rate_limited_until = $8
             WHERE key = $1",
        )
        .bind(&self.config.state_key)
        .bind(state.tokens)
        .bind(state.last_refill)
        .bind(state.requests_this_minute)
        .bind(state.weight_this_minute)
        .bind(state.minute_start)
        .bind(state.is_rate_limited)
        .bind(state.rate_limited_until)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Block until `cost` tokens are available. Returns milliseconds waited.
    pub async fn acquire(&self, cost: f64) -> Result<u64, IngestError> {
        let mut waited_ms: u64 = 0;
        loop {
            let mut tx = self.pool.begin().await?;
            let mut state = self.lock_state(&mut tx).await?;
            let now = Utc::now();
            state.refill(now, &self.config);

            // A reported rate limit holds every worker, without consuming
            // tokens: persist the refill, release the lock, sleep out the
            // remainder.
            if state.is_rate_limited {
                if let Some(until) = state.rate_limited_until {
                    if until > now {
                        self.save_state(&mut tx, &state).await?;
                        tx.commit().await?;
                        let wait = (until - now).to_std().unwrap_or_default();
                        tokio::time::sleep(wait).await;
                        waited_ms += wait.as_millis() as u64;
                        continue;
                    }
                }
                state.is_rate_limited = false;
                state.rate_limited_until = None;
            }

            state.roll_minute(now);

            if state.tokens >= cost {
                state.tokens -= cost;
                state.requests_this_minute += 1;
                state.weight_this_minute += cost;
                self.save_state(&mut tx, &state).await?;
                tx.commit().await?;
                return Ok(waited_ms);
            }

            let wait_secs = ((cost - state.tokens) / self.config.refill_rate).ceil();
            self.save_state(&mut tx, &state).await?;
            tx.commit().await?;

            let wait = Duration::from_secs_f64(wait_secs.max(1.0));
            tokio::time::sleep(wait).await;
            waited_ms += wait.as_millis() as u64;
        }
    }

    /// Drain the bucket and hold all workers for 10 seconds.
    pub async fn report_rate_limited(&self) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;
        let mut state = self.lock_state(&mut tx).await?;
        let now = Utc::now();
        state.tokens = 0.0;
        state.last_refill = now;
        state.is_rate_limited = true;
        state.rate_limited_until = Some(now + chrono::Duration::seconds(RATE_LIMIT_HOLD_SECS));
        self.save_state(&mut tx, &state).await?;
        tx.commit().await?;
        warn!(hold_secs = RATE_LIMIT_HOLD_SECS, "upstream rate limit reported, bucket drained");
        Ok(())
    }

    /// Debit the response-weighted surcharge.
    pub async fn adjust_for_response(&self, items_returned: usize) -> Result<(), IngestError> {
        let extra = super::response_weight_extra(items_returned, self.config.default_cost);
        if extra <= 0.0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut state = self.lock_state(&mut tx).await?;
        state.tokens = (state.tokens - extra).max(0.0);
        state.weight_this_minute += extra;
        self.save_state(&mut tx, &state).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Lock-free estimate of how many `cost`-sized acquires would succeed.
    pub async fn available_requests(&self, cost: f64) -> Result<u32, IngestError> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT tokens, last_refill, requests_this_minute, weight_this_minute,
                    minute_start, is_rate_limited, rate_limited_until
             FROM rate_limit_state WHERE key = $1",
        )
        .bind(&self.config.state_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(mut state) = row else {
            return Ok((self.config.max_tokens / cost).floor() as u32);
        };

        let now = Utc::now();
        if state.is_rate_limited {
            if let Some(until) = state.rate_limited_until {
                if until > now {
                    return Ok(0);
                }
            }
        }
        state.refill(now, &self.config);
        Ok((state.tokens / cost).floor() as u32)
    }
}
