//! Adaptive per-wallet scheduler.
//!
//! A periodic tick classifies due wallets by trade recency, then enqueues
//! `ingest_wallet` jobs, never more than the governor can absorb and never
//! two pending jobs for the same wallet. The cursor update API lives here
//! too: the fetcher reports outcomes and the scheduler decides when that
//! wallet runs next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::db::models::DueWallet;
use crate::db::queries;
use crate::error::IngestError;
use crate::governor::Governor;
use crate::jobs::payload::{IngestWalletPayload, JobPayload};
use crate::jobs::store::JobStore;

const HOT_WINDOW_HOURS: i64 = 24;
const WARM_WINDOW_HOURS: i64 = 168;
const ERROR_BACKOFF_CAP_SECS: u64 = 3600;
const ERROR_BACKOFF_SHIFT_CAP: i32 = 6;

/// Trade-recency class driving ingestion cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityClass {
    Hot,
    Warm,
    Cold,
}

impl ActivityClass {
    pub fn classify(last_trade_ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match last_trade_ts {
            Some(ts) if now - ts <= chrono::Duration::hours(HOT_WINDOW_HOURS) => {
                ActivityClass::Hot
            }
            Some(ts) if now - ts <= chrono::Duration::hours(WARM_WINDOW_HOURS) => {
                ActivityClass::Warm
            }
            _ => ActivityClass::Cold,
        }
    }

    pub fn base_interval_secs(self) -> u64 {
        match self {
            ActivityClass::Hot => 60,
            ActivityClass::Warm => 900,
            ActivityClass::Cold => 3600,
        }
    }

    fn rank(self) -> u8 {
        match self {
            ActivityClass::Hot => 0,
            ActivityClass::Warm => 1,
            ActivityClass::Cold => 2,
        }
    }
}

/// Seconds until a wallet's next fetch. With errors the cold base dominates,
/// doubled per error up to a one-hour ceiling.
pub fn next_run_delay_secs(class: ActivityClass, error_count: i32) -> u64 {
    if error_count <= 0 {
        return class.base_interval_secs();
    }
    let shift = error_count.min(ERROR_BACKOFF_SHIFT_CAP) as u32;
    (ActivityClass::Cold.base_interval_secs() << shift).min(ERROR_BACKOFF_CAP_SECS)
}

/// Hot wallets first, then by how long the wallet has been due.
fn order_due(mut wallets: Vec<DueWallet>, now: DateTime<Utc>) -> Vec<DueWallet> {
    wallets.sort_by_key(|w| {
        (
            ActivityClass::classify(w.last_trade_ts, now).rank(),
            w.next_run_at,
        )
    });
    wallets
}

#[derive(Debug, Default)]
pub struct TickStats {
    pub scheduled: usize,
    pub skipped: usize,
}

pub struct Scheduler {
    pool: PgPool,
    store: JobStore,
    governor: Arc<Governor>,
    org_id: Uuid,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        store: JobStore,
        governor: Arc<Governor>,
        org_id: Uuid,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            store,
            governor,
            org_id,
            config,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            org_id = %self.org_id,
            tick_secs = self.config.tick_secs,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.scheduled > 0 || stats.skipped > 0 => {
                            info!(
                                scheduled = stats.scheduled,
                                skipped = stats.skipped,
                                "scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    /// One scheduling pass.
    pub async fn tick(&self) -> Result<TickStats, IngestError> {
        let cap = self.governor.available_requests().await? as usize;
        if cap == 0 {
            debug!("governor has no capacity, skipping tick");
            return Ok(TickStats::default());
        }

        let now = Utc::now();
        let mut due = order_due(queries::due_wallets(&self.pool, self.org_id).await?, now);
        due.truncate(self.config.max_jobs_per_run);

        let mut stats = TickStats::default();
        for wallet in due {
            if stats.scheduled >= cap {
                break;
            }
            if self
                .store
                .has_pending_ingest(self.org_id, wallet.wallet_id)
                .await?
            {
                stats.skipped += 1;
                continue;
            }
            let payload = JobPayload::IngestWallet(IngestWalletPayload {
                org_id: self.org_id,
                wallet_id: wallet.wallet_id,
                address: wallet.address.clone(),
            });
            self.store.enqueue(self.org_id, &payload, None).await?;
            stats.scheduled += 1;
        }
        Ok(stats)
    }
}

// ── Cursor update API (called by the fetcher) ────────────────────

/// Record a successful fetch. Clears the error streak and schedules the
/// next run from the wallet's activity class; fills ingested just now count
/// toward recency even though their rollup has not landed yet.
pub async fn update_cursor_success(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
    new_cursor_ts: Option<DateTime<Utc>>,
) -> Result<(), IngestError> {
    let last_trade = queries::max_last_trade_ts(pool, org_id, wallet_id).await?;
    let recency = match (last_trade, new_cursor_ts) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let class = ActivityClass::classify(recency, Utc::now());
    let delay = next_run_delay_secs(class, 0);
    queries::mark_cursor_success(pool, org_id, wallet_id, new_cursor_ts, delay as f64).await?;
    Ok(())
}

/// Record a failed fetch. The cursor stays put; backoff dominates the class
/// interval.
pub async fn update_cursor_failure(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
) -> Result<(), IngestError> {
    let error_count = queries::cursor_error_count(pool, org_id, wallet_id)
        .await?
        .unwrap_or(0);
    let delay = next_run_delay_secs(ActivityClass::Cold, error_count + 1);
    queries::mark_cursor_failure(pool, org_id, wallet_id, delay as f64).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
    }

    fn hours_ago(h: i64) -> Option<DateTime<Utc>> {
        Some(now() - chrono::Duration::hours(h))
    }

    #[test]
    fn classification_windows() {
        assert_eq!(
            ActivityClass::classify(hours_ago(1), now()),
            ActivityClass::Hot
        );
        assert_eq!(
            ActivityClass::classify(hours_ago(24), now()),
            ActivityClass::Hot
        );
        assert_eq!(
            ActivityClass::classify(hours_ago(25), now()),
            ActivityClass::Warm
        );
        assert_eq!(
            ActivityClass::classify(hours_ago(168), now()),
            ActivityClass::Warm
        );
        assert_eq!(
            ActivityClass::classify(hours_ago(169), now()),
            ActivityClass::Cold
        );
        assert_eq!(ActivityClass::classify(None, now()), ActivityClass::Cold);
    }

    #[test]
    fn base_intervals_per_class() {
        assert_eq!(ActivityClass::Hot.base_interval_secs(), 60);
        assert_eq!(ActivityClass::Warm.base_interval_secs(), 900);
        assert_eq!(ActivityClass::Cold.base_interval_secs(), 3600);
    }

    #[test]
    fn healthy_wallets_run_at_their_class_interval() {
        assert_eq!(next_run_delay_secs(ActivityClass::Hot, 0), 60);
        assert_eq!(next_run_delay_secs(ActivityClass::Warm, 0), 900);
    }

    #[test]
    fn error_backoff_dominates_class_and_is_capped() {
        // Even a hot wallet backs off on the cold base once it errors.
        assert_eq!(next_run_delay_secs(ActivityClass::Hot, 1), 3600);
        assert_eq!(next_run_delay_secs(ActivityClass::Cold, 3), 3600);
        assert_eq!(next_run_delay_secs(ActivityClass::Cold, 100), 3600);
    }

    #[test]
    fn due_wallets_ordered_hot_first_then_oldest_due() {
        let wallets = vec![
            DueWallet {
                wallet_id: 1,
                address: "0xaa".into(),
                next_run_at: now() - chrono::Duration::seconds(30),
                last_trade_ts: None,
            },
            DueWallet {
                wallet_id: 2,
                address: "0xbb".into(),
                next_run_at: now() - chrono::Duration::seconds(10),
                last_trade_ts: hours_ago(2),
            },
            DueWallet {
                wallet_id: 3,
                address: "0xcc".into(),
                next_run_at: now() - chrono::Duration::seconds(20),
                last_trade_ts: hours_ago(2),
            },
            DueWallet {
                wallet_id: 4,
                address: "0xdd".into(),
                next_run_at: now() - chrono::Duration::seconds(40),
                last_trade_ts: hours_ago(100),
            },
        ];
        let ordered: Vec<i64> = order_due(wallets, now())
            .into_iter()
            .map(|w| w.wallet_id)
            .collect();
        // Hot (oldest due first), then warm, then cold.
        assert_eq!(ordered, vec![3, 2, 4, 1]);
    }
}
