//! Rollup handlers — deterministic recomputation of daily aggregates.
//!
//! `rollup_wallet_day` rebuilds per-wallet day rows from raw fills, then
//! chains `rollup_global_day`, which rebuilds the org-wide rows from the
//! wallet-day table. Both are pure functions of their inputs, so replays
//! and rebuilds converge on identical values.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::db::models::DbJob;
use crate::db::queries;
use crate::error::IngestError;
use crate::jobs::payload::{
    decode_as, JobPayload, RollupGlobalDayPayload, RollupWalletDayPayload,
};
use crate::jobs::store::JobStore;
use crate::jobs::worker::JobHandler;

pub struct RollupWalletDayHandler {
    pool: PgPool,
    store: JobStore,
}

impl RollupWalletDayHandler {
    pub fn new(pool: PgPool, store: JobStore) -> Self {
        Self { pool, store }
    }
}

#[async_trait]
impl JobHandler for RollupWalletDayHandler {
    async fn handle(&self, job: &DbJob) -> Result<(), IngestError> {
        let payload: RollupWalletDayPayload = decode_as(&job.payload)?;

        for day in &payload.days {
            let written =
                queries::upsert_wallet_day_metric(&self.pool, payload.org_id, payload.wallet_id, *day)
                    .await?;
            if written == 0 {
                debug!(
                    wallet_id = payload.wallet_id,
                    day = %day,
                    "no fills for day, metric untouched"
                );
            }
        }

        self.store
            .enqueue(
                payload.org_id,
                &JobPayload::RollupGlobalDay(RollupGlobalDayPayload {
                    org_id: payload.org_id,
                    days: payload.days.clone(),
                }),
                None,
            )
            .await?;
        Ok(())
    }
}

pub struct RollupGlobalDayHandler {
    pool: PgPool,
}

impl RollupGlobalDayHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobHandler for RollupGlobalDayHandler {
    async fn handle(&self, job: &DbJob) -> Result<(), IngestError> {
        let payload: RollupGlobalDayPayload = decode_as(&job.payload)?;
        for day in &payload.days {
            queries::upsert_global_day_metric(&self.pool, payload.org_id, *day).await?;
        }
        Ok(())
    }
}
