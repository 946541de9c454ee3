//! `ingest_wallet` handler — incremental fetch with an overlap window,
//! idempotent bulk insert, cursor advance, and rollup chaining.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::models::{DbJob, NewFill};
use crate::db::queries;
use crate::error::{classify_db_error, is_rate_limit_message, IngestError};
use crate::governor::Governor;
use crate::jobs::payload::{
    decode_as, IngestWalletPayload, JobPayload, RollupWalletDayPayload,
};
use crate::jobs::store::JobStore;
use crate::jobs::worker::JobHandler;
use crate::scheduler;
use crate::upstream::{FillsSource, RawFill};

/// Fixed backstep applied before every upstream query so late-delivered
/// fills are picked up on the next pass; the insert dedups them on
/// `(org, wallet, fill_id, ts)`.
const OVERLAP_MILLIS: i64 = 10 * 60 * 1000;

/// Where to start the upstream query given the cursor high-water mark.
pub fn overlap_start_millis(cursor_ts: DateTime<Utc>) -> i64 {
    (cursor_ts.timestamp_millis() - OVERLAP_MILLIS).max(0)
}

/// Spot coins contain `/` or start with `@`; perps are the complement.
/// Heuristic pending an authoritative taxonomy from the upstream.
pub fn is_spot_coin(coin: &str) -> bool {
    coin.contains('/') || coin.starts_with('@')
}

/// Stable fill identity derived from the upstream trade id and transaction
/// hash.
pub fn derive_fill_id(tid: u64, hash: &str) -> String {
    format!("{tid}-{hash}")
}

/// Distinct UTC dates touched by a batch, sorted.
pub fn distinct_days(fills: &[NewFill]) -> Vec<NaiveDate> {
    let mut days: Vec<NaiveDate> = fills.iter().map(|f| f.ts.date_naive()).collect();
    days.sort();
    days.dedup();
    days
}

/// The upstream reports rate limiting through message content; fold any
/// such transient error into the distinguishable `RateLimited` kind.
fn normalize_rate_limit(err: IngestError) -> IngestError {
    match err {
        IngestError::UpstreamTransient(msg) | IngestError::UpstreamMalformed(msg)
            if is_rate_limit_message(&msg) =>
        {
            IngestError::RateLimited(msg)
        }
        other => other,
    }
}

fn to_new_fill(
    org_id: uuid::Uuid,
    wallet_id: i64,
    raw: &RawFill,
) -> Result<NewFill, IngestError> {
    if raw.side != "A" && raw.side != "B" {
        return Err(IngestError::UpstreamMalformed(format!(
            "unexpected side {:?} for tid {}",
            raw.side, raw.tid
        )));
    }
    let px = Decimal::from_str(&raw.px)
        .map_err(|e| IngestError::UpstreamMalformed(format!("px {:?}: {e}", raw.px)))?;
    let sz = Decimal::from_str(&raw.sz)
        .map_err(|e| IngestError::UpstreamMalformed(format!("sz {:?}: {e}", raw.sz)))?;
    if px.is_sign_negative() || sz.is_sign_negative() {
        return Err(IngestError::UpstreamMalformed(format!(
            "negative px/sz for tid {}",
            raw.tid
        )));
    }
    let ts = DateTime::from_timestamp_millis(raw.time as i64).ok_or_else(|| {
        IngestError::UpstreamMalformed(format!("timestamp {} out of range", raw.time))
    })?;
    let is_spot = is_spot_coin(&raw.coin);
    Ok(NewFill {
        org_id,
        wallet_id,
        fill_id: derive_fill_id(raw.tid, &raw.hash),
        ts,
        coin: raw.coin.clone(),
        side: raw.side.clone(),
        px,
        sz,
        is_spot,
        is_perp: !is_spot,
    })
}

pub struct IngestWalletHandler {
    pool: PgPool,
    store: JobStore,
    governor: Arc<Governor>,
    source: Arc<dyn FillsSource>,
}

impl IngestWalletHandler {
    pub fn new(
        pool: PgPool,
        store: JobStore,
        governor: Arc<Governor>,
        source: Arc<dyn FillsSource>,
    ) -> Self {
        Self {
            pool,
            store,
            governor,
            source,
        }
    }

    async fn run(&self, payload: &IngestWalletPayload) -> Result<(), IngestError> {
        let cursor_ts = queries::cursor_ts(&self.pool, payload.org_id, payload.wallet_id)
            .await?
            .unwrap_or(DateTime::UNIX_EPOCH);
        let start_millis = overlap_start_millis(cursor_ts);

        self.governor.acquire_default().await?;

        let fills = match self
            .source
            .fetch_fills(&payload.address, start_millis)
            .await
        {
            Ok(fills) => fills,
            Err(err) => {
                let err = normalize_rate_limit(err);
                if matches!(err, IngestError::RateLimited(_)) {
                    if let Err(e) = self.governor.report_rate_limited().await {
                        warn!(error = %e, "failed to persist rate-limit report");
                    }
                }
                return Err(err);
            }
        };

        self.governor.adjust_for_response(fills.len()).await?;

        if fills.is_empty() {
            debug!(wallet_id = payload.wallet_id, "no new fills");
            scheduler::update_cursor_success(&self.pool, payload.org_id, payload.wallet_id, None)
                .await?;
            return Ok(());
        }

        let rows: Vec<NewFill> = fills
            .iter()
            .map(|f| to_new_fill(payload.org_id, payload.wallet_id, f))
            .collect::<Result<_, _>>()?;

        let inserted = queries::insert_fills(&self.pool, &rows)
            .await
            .map_err(classify_db_error)?;

        let new_cursor = rows.iter().map(|f| f.ts).max().unwrap_or(cursor_ts);
        scheduler::update_cursor_success(
            &self.pool,
            payload.org_id,
            payload.wallet_id,
            Some(new_cursor),
        )
        .await?;

        let days = distinct_days(&rows);
        info!(
            wallet_id = payload.wallet_id,
            fetched = rows.len(),
            inserted,
            days = days.len(),
            "wallet ingested"
        );
        self.store
            .enqueue(
                payload.org_id,
                &JobPayload::RollupWalletDay(RollupWalletDayPayload {
                    org_id: payload.org_id,
                    wallet_id: payload.wallet_id,
                    days,
                }),
                None,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for IngestWalletHandler {
    async fn handle(&self, job: &DbJob) -> Result<(), IngestError> {
        let payload: IngestWalletPayload = decode_as(&job.payload)?;
        match self.run(&payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // The scheduler's view of the wallet must reflect the failure
                // even before the queue decides on a retry.
                if let Err(e) =
                    scheduler::update_cursor_failure(&self.pool, payload.org_id, payload.wallet_id)
                        .await
                {
                    warn!(
                        wallet_id = payload.wallet_id,
                        error = %e,
                        "failed to record cursor failure"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn org() -> Uuid {
        Uuid::parse_str("3f0e8c3a-7e27-4e6f-8f2c-3a6d5b9d1e42").unwrap()
    }

    fn raw(coin: &str, side: &str, px: &str, sz: &str, time: u64, tid: u64) -> RawFill {
        RawFill {
            time,
            coin: coin.into(),
            side: side.into(),
            px: px.into(),
            sz: sz.into(),
            hash: "0xdeadbeef".into(),
            tid,
        }
    }

    #[test]
    fn overlap_steps_back_ten_minutes() {
        let cursor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 30, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 1, 0, 20, 0).unwrap();
        assert_eq!(overlap_start_millis(cursor), expected.timestamp_millis());
    }

    #[test]
    fn overlap_never_goes_negative() {
        assert_eq!(overlap_start_millis(DateTime::UNIX_EPOCH), 0);
    }

    #[test]
    fn spot_perp_predicate() {
        assert!(is_spot_coin("ETH/USDC"));
        assert!(is_spot_coin("@107"));
        assert!(!is_spot_coin("BTC"));
        assert!(!is_spot_coin("ETH"));
    }

    #[test]
    fn fill_id_combines_tid_and_hash() {
        assert_eq!(derive_fill_id(118712, "0xabc"), "118712-0xabc");
    }

    #[test]
    fn raw_fill_converts_with_decimal_prices() {
        let fill = to_new_fill(org(), 7, &raw("ETH/USDC", "B", "2000.5", "0.5", 1767226500000, 1))
            .unwrap();
        assert_eq!(fill.px, dec!(2000.5));
        assert_eq!(fill.sz, dec!(0.5));
        assert!(fill.is_spot);
        assert!(!fill.is_perp);
        assert_eq!(fill.fill_id, "1-0xdeadbeef");
        assert_eq!(fill.ts.timestamp_millis(), 1767226500000);
    }

    #[test]
    fn perp_fills_are_the_complement() {
        let fill = to_new_fill(org(), 7, &raw("BTC", "A", "10", "2", 1767226500000, 2)).unwrap();
        assert!(fill.is_perp);
        assert!(!fill.is_spot);
    }

    #[test]
    fn unexpected_side_is_malformed() {
        let err = to_new_fill(org(), 7, &raw("BTC", "X", "10", "2", 1, 3)).unwrap_err();
        assert!(matches!(err, IngestError::UpstreamMalformed(_)));
    }

    #[test]
    fn unparsable_price_is_malformed() {
        let err = to_new_fill(org(), 7, &raw("BTC", "A", "ten", "2", 1, 4)).unwrap_err();
        assert!(matches!(err, IngestError::UpstreamMalformed(_)));
    }

    #[test]
    fn distinct_days_sorted_and_deduped() {
        let mk = |time| to_new_fill(org(), 7, &raw("BTC", "A", "1", "1", time, time)).unwrap();
        // Two fills on 2026-01-02, one on 2026-01-01, out of order.
        let fills = vec![mk(1767312000000), mk(1767225600000), mk(1767312060000)];
        let days = distinct_days(&fills);
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            ]
        );
    }

    #[test]
    fn transient_errors_with_rate_limit_text_become_rate_limited() {
        let err = normalize_rate_limit(IngestError::UpstreamTransient(
            "status 400: too many requests".into(),
        ));
        assert!(matches!(err, IngestError::RateLimited(_)));

        let err = normalize_rate_limit(IngestError::UpstreamTransient("timed out".into()));
        assert!(matches!(err, IngestError::UpstreamTransient(_)));
    }
}
