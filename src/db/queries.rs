//! SQL query functions for cursors, wallets, raw fills, and derived metrics.
//!
//! Queue SQL lives with [`crate::jobs::store::JobStore`]; governor SQL with
//! [`crate::governor`]. Everything else is here.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::models::{DueWallet, NewFill};

// ── Ingest cursors ───────────────────────────────────────────────

/// High-water mark for a wallet. `None` when the cursor row does not exist
/// yet; callers treat that as epoch.
pub async fn cursor_ts(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT cursor_ts FROM hl_ingest_cursor WHERE org_id = $1 AND wallet_id = $2",
    )
    .bind(org_id)
    .bind(wallet_id)
    .fetch_optional(pool)
    .await
}

pub async fn cursor_error_count(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
) -> Result<Option<i32>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT error_count FROM hl_ingest_cursor WHERE org_id = $1 AND wallet_id = $2",
    )
    .bind(org_id)
    .bind(wallet_id)
    .fetch_optional(pool)
    .await
}

/// Record a successful fetch. The cursor only ever moves forward: GREATEST
/// keeps it monotone even if a stale retry reports an older timestamp.
pub async fn mark_cursor_success(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
    new_cursor_ts: Option<DateTime<Utc>>,
    next_run_secs: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO hl_ingest_cursor
             (org_id, wallet_id, cursor_ts, last_success_at, status, error_count, next_run_at)
         VALUES ($1, $2, COALESCE($3, 'epoch'::timestamptz), now(), 'ok', 0,
                 now() + make_interval(secs => $4))
         ON CONFLICT (org_id, wallet_id) DO UPDATE SET
             cursor_ts = GREATEST(hl_ingest_cursor.cursor_ts,
                                  COALESCE($3, hl_ingest_cursor.cursor_ts)),
             last_success_at = now(),
             status = 'ok',
             error_count = 0,
             next_run_at = now() + make_interval(secs => $4)",
    )
    .bind(org_id)
    .bind(wallet_id)
    .bind(new_cursor_ts)
    .bind(next_run_secs)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failed fetch. The cursor itself is untouched.
pub async fn mark_cursor_failure(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
    next_run_secs: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE hl_ingest_cursor
         SET error_count = error_count + 1,
             status = 'error',
             next_run_at = now() + make_interval(secs => $3)
         WHERE org_id = $1 AND wallet_id = $2",
    )
    .bind(org_id)
    .bind(wallet_id)
    .bind(next_run_secs)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent trade instant across all of a wallet's day metrics.
pub async fn max_last_trade_ts(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT MAX(last_trade_ts) FROM wallet_day_metrics
         WHERE org_id = $1 AND wallet_id = $2",
    )
    .bind(org_id)
    .bind(wallet_id)
    .fetch_one(pool)
    .await
}

// ── Scheduler selection ──────────────────────────────────────────

/// Active wallets whose cursor is due, with the trade recency used for
/// hot/warm/cold classification.
pub async fn due_wallets(pool: &PgPool, org_id: Uuid) -> Result<Vec<DueWallet>, sqlx::Error> {
    sqlx::query_as::<_, DueWallet>(
        "SELECT c.wallet_id, w.address, c.next_run_at,
                (SELECT MAX(m.last_trade_ts)
                   FROM wallet_day_metrics m
                  WHERE m.org_id = c.org_id AND m.wallet_id = c.wallet_id) AS last_trade_ts
         FROM hl_ingest_cursor c
         JOIN wallets w ON w.wallet_id = c.wallet_id
         WHERE c.org_id = $1 AND c.next_run_at <= now() AND w.is_active",
    )
    .bind(org_id)
    .fetch_all(pool)
    .await
}

// ── Raw fills ────────────────────────────────────────────────────

/// Bulk-insert fills, silently skipping duplicates. Returns the number of
/// rows actually inserted.
pub async fn insert_fills(pool: &PgPool, fills: &[NewFill]) -> Result<u64, sqlx::Error> {
    if fills.is_empty() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO hl_fills_raw
         (org_id, wallet_id, fill_id, ts, coin, side, px, sz, is_spot, is_perp) ",
    );
    builder.push_values(fills, |mut b, f| {
        b.push_bind(f.org_id)
            .push_bind(f.wallet_id)
            .push_bind(&f.fill_id)
            .push_bind(f.ts)
            .push_bind(&f.coin)
            .push_bind(&f.side)
            .push_bind(f.px)
            .push_bind(f.sz)
            .push_bind(f.is_spot)
            .push_bind(f.is_perp);
    });
    builder.push(" ON CONFLICT (org_id, wallet_id, fill_id, ts) DO NOTHING");

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

// ── Derived metrics ──────────────────────────────────────────────

/// UTC bounds of one day bucket: `[day 00:00, day+1 00:00)`.
pub fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    let end = day
        .succ_opt()
        .expect("date in supported range")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    (start, end)
}

/// Recompute one wallet-day row from raw fills. Writes nothing when the
/// wallet has no fills for that day. Returns rows written (0 or 1).
pub async fn upsert_wallet_day_metric(
    pool: &PgPool,
    org_id: Uuid,
    wallet_id: i64,
    day: NaiveDate,
) -> Result<u64, sqlx::Error> {
    let (start, end) = day_bounds(day);
    let result = sqlx::query(
        "INSERT INTO wallet_day_metrics
             (org_id, wallet_id, day, spot_volume_usd, perp_volume_usd,
              trades_count, last_trade_ts, updated_at)
         SELECT org_id, wallet_id, $3::date,
                COALESCE(SUM(px * sz) FILTER (WHERE is_spot), 0),
                COALESCE(SUM(px * sz) FILTER (WHERE is_perp), 0),
                COUNT(*),
                MAX(ts),
                now()
         FROM hl_fills_raw
         WHERE org_id = $1 AND wallet_id = $2 AND ts >= $4 AND ts < $5
         GROUP BY org_id, wallet_id
         ON CONFLICT (org_id, wallet_id, day) DO UPDATE SET
             spot_volume_usd = EXCLUDED.spot_volume_usd,
             perp_volume_usd = EXCLUDED.perp_volume_usd,
             trades_count = EXCLUDED.trades_count,
             last_trade_ts = EXCLUDED.last_trade_ts,
             updated_at = now()",
    )
    .bind(org_id)
    .bind(wallet_id)
    .bind(day)
    .bind(start)
    .bind(end)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Recompute one org-wide day row from the wallet-day table. Always writes a
/// row; a day with no active wallets records zeroes.
pub async fn upsert_global_day_metric(
    pool: &PgPool,
    org_id: Uuid,
    day: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO global_day_metrics
             (org_id, day, dau, spot_volume_usd, perp_volume_usd,
              avg_spot_volume_per_user, avg_perp_volume_per_user, updated_at)
         SELECT $1::uuid, $2::date,
                COUNT(*) FILTER (WHERE trades_count > 0),
                COALESCE(SUM(spot_volume_usd), 0),
                COALESCE(SUM(perp_volume_usd), 0),
                CASE WHEN COUNT(*) FILTER (WHERE trades_count > 0) > 0
                     THEN COALESCE(SUM(spot_volume_usd), 0)
                          / (COUNT(*) FILTER (WHERE trades_count > 0))
                     ELSE 0 END,
                CASE WHEN COUNT(*) FILTER (WHERE trades_count > 0) > 0
                     THEN COALESCE(SUM(perp_volume_usd), 0)
                          / (COUNT(*) FILTER (WHERE trades_count > 0))
                     ELSE 0 END,
                now()
         FROM wallet_day_metrics
         WHERE org_id = $1 AND day = $2
         ON CONFLICT (org_id, day) DO UPDATE SET
             dau = EXCLUDED.dau,
             spot_volume_usd = EXCLUDED.spot_volume_usd,
             perp_volume_usd = EXCLUDED.perp_volume_usd,
             avg_spot_volume_per_user = EXCLUDED.avg_spot_volume_per_user,
             avg_perp_volume_per_user = EXCLUDED.avg_perp_volume_per_user,
             updated_at = now()",
    )
    .bind(org_id)
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_bounds_cover_exactly_one_day() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let (start, end) = day_bounds(day);
        assert_eq!(start.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(end.to_rfc3339(), "2026-01-02T00:00:00+00:00");
    }

    #[test]
    fn day_bounds_handle_month_rollover() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap();
        let (_, end) = day_bounds(day);
        assert_eq!(end.to_rfc3339(), "2026-02-01T00:00:00+00:00");
    }
}
