//! Database row types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// A row from the `jobs` table, as returned by `Claim`.
#[derive(Debug, Clone, FromRow)]
pub struct DbJob {
    pub id: i64,
    pub org_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A wallet whose cursor is due for ingestion, joined with its most recent
/// trade instant from the wallet-day metrics.
#[derive(Debug, Clone, FromRow)]
pub struct DueWallet {
    pub wallet_id: i64,
    pub address: String,
    pub next_run_at: DateTime<Utc>,
    pub last_trade_ts: Option<DateTime<Utc>>,
}

/// One raw fill ready for insertion into `hl_fills_raw`.
#[derive(Debug, Clone)]
pub struct NewFill {
    pub org_id: Uuid,
    pub wallet_id: i64,
    pub fill_id: String,
    pub ts: DateTime<Utc>,
    pub coin: String,
    pub side: String,
    pub px: Decimal,
    pub sz: Decimal,
    pub is_spot: bool,
    pub is_perp: bool,
}
