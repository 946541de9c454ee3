//! Upstream fill source abstraction.
//!
//! The production implementation is a thin HTTP client for the exchange's
//! `/info` endpoint; [`MockFillsSource`] lets handler logic run in tests
//! without network calls.

mod hyperliquid;
mod mock;

pub use hyperliquid::HyperliquidClient;
pub use mock::MockFillsSource;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::IngestError;

/// One fill as returned by the upstream. `px` and `sz` arrive as decimal
/// strings and are parsed downstream; unknown response fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFill {
    pub time: u64,
    pub coin: String,
    pub side: String,
    pub px: String,
    pub sz: String,
    pub hash: String,
    pub tid: u64,
}

/// Source of per-wallet fills.
#[async_trait]
pub trait FillsSource: Send + Sync {
    /// Fetch fills for `address` from `start_millis` (ms since epoch)
    /// onwards. Negative starts are clamped to zero; the upstream rejects
    /// them.
    async fn fetch_fills(
        &self,
        address: &str,
        start_millis: i64,
    ) -> Result<Vec<RawFill>, IngestError>;
}
