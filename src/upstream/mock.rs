//! Mock fill source for tests.

use async_trait::async_trait;

use super::{FillsSource, RawFill};
use crate::error::IngestError;

/// Configurable [`FillsSource`] test double. Uses a builder pattern; the
/// time-window filter mirrors the real endpoint so tests behave consistently
/// with production.
#[derive(Default, Clone)]
pub struct MockFillsSource {
    fills: Vec<RawFill>,
    error: Option<String>,
    rate_limited: bool,
}

impl MockFillsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fills(mut self, fills: Vec<RawFill>) -> Self {
        self.fills = fills;
        self
    }

    /// Every fetch fails with a transient upstream error.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Every fetch fails as rate-limited.
    pub fn rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self
    }
}

#[async_trait]
impl FillsSource for MockFillsSource {
    async fn fetch_fills(
        &self,
        _address: &str,
        start_millis: i64,
    ) -> Result<Vec<RawFill>, IngestError> {
        if self.rate_limited {
            return Err(IngestError::RateLimited("rate limit exceeded".into()));
        }
        if let Some(message) = &self.error {
            return Err(IngestError::UpstreamTransient(message.clone()));
        }
        let start = start_millis.max(0) as u64;
        Ok(self
            .fills
            .iter()
            .filter(|f| f.time >= start)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(time: u64) -> RawFill {
        RawFill {
            time,
            coin: "BTC".into(),
            side: "B".into(),
            px: "10".into(),
            sz: "2".into(),
            hash: "0xabc".into(),
            tid: time,
        }
    }

    #[tokio::test]
    async fn empty_mock_returns_no_fills() {
        let mock = MockFillsSource::new();
        let fills = mock.fetch_fills("0x123", 0).await.unwrap();
        assert!(fills.is_empty());
    }

    #[tokio::test]
    async fn window_filter_matches_real_endpoint() {
        let mock = MockFillsSource::new().with_fills(vec![fill(100), fill(200), fill(300)]);
        let fills = mock.fetch_fills("0x123", 200).await.unwrap();
        assert_eq!(fills.len(), 2);
    }

    #[tokio::test]
    async fn rate_limited_mock_signals_rate_limit() {
        let mock = MockFillsSource::new().rate_limited();
        let err = mock.fetch_fills("0x123", 0).await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited(_)));
    }
}
