//! Direct HTTP client for the exchange's `/info` endpoint.

use async_trait::async_trait;
use serde::Serialize;

use super::{FillsSource, RawFill};
use crate::config::UpstreamConfig;
use crate::error::{is_rate_limit_message, IngestError};

/// How much of an error body to keep in `last_error`.
const ERROR_BODY_LIMIT: usize = 200;

/// Request types for the `/info` endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum InfoRequest {
    #[serde(rename_all = "camelCase")]
    UserFillsByTime { user: String, start_time: u64 },
}

pub struct HyperliquidClient {
    http: reqwest::Client,
    base_url: String,
}

impl HyperliquidClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, IngestError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FillsSource for HyperliquidClient {
    async fn fetch_fills(
        &self,
        address: &str,
        start_millis: i64,
    ) -> Result<Vec<RawFill>, IngestError> {
        let request = InfoRequest::UserFillsByTime {
            user: address.to_string(),
            start_time: clamp_start(start_millis),
        };

        let url = format!("{}/info", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestError::UpstreamTransient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(IngestError::RateLimited("upstream returned 429".into()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IngestError::UpstreamTransient(e.to_string()))?;

        if !status.is_success() {
            let snippet = truncate(&body, ERROR_BODY_LIMIT);
            if is_rate_limit_message(&snippet) {
                return Err(IngestError::RateLimited(snippet));
            }
            return Err(IngestError::UpstreamTransient(format!(
                "status {status}: {snippet}"
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            IngestError::UpstreamMalformed(format!(
                "{e}: {}",
                truncate(&body, ERROR_BODY_LIMIT)
            ))
        })
    }
}

/// The upstream rejects negative start times.
fn clamp_start(start_millis: i64) -> u64 {
    start_millis.max(0) as u64
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_request_serialization() {
        let request = InfoRequest::UserFillsByTime {
            user: "0x1234567890abcdef1234567890abcdef12345678".to_string(),
            start_time: 1767225600000,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"userFillsByTime\""));
        assert!(json.contains("\"user\":\"0x1234567890abcdef1234567890abcdef12345678\""));
        assert!(json.contains("\"startTime\":1767225600000"));
    }

    #[test]
    fn negative_start_times_are_clamped() {
        assert_eq!(clamp_start(-600_000), 0);
        assert_eq!(clamp_start(0), 0);
        assert_eq!(clamp_start(42), 42);
    }

    #[test]
    fn fill_response_decodes_and_ignores_extras() {
        let body = r#"[{
            "time": 1767226500000,
            "coin": "ETH/USDC",
            "side": "B",
            "px": "2000.5",
            "sz": "0.5",
            "hash": "0xabc",
            "tid": 118712,
            "oid": 5,
            "crossed": true
        }]"#;
        let fills: Vec<RawFill> = serde_json::from_str(body).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].coin, "ETH/USDC");
        assert_eq!(fills[0].px, "2000.5");
        assert_eq!(fills[0].tid, 118712);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        let long = "é".repeat(300);
        let cut = truncate(&long, 201);
        assert!(cut.len() <= 205);
    }
}
