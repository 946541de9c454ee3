//! Typed job payloads.
//!
//! The queue stores an opaque JSONB blob plus a `kind` column; handlers
//! decode strongly through [`JobPayload`] so a payload/kind mismatch
//! surfaces as a terminal job error instead of a runtime surprise.

use std::fmt;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;

/// The three job kinds the worker knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    IngestWallet,
    RollupWalletDay,
    RollupGlobalDay,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::IngestWallet => "ingest_wallet",
            JobKind::RollupWalletDay => "rollup_wallet_day",
            JobKind::RollupGlobalDay => "rollup_global_day",
        }
    }

    pub fn parse(s: &str) -> Option<JobKind> {
        match s {
            "ingest_wallet" => Some(JobKind::IngestWallet),
            "rollup_wallet_day" => Some(JobKind::RollupWalletDay),
            "rollup_global_day" => Some(JobKind::RollupGlobalDay),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestWalletPayload {
    pub org_id: Uuid,
    pub wallet_id: i64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupWalletDayPayload {
    pub org_id: Uuid,
    pub wallet_id: i64,
    pub days: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupGlobalDayPayload {
    pub org_id: Uuid,
    pub days: Vec<NaiveDate>,
}

/// Sum type over the three job payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    IngestWallet(IngestWalletPayload),
    RollupWalletDay(RollupWalletDayPayload),
    RollupGlobalDay(RollupGlobalDayPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::IngestWallet(_) => JobKind::IngestWallet,
            JobPayload::RollupWalletDay(_) => JobKind::RollupWalletDay,
            JobPayload::RollupGlobalDay(_) => JobKind::RollupGlobalDay,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, IngestError> {
        let value = match self {
            JobPayload::IngestWallet(p) => serde_json::to_value(p),
            JobPayload::RollupWalletDay(p) => serde_json::to_value(p),
            JobPayload::RollupGlobalDay(p) => serde_json::to_value(p),
        };
        value.map_err(|e| IngestError::Payload(e.to_string()))
    }

    pub fn decode(kind: JobKind, value: &serde_json::Value) -> Result<JobPayload, IngestError> {
        Ok(match kind {
            JobKind::IngestWallet => JobPayload::IngestWallet(decode_as(value)?),
            JobKind::RollupWalletDay => JobPayload::RollupWalletDay(decode_as(value)?),
            JobKind::RollupGlobalDay => JobPayload::RollupGlobalDay(decode_as(value)?),
        })
    }
}

/// Decode a payload blob into the struct a handler expects.
pub fn decode_as<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, IngestError> {
    serde_json::from_value(value.clone()).map_err(|e| IngestError::Payload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> Uuid {
        Uuid::parse_str("3f0e8c3a-7e27-4e6f-8f2c-3a6d5b9d1e42").unwrap()
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            JobKind::IngestWallet,
            JobKind::RollupWalletDay,
            JobKind::RollupGlobalDay,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse("compact_segments"), None);
    }

    #[test]
    fn ingest_payload_round_trips() {
        let payload = JobPayload::IngestWallet(IngestWalletPayload {
            org_id: org(),
            wallet_id: 7,
            address: "0x1234567890abcdef1234567890abcdef12345678".into(),
        });
        let value = payload.to_value().unwrap();
        assert_eq!(value["wallet_id"], 7);
        let decoded = JobPayload::decode(JobKind::IngestWallet, &value).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn days_serialize_as_iso_dates() {
        let payload = JobPayload::RollupWalletDay(RollupWalletDayPayload {
            org_id: org(),
            wallet_id: 7,
            days: vec![NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()],
        });
        let value = payload.to_value().unwrap();
        assert_eq!(value["days"][0], "2026-01-01");
    }

    #[test]
    fn decoding_wrong_shape_is_a_payload_error() {
        let value = serde_json::json!({"org_id": org(), "days": ["2026-01-01"]});
        let err = JobPayload::decode(JobKind::IngestWallet, &value).unwrap_err();
        assert!(matches!(err, IngestError::Payload(_)));
    }
}
