//! Unified error type for the ingestion worker.
//!
//! The variants mirror how the job queue treats a failure: most errors are
//! retried with backoff, constraint violations fail the job immediately.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// The upstream told us to slow down. The governor backs off 10 s and the
    /// job is retried through the queue.
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// Network trouble or an upstream 5xx. Retried.
    #[error("upstream error: {0}")]
    UpstreamTransient(String),

    /// The upstream returned something we could not decode. Retried until
    /// `max_attempts`; the operator inspects `last_error`.
    #[error("upstream returned malformed data: {0}")]
    UpstreamMalformed(String),

    /// No monthly partition exists for an incoming fill's timestamp. Retried;
    /// an operator must create the partition.
    #[error("missing fills partition: {0}")]
    PartitionMissing(String),

    /// A CHECK or foreign-key violation. No retry would succeed.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A job payload that does not decode for its kind. No retry would succeed.
    #[error("invalid job payload: {0}")]
    Payload(String),

    #[error("unknown job kind: {0}")]
    UnknownJobKind(String),

    /// Operation not available in the current governor mode.
    #[error("{0} is not supported by this governor mode")]
    Unsupported(&'static str),
}

impl IngestError {
    /// Errors where retrying can never succeed; the worker fails the job
    /// immediately instead of burning attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestError::ConstraintViolation(_)
                | IngestError::Payload(_)
                | IngestError::UnknownJobKind(_)
        )
    }
}

/// Map a database error from the fills insert path onto the taxonomy.
///
/// Postgres reports a missing range partition with SQLSTATE 23514 and a
/// "no partition of relation" message, so the message check must run before
/// the generic class-23 check.
pub fn classify_db_error(err: sqlx::Error) -> IngestError {
    if let sqlx::Error::Database(ref db) = err {
        let message = db.message().to_string();
        if message.contains("no partition of relation") {
            return IngestError::PartitionMissing(message);
        }
        if let Some(code) = db.code() {
            if code.starts_with("23") {
                return IngestError::ConstraintViolation(message);
            }
        }
    }
    IngestError::Database(err)
}

/// The upstream signals rate limiting through message content rather than a
/// structured error body.
pub fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("too many")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detected_by_message_content() {
        assert!(is_rate_limit_message("Rate limit exceeded"));
        assert!(is_rate_limit_message("429 Too Many Requests"));
        assert!(!is_rate_limit_message("connection reset by peer"));
    }

    #[test]
    fn terminal_errors_skip_retry() {
        assert!(IngestError::ConstraintViolation("fk".into()).is_terminal());
        assert!(IngestError::Payload("bad".into()).is_terminal());
        assert!(!IngestError::RateLimited("slow down".into()).is_terminal());
        assert!(!IngestError::PartitionMissing("2027-01".into()).is_terminal());
        assert!(!IngestError::UpstreamMalformed("not json".into()).is_terminal());
    }
}
