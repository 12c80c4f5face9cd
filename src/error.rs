//! Engine error taxonomy.
//!
//! Classifies every failure the engine can hit so callers can decide
//! retry / record / abort without string-matching messages.

use std::time::Duration;

/// All failure classes the engine distinguishes.
///
/// Propagation rules:
/// - `Transport` is retried locally with backoff (max 3 attempts), then
///   downgraded to a recorded run-level error.
/// - `Quota` retires the affected credential and the run continues.
/// - `Auth` disables the credential and the run continues.
/// - `Protocol` / `Content` are recorded per-entity and never halt a run.
/// - `Conflict` is returned to the caller for retry.
/// - `Fatal` aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Pre-run configuration problems. Always fatal before any work starts.
    #[error("config: {0}")]
    Config(String),

    /// A credential was rejected by the provider.
    #[error("auth: credential {credential_id} rejected: {message}")]
    Auth {
        credential_id: String,
        message: String,
    },

    /// A per-credential or global quota was hit.
    #[error("quota: {0}")]
    Quota(String),

    /// Timeout, connection failure, or HTTP 5xx. Retryable.
    #[error("transport: {message}")]
    Transport {
        message: String,
        /// Status code when the failure was an HTTP response.
        status: Option<u16>,
    },

    /// HTTP 4xx or a response whose shape we do not understand. Terminal
    /// for the current unit of work.
    #[error("protocol: {message}")]
    Protocol {
        message: String,
        status: Option<u16>,
    },

    /// The payload was fetched but could not be used: parse failure, no
    /// brand match, empty menu.
    #[error("content: {0}")]
    Content(String),

    /// The rule engine rejected the entity.
    #[error("policy: {0}")]
    Policy(String),

    /// Optimistic-concurrency mismatch. The caller re-reads and retries.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant was violated. Aborts the run.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl EngineError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Whether a local retry with backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport { .. })
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal(_) | EngineError::Config(_))
    }

    /// Classify an HTTP status into the taxonomy.
    pub fn from_status(status: u16, context: &str) -> Self {
        match status {
            429 => EngineError::Quota(format!("{context}: provider returned 429")),
            s if s >= 500 => EngineError::Transport {
                message: format!("{context}: server error"),
                status: Some(s),
            },
            s => EngineError::Protocol {
                message: format!("{context}: unexpected status"),
                status: Some(s),
            },
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return EngineError::Transport {
                message: e.to_string(),
                status: None,
            };
        }
        match e.status() {
            Some(status) => EngineError::from_status(status.as_u16(), "http"),
            None => EngineError::Transport {
                message: e.to_string(),
                status: None,
            },
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Exponential backoff schedule for transport retries: 1s, 2s, 4s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            EngineError::from_status(503, "search"),
            EngineError::Transport { status: Some(503), .. }
        ));
        assert!(matches!(
            EngineError::from_status(404, "search"),
            EngineError::Protocol { status: Some(404), .. }
        ));
        assert!(matches!(
            EngineError::from_status(429, "search"),
            EngineError::Quota(_)
        ));
    }

    #[test]
    fn retryable_and_fatal() {
        assert!(EngineError::transport("timeout").is_retryable());
        assert!(!EngineError::Content("no brand match".into()).is_retryable());
        assert!(EngineError::Fatal("invariant".into()).is_fatal());
        assert!(EngineError::Config("missing key".into()).is_fatal());
        assert!(!EngineError::Quota("daily cap".into()).is_fatal());
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        // Capped at the third step.
        assert_eq!(backoff_delay(9), Duration::from_secs(4));
    }
}
