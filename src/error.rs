use std::time::Duration;
use thiserror::Error;

/// Failures of an external collaborator call (perception, reasoning, speech, playback).
///
/// None of these may take the orchestrator down. `Unavailable` and `Timeout` are retried once,
/// everything else degrades the current cycle to silence immediately.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service} returned a malformed response: {reason}")]
    MalformedResponse { service: String, reason: String },

    #[error("{service} rejected our credentials")]
    Authentication { service: String },
}

impl ServiceError {
    pub fn unavailable(service: &str, reason: impl ToString) -> Self {
        Self::Unavailable {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(service: &str, reason: impl ToString) -> Self {
        Self::MalformedResponse {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Classify a reqwest failure into the service taxonomy.
    pub fn from_http(service: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Self::Authentication {
                    service: service.to_string(),
                };
            }
        }
        if err.is_timeout() {
            return Self::Timeout {
                service: service.to_string(),
                after: Duration::ZERO,
            };
        }
        if err.is_decode() {
            return Self::malformed(service, err);
        }
        Self::unavailable(service, err)
    }
}

/// Startup and wiring failures. These are the only errors allowed to stop the daemon.
#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("authentication failed for {service}; check the endpoint credentials")]
    Authentication { service: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Service(ServiceError),
}

impl From<ServiceError> for CompanionError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Authentication { service } => Self::Authentication { service },
            other => Self::Service(other),
        }
    }
}
