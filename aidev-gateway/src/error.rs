//! Error types for the AI gateway

use aidev_core::domain::provider::{ProviderErrorKind, ProviderId, Role};
use std::time::Duration;
use thiserror::Error;

use crate::gateway::Attempt;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failure of a single provider call
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection, TLS or body read failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not finish within the gateway's per-call bound
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Provider asked us to slow down (HTTP 429 without a quota marker)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Provider reported the account's quota as used up
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Provider answered with an error status
    #[error("provider error (status {status}): {message}")]
    Status { status: u16, message: String },

    /// Response body could not be understood
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The stream ended before the provider signalled completion
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Provider finished without producing any text
    #[error("empty completion")]
    EmptyCompletion,
}

impl ProviderError {
    /// Builds the error for a non-success HTTP status
    ///
    /// 402 and 429 responses whose body mentions a quota or billing limit are
    /// quota exhaustion; any other 429 is a rate limit.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            402 => Self::QuotaExceeded(body),
            429 if mentions_quota(&body) => Self::QuotaExceeded(body),
            429 => Self::RateLimited(body),
            _ => Self::Status {
                status,
                message: body,
            },
        }
    }

    /// Failover classification of this error
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::StreamInterrupted(_) => {
                ProviderErrorKind::Transport
            }
            Self::RateLimited(_) => ProviderErrorKind::RateLimited,
            Self::QuotaExceeded(_) => ProviderErrorKind::QuotaExceeded,
            Self::Status { .. } | Self::Malformed(_) | Self::EmptyCompletion => {
                ProviderErrorKind::Server
            }
        }
    }
}

fn mentions_quota(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    ["quota", "insufficient_quota", "billing", "credit", "exceeded your"]
        .iter()
        .any(|marker| body.contains(marker))
}

/// Registry lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown provider profile '{0}'")]
    UnknownProvider(ProviderId),

    #[error("provider profile '{0}' is already registered")]
    AlreadyRegistered(ProviderId),
}

/// Errors returned by [`crate::AiGateway::invoke`]
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Every candidate for the role failed or was refused; `attempts` lists
    /// each one in order. Empty when no candidate was routable at all.
    #[error("all providers failed for role '{role}' ({} attempts)", attempts.len())]
    AllProvidersFailed { role: Role, attempts: Vec<Attempt> },
}
