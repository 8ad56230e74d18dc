//! Provider DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::provider::{HealthStatus, ProviderErrorKind, ProviderProfile, Role};

/// Operator view of one provider profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// `provider:model`
    pub id: String,
    pub roles: Vec<Role>,
    pub health: HealthStatus,
    pub requests: u64,
    pub max_requests: Option<u64>,
    pub tokens: u64,
    pub max_tokens: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<ProviderErrorKind>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub exhausted_until: Option<DateTime<Utc>>,
}

impl From<&ProviderProfile> for ProviderStatus {
    fn from(profile: &ProviderProfile) -> Self {
        ProviderStatus {
            id: profile.id.to_string(),
            roles: profile.roles.clone(),
            health: profile.health,
            requests: profile.usage.requests,
            max_requests: profile.ceiling.max_requests,
            tokens: profile.usage.tokens,
            max_tokens: profile.ceiling.max_tokens,
            consecutive_failures: profile.consecutive_failures,
            last_error: profile.last_error,
            last_error_at: profile.last_error_at,
            backoff_until: profile.backoff_until,
            exhausted_until: profile.exhausted_until,
        }
    }
}
