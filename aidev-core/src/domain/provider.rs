//! Provider domain types
//!
//! A provider profile is one AI completion endpoint plus one model, together
//! with the live quota and health state the gateway keeps for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a provider profile: provider name plus model id
///
/// Rendered as `provider:model`. Model ids frequently contain `/`
/// (e.g. `qwen/qwen3-coder-480b-a35b-instruct`), so parsing splits on the
/// first colon only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId {
    pub provider: String,
    pub model: String,
}

impl ProviderId {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider.trim(), model.trim()))
            }
            _ => Err(format!(
                "invalid provider id '{}', expected 'provider:model'",
                s
            )),
        }
    }
}

/// Logical function in the resolution process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Architect,
    Coder,
    Reviewer,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Planner, Role::Architect, Role::Coder, Role::Reviewer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Architect => "architect",
            Role::Coder => "coder",
            Role::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planner" => Ok(Role::Planner),
            "architect" => Ok(Role::Architect),
            "coder" => Ok(Role::Coder),
            "reviewer" => Ok(Role::Reviewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Health of a provider profile as seen by the routing algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Exhausted,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Classified reason a provider call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Transport,
    RateLimited,
    QuotaExceeded,
    Server,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::Transport => write!(f, "transport"),
            ProviderErrorKind::RateLimited => write!(f, "rate_limited"),
            ProviderErrorKind::QuotaExceeded => write!(f, "quota_exceeded"),
            ProviderErrorKind::Server => write!(f, "server"),
        }
    }
}

/// How the quota accounting window resets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindowKind {
    /// Usage resets to zero when `window_started_at + window_secs` is reached
    Fixed,
    /// Usage is the sum of entries younger than `window_secs`
    Rolling,
}

/// Maximum usage a profile may consume within one window
///
/// A `None` dimension is unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaCeiling {
    pub max_requests: Option<u64>,
    pub max_tokens: Option<u64>,
    pub window: QuotaWindowKind,
    pub window_secs: u64,
}

impl Default for QuotaCeiling {
    fn default() -> Self {
        Self {
            max_requests: None,
            max_tokens: None,
            window: QuotaWindowKind::Fixed,
            window_secs: 86_400,
        }
    }
}

/// Usage consumed in the current window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub requests: u64,
    pub tokens: u64,
    pub window_started_at: Option<DateTime<Utc>>,
}

/// Configuration plus live quota/health state for one provider+model pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: ProviderId,
    /// Roles this profile may serve; empty means any role it is bound to
    pub roles: Vec<Role>,
    pub ceiling: QuotaCeiling,
    pub usage: QuotaUsage,
    pub health: HealthStatus,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<ProviderErrorKind>,
    pub consecutive_failures: u32,
    /// Rate-limit backoff timer; the profile is deprioritized until it passes
    pub backoff_until: Option<DateTime<Utc>>,
    /// When an exhausted profile becomes routable again
    pub exhausted_until: Option<DateTime<Utc>>,
}

impl ProviderProfile {
    pub fn new(id: ProviderId, roles: Vec<Role>, ceiling: QuotaCeiling) -> Self {
        Self {
            id,
            roles,
            ceiling,
            usage: QuotaUsage::default(),
            health: HealthStatus::Healthy,
            last_error_at: None,
            last_error: None,
            consecutive_failures: 0,
            backoff_until: None,
            exhausted_until: None,
        }
    }

    /// Whether this profile may serve `role`
    pub fn serves(&self, role: Role) -> bool {
        self.roles.is_empty() || self.roles.contains(&role)
    }
}

/// Ordered provider list for one role, primary first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub role: Role,
    pub providers: Vec<ProviderId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_round_trips_models_with_slashes() {
        let id: ProviderId = "nvidia:qwen/qwen3-coder-480b-a35b-instruct".parse().unwrap();
        assert_eq!(id.provider, "nvidia");
        assert_eq!(id.model, "qwen/qwen3-coder-480b-a35b-instruct");
        assert_eq!(id.to_string(), "nvidia:qwen/qwen3-coder-480b-a35b-instruct");
    }

    #[test]
    fn test_provider_id_rejects_missing_model() {
        assert!("nvidia".parse::<ProviderId>().is_err());
        assert!("nvidia:".parse::<ProviderId>().is_err());
        assert!(":model".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Coder".parse::<Role>().unwrap(), Role::Coder);
        assert!("janitor".parse::<Role>().is_err());
    }

    #[test]
    fn test_profile_serves_any_role_when_affinities_empty() {
        let mut profile =
            ProviderProfile::new(ProviderId::new("a", "m"), vec![], QuotaCeiling::default());
        assert!(profile.serves(Role::Reviewer));

        profile.roles = vec![Role::Coder];
        assert!(profile.serves(Role::Coder));
        assert!(!profile.serves(Role::Planner));
    }
}
