//! Candidate ordering for role-based failover
//!
//! Pure functions over profile snapshots: given the profiles bound to a role
//! (in binding order) and the current time, decide which of them are
//! routable and in what order they are tried.

use aidev_core::domain::provider::{HealthStatus, ProviderProfile, Role};
use chrono::{DateTime, Utc};

/// Routing tier of a profile, lowest is tried first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Healthy,
    /// Degraded, backoff timer elapsed or never set
    DegradedReady,
    /// Degraded, still inside its backoff window
    DegradedBackoff,
}

/// Tier of `profile` at `now`, `None` when it must not be routed to
pub fn tier(profile: &ProviderProfile, now: DateTime<Utc>) -> Option<Tier> {
    match profile.health {
        HealthStatus::Exhausted => None,
        HealthStatus::Healthy => Some(Tier::Healthy),
        HealthStatus::Degraded => match profile.backoff_until {
            Some(until) if until > now => Some(Tier::DegradedBackoff),
            _ => Some(Tier::DegradedReady),
        },
    }
}

/// Orders the profiles bound to `role`
///
/// Exhausted profiles and profiles without affinity for the role are
/// dropped. The sort is stable, so binding order decides within a tier.
pub fn order_candidates(
    role: Role,
    profiles: Vec<ProviderProfile>,
    now: DateTime<Utc>,
) -> Vec<ProviderProfile> {
    let mut tiered: Vec<(Tier, ProviderProfile)> = profiles
        .into_iter()
        .filter(|p| p.serves(role))
        .filter_map(|p| tier(&p, now).map(|t| (t, p)))
        .collect();
    tiered.sort_by_key(|(t, _)| *t);
    tiered.into_iter().map(|(_, p)| p).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidev_core::domain::provider::{ProviderId, QuotaCeiling};
    use chrono::Duration;

    fn profile(name: &str, health: HealthStatus) -> ProviderProfile {
        let mut p = ProviderProfile::new(ProviderId::new(name, "m"), vec![], QuotaCeiling::default());
        p.health = health;
        p
    }

    fn names(profiles: &[ProviderProfile]) -> Vec<&str> {
        profiles.iter().map(|p| p.id.provider.as_str()).collect()
    }

    #[test]
    fn test_exhausted_profiles_are_never_candidates() {
        let now = Utc::now();
        let ordered = order_candidates(
            Role::Coder,
            vec![
                profile("a", HealthStatus::Exhausted),
                profile("b", HealthStatus::Healthy),
            ],
            now,
        );
        assert_eq!(names(&ordered), vec!["b"]);
    }

    #[test]
    fn test_healthy_before_degraded_and_backoff_last() {
        let now = Utc::now();
        let mut backing_off = profile("a", HealthStatus::Degraded);
        backing_off.backoff_until = Some(now + Duration::seconds(30));
        let mut ready = profile("b", HealthStatus::Degraded);
        ready.backoff_until = Some(now - Duration::seconds(1));
        let healthy = profile("c", HealthStatus::Healthy);

        let ordered = order_candidates(Role::Coder, vec![backing_off, ready, healthy], now);
        assert_eq!(names(&ordered), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_binding_order_kept_within_tier() {
        let now = Utc::now();
        let ordered = order_candidates(
            Role::Planner,
            vec![
                profile("primary", HealthStatus::Healthy),
                profile("secondary", HealthStatus::Healthy),
            ],
            now,
        );
        assert_eq!(names(&ordered), vec!["primary", "secondary"]);
    }

    #[test]
    fn test_role_affinity_filters_profiles() {
        let now = Utc::now();
        let mut coder_only = profile("a", HealthStatus::Healthy);
        coder_only.roles = vec![Role::Coder];
        let ordered = order_candidates(
            Role::Reviewer,
            vec![coder_only, profile("b", HealthStatus::Healthy)],
            now,
        );
        assert_eq!(names(&ordered), vec!["b"]);
    }
}
