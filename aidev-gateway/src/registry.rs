//! Provider registry
//!
//! Holds every provider profile with its quota ceiling, usage and health.
//! Each profile sits behind its own lock so that concurrent gateway calls
//! for different providers never contend, while reserve/record on the same
//! profile are serialized and cannot lose updates.

use aidev_core::domain::provider::{
    HealthStatus, ProviderErrorKind, ProviderId, ProviderProfile, QuotaWindowKind, Role,
    RoleBinding,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::RegistryError;
use crate::failover;

/// Thresholds driving health transitions
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Consecutive non-quota failures before a profile turns degraded
    pub failure_threshold: u32,
    /// First rate-limit backoff; doubles per consecutive rate limit
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl HealthPolicy {
    /// Backoff after the `strikes`-th consecutive rate limit
    pub fn backoff_for(&self, strikes: u32) -> Duration {
        let factor = 2u32.saturating_pow(strikes.saturating_sub(1).min(16));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

/// Headroom held for one in-flight call
///
/// Obtained from [`ProviderRegistry::reserve`] and consumed by
/// [`ProviderRegistry::settle_success`] or [`ProviderRegistry::settle_failure`].
#[derive(Debug)]
pub struct Reservation {
    pub id: ProviderId,
    pub tokens: u64,
}

#[derive(Debug, Clone, Copy)]
struct UsageEntry {
    at: DateTime<Utc>,
    requests: u64,
    tokens: u64,
}

#[derive(Debug)]
struct Slot {
    profile: ProviderProfile,
    /// Charges inside the current rolling window, oldest first
    entries: VecDeque<UsageEntry>,
    /// Tokens held by in-flight reservations
    pending_tokens: u64,
    rate_limit_strikes: u32,
}

impl Slot {
    fn new(profile: ProviderProfile) -> Self {
        Self {
            profile,
            entries: VecDeque::new(),
            pending_tokens: 0,
            rate_limit_strikes: 0,
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.profile.ceiling.window_secs as i64)
    }

    /// Rolls the usage window forward and lifts exhaustion whose window has reset
    fn refresh(&mut self, now: DateTime<Utc>) {
        let window = self.window();
        match self.profile.ceiling.window {
            QuotaWindowKind::Fixed => {
                let started = *self.profile.usage.window_started_at.get_or_insert(now);
                if now >= started + window {
                    self.profile.usage.requests = 0;
                    self.profile.usage.tokens = 0;
                    self.profile.usage.window_started_at = Some(now);
                }
            }
            QuotaWindowKind::Rolling => {
                let cutoff = now - window;
                while self.entries.front().is_some_and(|e| e.at <= cutoff) {
                    self.entries.pop_front();
                }
                self.profile.usage.requests = self.entries.iter().map(|e| e.requests).sum();
                self.profile.usage.tokens = self.entries.iter().map(|e| e.tokens).sum();
                self.profile.usage.window_started_at = self.entries.front().map(|e| e.at);
            }
        }

        if self.profile.health == HealthStatus::Exhausted
            && self.profile.exhausted_until.is_some_and(|until| until <= now)
        {
            info!("Provider {} quota window reset, back to healthy", self.profile.id);
            self.profile.health = HealthStatus::Healthy;
            self.profile.exhausted_until = None;
            self.profile.consecutive_failures = 0;
        }

        if self.profile.health != HealthStatus::Exhausted && self.at_ceiling() {
            self.exhaust(now);
        }
    }

    fn window_resets_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window = self.window();
        match self.profile.ceiling.window {
            QuotaWindowKind::Fixed => self.profile.usage.window_started_at.unwrap_or(now) + window,
            QuotaWindowKind::Rolling => {
                self.entries.front().map(|e| e.at).unwrap_or(now) + window
            }
        }
    }

    fn at_ceiling(&self) -> bool {
        let ceiling = &self.profile.ceiling;
        let usage = &self.profile.usage;
        ceiling.max_requests.is_some_and(|max| usage.requests >= max)
            || ceiling.max_tokens.is_some_and(|max| usage.tokens >= max)
    }

    fn exhaust(&mut self, now: DateTime<Utc>) {
        let until = self.window_resets_at(now);
        warn!("Provider {} exhausted until {}", self.profile.id, until);
        self.profile.health = HealthStatus::Exhausted;
        self.profile.exhausted_until = Some(until);
    }

    /// Whether one more request of `tokens` fits under the ceiling,
    /// counting `pending` tokens still held by in-flight reservations
    fn has_headroom(&self, tokens: u64, pending: u64) -> bool {
        let ceiling = &self.profile.ceiling;
        let usage = &self.profile.usage;
        let requests_ok = ceiling
            .max_requests
            .is_none_or(|max| usage.requests + 1 <= max);
        let tokens_ok = ceiling
            .max_tokens
            .is_none_or(|max| usage.tokens + pending + tokens <= max);
        requests_ok && tokens_ok
    }

    /// Adds usage, clamped so the counters never pass the ceiling
    fn charge(&mut self, now: DateTime<Utc>, requests: u64, tokens: u64) {
        let ceiling = self.profile.ceiling.clone();
        let usage = &mut self.profile.usage;
        let requests = match ceiling.max_requests {
            Some(max) => requests.min(max.saturating_sub(usage.requests)),
            None => requests,
        };
        let tokens = match ceiling.max_tokens {
            Some(max) => tokens.min(max.saturating_sub(usage.tokens)),
            None => tokens,
        };
        usage.requests += requests;
        usage.tokens += tokens;

        if ceiling.window == QuotaWindowKind::Rolling && (requests > 0 || tokens > 0) {
            self.entries.push_back(UsageEntry {
                at: now,
                requests,
                tokens,
            });
            self.profile.usage.window_started_at = self.entries.front().map(|e| e.at);
        }
    }

    fn succeed(&mut self, now: DateTime<Utc>, requests: u64, tokens: u64) {
        self.refresh(now);
        self.charge(now, requests, tokens);

        if self.profile.health == HealthStatus::Degraded {
            info!("Provider {} recovered", self.profile.id);
        }
        self.profile.consecutive_failures = 0;
        self.rate_limit_strikes = 0;
        self.profile.backoff_until = None;
        if self.profile.health != HealthStatus::Exhausted {
            self.profile.health = HealthStatus::Healthy;
        }

        if self.at_ceiling() {
            self.exhaust(now);
        }
    }

    fn fail(&mut self, now: DateTime<Utc>, kind: ProviderErrorKind, policy: &HealthPolicy) {
        self.refresh(now);
        self.profile.last_error_at = Some(now);
        self.profile.last_error = Some(kind);
        self.profile.consecutive_failures += 1;

        match kind {
            ProviderErrorKind::QuotaExceeded => self.exhaust(now),
            ProviderErrorKind::RateLimited => {
                self.rate_limit_strikes += 1;
                let backoff = policy.backoff_for(self.rate_limit_strikes);
                let until = now
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(5));
                warn!(
                    "Provider {} rate limited, backing off for {:?}",
                    self.profile.id, backoff
                );
                self.profile.backoff_until = Some(until);
                if self.profile.health == HealthStatus::Healthy {
                    self.profile.health = HealthStatus::Degraded;
                }
            }
            ProviderErrorKind::Transport | ProviderErrorKind::Server => {
                if self.profile.health == HealthStatus::Healthy
                    && self.profile.consecutive_failures >= policy.failure_threshold
                {
                    warn!(
                        "Provider {} degraded after {} consecutive failures",
                        self.profile.id, self.profile.consecutive_failures
                    );
                    self.profile.health = HealthStatus::Degraded;
                }
            }
        }
    }
}

/// Thread-safe store of provider profiles and role bindings
pub struct ProviderRegistry {
    slots: RwLock<HashMap<ProviderId, Arc<Mutex<Slot>>>>,
    bindings: RwLock<HashMap<Role, Vec<ProviderId>>>,
    policy: HealthPolicy,
    clock: Arc<dyn Clock>,
}

impl ProviderRegistry {
    pub fn new(policy: HealthPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    pub fn with_system_clock(policy: HealthPolicy) -> Self {
        Self::new(policy, Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub async fn register(&self, profile: ProviderProfile) -> Result<(), RegistryError> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&profile.id) {
            return Err(RegistryError::AlreadyRegistered(profile.id));
        }
        debug!("Registered provider profile {}", profile.id);
        slots.insert(profile.id.clone(), Arc::new(Mutex::new(Slot::new(profile))));
        Ok(())
    }

    /// Sets the ordered provider list for a role, replacing any previous one
    pub async fn bind(&self, binding: RoleBinding) {
        let mut bindings = self.bindings.write().await;
        bindings.insert(binding.role, binding.providers);
    }

    pub async fn bindings(&self) -> Vec<RoleBinding> {
        let bindings = self.bindings.read().await;
        let mut out: Vec<RoleBinding> = bindings
            .iter()
            .map(|(role, providers)| RoleBinding {
                role: *role,
                providers: providers.clone(),
            })
            .collect();
        out.sort_by_key(|b| b.role);
        out
    }

    async fn slot(&self, id: &ProviderId) -> Result<Arc<Mutex<Slot>>, RegistryError> {
        self.slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(id.clone()))
    }

    /// Routable profiles for `role`, in the order they should be tried
    ///
    /// Healthy profiles come first in binding order, then degraded profiles
    /// whose backoff has elapsed, then degraded profiles still backing off.
    /// Exhausted profiles are omitted. An empty list means the role cannot
    /// be served right now.
    pub async fn candidates_for(&self, role: Role) -> Vec<ProviderProfile> {
        let bound = {
            let bindings = self.bindings.read().await;
            bindings.get(&role).cloned().unwrap_or_default()
        };

        let now = self.clock.now();
        let mut profiles = Vec::with_capacity(bound.len());
        for id in &bound {
            match self.slot(id).await {
                Ok(slot) => {
                    let mut slot = slot.lock().await;
                    slot.refresh(now);
                    profiles.push(slot.profile.clone());
                }
                Err(_) => warn!("Role {} is bound to unknown provider {}", role, id),
            }
        }

        failover::order_candidates(role, profiles, now)
    }

    /// Holds headroom for one call of up to `estimated_tokens`
    ///
    /// Returns `None` and marks the profile exhausted when the call would
    /// exceed the ceiling on recorded usage alone; the provider must then not
    /// be contacted. When only other in-flight reservations stand in the way
    /// it returns `None` and leaves the profile healthy. The request itself is
    /// charged immediately.
    pub async fn reserve(
        &self,
        id: &ProviderId,
        estimated_tokens: u64,
    ) -> Result<Option<Reservation>, RegistryError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        let now = self.clock.now();
        slot.refresh(now);

        if slot.profile.health == HealthStatus::Exhausted {
            return Ok(None);
        }
        if !slot.has_headroom(estimated_tokens, 0) {
            warn!(
                "Provider {} refused: {} estimated tokens would exceed the ceiling",
                id, estimated_tokens
            );
            slot.exhaust(now);
            return Ok(None);
        }
        // Held by in-flight calls; skip this call only
        if !slot.has_headroom(estimated_tokens, slot.pending_tokens) {
            debug!(
                "Provider {} skipped: {} tokens already reserved by in-flight calls",
                id, slot.pending_tokens
            );
            return Ok(None);
        }

        slot.charge(now, 1, 0);
        slot.pending_tokens += estimated_tokens;
        Ok(Some(Reservation {
            id: id.clone(),
            tokens: estimated_tokens,
        }))
    }

    /// Records a successful call made under `reservation`
    pub async fn settle_success(
        &self,
        reservation: Reservation,
        tokens_used: u64,
    ) -> Result<HealthStatus, RegistryError> {
        let slot = self.slot(&reservation.id).await?;
        let mut slot = slot.lock().await;
        slot.pending_tokens = slot.pending_tokens.saturating_sub(reservation.tokens);
        slot.succeed(self.clock.now(), 0, tokens_used);
        Ok(slot.profile.health)
    }

    /// Records a failed call made under `reservation`
    pub async fn settle_failure(
        &self,
        reservation: Reservation,
        kind: ProviderErrorKind,
    ) -> Result<HealthStatus, RegistryError> {
        let slot = self.slot(&reservation.id).await?;
        let mut slot = slot.lock().await;
        slot.pending_tokens = slot.pending_tokens.saturating_sub(reservation.tokens);
        slot.fail(self.clock.now(), kind, &self.policy);
        Ok(slot.profile.health)
    }

    /// Records a successful call that was not reserved beforehand
    ///
    /// Charges one request plus `tokens_used` and restores the profile to
    /// healthy unless the charge reached the ceiling.
    pub async fn record_success(
        &self,
        id: &ProviderId,
        tokens_used: u64,
    ) -> Result<HealthStatus, RegistryError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.succeed(self.clock.now(), 1, tokens_used);
        Ok(slot.profile.health)
    }

    pub async fn record_failure(
        &self,
        id: &ProviderId,
        kind: ProviderErrorKind,
    ) -> Result<HealthStatus, RegistryError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.fail(self.clock.now(), kind, &self.policy);
        Ok(slot.profile.health)
    }

    pub async fn profile(&self, id: &ProviderId) -> Result<ProviderProfile, RegistryError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        slot.refresh(self.clock.now());
        Ok(slot.profile.clone())
    }

    /// Every profile, refreshed to the current time and sorted by id
    pub async fn snapshot(&self) -> Vec<ProviderProfile> {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().await.values().cloned().collect();
        let now = self.clock.now();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut slot = slot.lock().await;
            slot.refresh(now);
            out.push(slot.profile.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
