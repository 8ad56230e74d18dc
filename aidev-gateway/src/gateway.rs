//! AI gateway: role-based routing with failover

use aidev_core::domain::audit::CallOutcome;
use aidev_core::domain::provider::{ProviderId, Role};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GatewayError, ProviderError, Result};
use crate::provider::{Chunk, CompletionProvider, CompletionRequest};
use crate::registry::ProviderRegistry;
use crate::roles::{InvokeRequest, RoleProfile};

/// Characters per token when a provider reports no usage
const CHARS_PER_TOKEN: usize = 4;

/// One provider tried during an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub provider: ProviderId,
    pub outcome: CallOutcome,
}

/// Successful completion plus the path that led to it
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub role: Role,
    pub provider: ProviderId,
    pub text: String,
    pub tokens_used: u64,
    /// Every attempt in order, the successful one last
    pub attempts: Vec<Attempt>,
}

struct Completion {
    text: String,
    reported_tokens: Option<u64>,
}

/// Routes role requests to provider profiles
pub struct AiGateway {
    registry: Arc<ProviderRegistry>,
    providers: HashMap<ProviderId, Arc<dyn CompletionProvider>>,
    roles: HashMap<Role, RoleProfile>,
    call_timeout: Duration,
}

impl AiGateway {
    pub fn new(registry: Arc<ProviderRegistry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            roles: HashMap::new(),
            call_timeout,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.providers.insert(provider.id().clone(), provider);
        self
    }

    pub fn with_role_profile(mut self, role: Role, profile: RoleProfile) -> Self {
        self.roles.insert(role, profile);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn role_profile(&self, role: Role) -> RoleProfile {
        self.roles
            .get(&role)
            .cloned()
            .unwrap_or_else(|| RoleProfile::default_for(role))
    }

    /// Runs `request` under `role`, failing over across bound providers
    ///
    /// Candidates are tried in registry order. A candidate the quota
    /// accounting refuses is skipped without being contacted. Each contacted
    /// candidate's outcome is recorded in the registry before moving on.
    pub async fn invoke(&self, role: Role, request: &InvokeRequest) -> Result<GatewayResponse> {
        let completion = request.to_completion(&self.role_profile(role));
        let prompt_tokens = (completion.prompt_chars() / CHARS_PER_TOKEN) as u64;
        let estimate = prompt_tokens + completion.max_tokens as u64;

        let candidates = self.registry.candidates_for(role).await;
        if candidates.is_empty() {
            warn!("No routable provider for role {}", role);
        }

        let mut attempts = Vec::new();
        for profile in candidates {
            let id = profile.id;
            let Some(provider) = self.providers.get(&id) else {
                warn!("Provider {} has no client configured, skipping", id);
                continue;
            };

            let reservation = match self.registry.reserve(&id, estimate).await {
                Ok(Some(reservation)) => reservation,
                Ok(None) => {
                    info!("Provider {} has no quota headroom for role {}", id, role);
                    attempts.push(Attempt {
                        provider: id,
                        outcome: CallOutcome::QuotaRefused,
                    });
                    continue;
                }
                Err(e) => {
                    warn!("Skipping provider {}: {}", id, e);
                    continue;
                }
            };

            let result = match tokio::time::timeout(
                self.call_timeout,
                collect(provider.as_ref(), &completion),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.call_timeout)),
            };

            match result {
                Ok(done) => {
                    let tokens = done.reported_tokens.unwrap_or_else(|| {
                        ((completion.prompt_chars() + done.text.len()) / CHARS_PER_TOKEN) as u64
                    });
                    if let Err(e) = self.registry.settle_success(reservation, tokens).await {
                        warn!("Failed to record success for {}: {}", id, e);
                    }
                    info!("Role {} served by {} ({} tokens)", role, id, tokens);
                    attempts.push(Attempt {
                        provider: id.clone(),
                        outcome: CallOutcome::Succeeded { tokens },
                    });
                    return Ok(GatewayResponse {
                        role,
                        provider: id,
                        text: done.text,
                        tokens_used: tokens,
                        attempts,
                    });
                }
                Err(err) => {
                    let kind = err.kind();
                    warn!("Provider {} failed for role {}: {}", id, role, err);
                    if let Err(e) = self.registry.settle_failure(reservation, kind).await {
                        warn!("Failed to record failure for {}: {}", id, e);
                    }
                    attempts.push(Attempt {
                        provider: id,
                        outcome: CallOutcome::Failed {
                            error: kind,
                            message: err.to_string(),
                        },
                    });
                }
            }
        }

        Err(GatewayError::AllProvidersFailed { role, attempts })
    }
}

/// Drains a provider stream; any error discards the text received so far
async fn collect(
    provider: &dyn CompletionProvider,
    request: &CompletionRequest,
) -> std::result::Result<Completion, ProviderError> {
    let mut stream = provider.stream(request).await?;
    let mut text = String::new();
    let mut reported_tokens = None;

    while let Some(chunk) = stream.next().await {
        match chunk? {
            Chunk::Text(piece) => text.push_str(&piece),
            Chunk::Usage { total_tokens } => reported_tokens = Some(total_tokens),
        }
    }

    if text.trim().is_empty() {
        return Err(ProviderError::EmptyCompletion);
    }
    Ok(Completion {
        text,
        reported_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::provider::ChunkStream;
    use crate::registry::HealthPolicy;
    use aidev_core::domain::provider::{
        HealthStatus, ProviderErrorKind, ProviderProfile, QuotaCeiling, RoleBinding,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Script {
        Reply(&'static str),
        Fail(ProviderError),
        FailMidStream(&'static str),
        Hang,
    }

    struct ScriptedProvider {
        id: ProviderId,
        script: Mutex<Vec<Script>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(name: &str, script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                id: ProviderId::new(name, "model"),
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        async fn stream(
            &self,
            _request: &CompletionRequest,
        ) -> std::result::Result<ChunkStream, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0].clone()
                }
            };
            match step {
                Script::Reply(text) => {
                    let items = vec![Ok(Chunk::Text(text.to_string()))];
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Script::Fail(err) => Err(err),
                Script::FailMidStream(partial) => {
                    let items = vec![
                        Ok(Chunk::Text(partial.to_string())),
                        Err(ProviderError::StreamInterrupted("reset".to_string())),
                    ];
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Err(ProviderError::Transport("unreachable".to_string()))
                }
            }
        }
    }

    async fn gateway(providers: &[(Arc<ScriptedProvider>, QuotaCeiling)]) -> AiGateway {
        let registry = Arc::new(ProviderRegistry::new(
            HealthPolicy::default(),
            Arc::new(ManualClock::default()),
        ));
        let mut ids = Vec::new();
        for (provider, ceiling) in providers {
            registry
                .register(ProviderProfile::new(
                    provider.id.clone(),
                    vec![],
                    ceiling.clone(),
                ))
                .await
                .unwrap();
            ids.push(provider.id.clone());
        }
        registry
            .bind(RoleBinding {
                role: Role::Coder,
                providers: ids,
            })
            .await;

        let mut gateway = AiGateway::new(registry, Duration::from_millis(200));
        for (provider, _) in providers {
            gateway = gateway.with_provider(provider.clone());
        }
        gateway
    }

    #[tokio::test]
    async fn test_quota_exceeded_fails_over_and_exhausts_primary() {
        let primary = ScriptedProvider::new(
            "primary",
            vec![Script::Fail(ProviderError::QuotaExceeded("daily cap".to_string()))],
        );
        let secondary = ScriptedProvider::new("secondary", vec![Script::Reply("patched")]);
        let gateway = gateway(&[
            (primary.clone(), QuotaCeiling::default()),
            (secondary.clone(), QuotaCeiling::default()),
        ])
        .await;

        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();

        assert_eq!(response.provider, secondary.id);
        assert_eq!(response.text, "patched");
        assert_eq!(response.attempts.len(), 2);
        assert!(matches!(
            response.attempts[0].outcome,
            CallOutcome::Failed {
                error: ProviderErrorKind::QuotaExceeded,
                ..
            }
        ));

        let profile = gateway.registry().profile(&primary.id).await.unwrap();
        assert_eq!(profile.health, HealthStatus::Exhausted);

        // The exhausted primary is not contacted again.
        gateway
            .invoke(Role::Coder, &InvokeRequest::new("again"))
            .await
            .unwrap();
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 2);
    }

    #[tokio::test]
    async fn test_all_exhausted_fails_without_contacting_anyone() {
        let a = ScriptedProvider::new("a", vec![Script::Reply("x")]);
        let b = ScriptedProvider::new("b", vec![Script::Reply("y")]);
        let gateway = gateway(&[
            (a.clone(), QuotaCeiling::default()),
            (b.clone(), QuotaCeiling::default()),
        ])
        .await;
        for p in [&a, &b] {
            gateway
                .registry()
                .record_failure(&p.id, ProviderErrorKind::QuotaExceeded)
                .await
                .unwrap();
        }

        let err = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap_err();

        match err {
            GatewayError::AllProvidersFailed { role, attempts } => {
                assert_eq!(role, Role::Coder);
                assert!(attempts.is_empty());
            }
        }
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_restores_degraded_profile() {
        let only = ScriptedProvider::new(
            "only",
            vec![
                Script::Fail(ProviderError::RateLimited("429".to_string())),
                Script::Reply("ok"),
            ],
        );
        let gateway = gateway(&[(only.clone(), QuotaCeiling::default())]).await;

        let err = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AllProvidersFailed { .. }));
        let profile = gateway.registry().profile(&only.id).await.unwrap();
        assert_eq!(profile.health, HealthStatus::Degraded);

        // Still a candidate while backing off, just ranked last.
        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        let profile = gateway.registry().profile(&only.id).await.unwrap();
        assert_eq!(profile.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_counts_as_failure() {
        let flaky = ScriptedProvider::new("flaky", vec![Script::FailMidStream("half a pat")]);
        let steady = ScriptedProvider::new("steady", vec![Script::Reply("whole patch")]);
        let gateway = gateway(&[
            (flaky.clone(), QuotaCeiling::default()),
            (steady.clone(), QuotaCeiling::default()),
        ])
        .await;

        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();

        assert_eq!(response.text, "whole patch");
        assert!(matches!(
            response.attempts[0].outcome,
            CallOutcome::Failed {
                error: ProviderErrorKind::Transport,
                ..
            }
        ));
        let profile = gateway.registry().profile(&flaky.id).await.unwrap();
        assert_eq!(profile.consecutive_failures, 1);
        assert_eq!(profile.last_error, Some(ProviderErrorKind::Transport));
    }

    #[tokio::test]
    async fn test_hung_provider_times_out_and_fails_over() {
        let slow = ScriptedProvider::new("slow", vec![Script::Hang]);
        let fast = ScriptedProvider::new("fast", vec![Script::Reply("done")]);
        let gateway = gateway(&[
            (slow.clone(), QuotaCeiling::default()),
            (fast.clone(), QuotaCeiling::default()),
        ])
        .await;

        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();
        assert_eq!(response.provider, fast.id);
    }

    #[tokio::test]
    async fn test_quota_refusal_skips_provider_without_contact() {
        let tiny = ScriptedProvider::new("tiny", vec![Script::Reply("x")]);
        let big = ScriptedProvider::new("big", vec![Script::Reply("y")]);
        let gateway = gateway(&[
            (
                tiny.clone(),
                QuotaCeiling {
                    max_tokens: Some(10),
                    ..QuotaCeiling::default()
                },
            ),
            (big.clone(), QuotaCeiling::default()),
        ])
        .await;

        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();

        assert_eq!(response.provider, big.id);
        assert_eq!(response.attempts[0].outcome, CallOutcome::QuotaRefused);
        assert_eq!(tiny.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_fallback_estimates_from_characters() {
        let p = ScriptedProvider::new("p", vec![Script::Reply("abcdefgh")]);
        let gateway = gateway(&[(p.clone(), QuotaCeiling::default())]).await;

        let response = gateway
            .invoke(Role::Coder, &InvokeRequest::new("fix"))
            .await
            .unwrap();

        let completion = InvokeRequest::new("fix").to_completion(&RoleProfile::default_for(Role::Coder));
        let expected = ((completion.prompt_chars() + 8) / CHARS_PER_TOKEN) as u64;
        assert_eq!(response.tokens_used, expected);
        let profile = gateway.registry().profile(&p.id).await.unwrap();
        assert_eq!(profile.usage.tokens, expected);
        assert_eq!(profile.usage.requests, 1);
    }
}
