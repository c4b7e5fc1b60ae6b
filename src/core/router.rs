//! Router orchestration
//!
//! Wires the estimator, state backend, latency tracker, predictor,
//! scorer and circuit breaker into the per-request pipeline:
//!
//! 1. Estimate tokens for the request.
//! 2. Resolve candidates: forced pinning, then session affinity, then
//!    the scored ranking.
//! 3. Walk the candidates behind the circuit-breaker guard until one
//!    succeeds; retriable failures advance, non-retriable ones surface.
//! 4. Record usage, latency and breaker state, refresh the session
//!    binding, fire the route observer.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::core::breaker::CircuitBreaker;
use crate::core::estimator::estimate_tokens;
use crate::core::latency::LatencyTracker;
use crate::core::predictor::ExhaustionPredictor;
use crate::core::scorer::{ScoreInput, Scorer};
use crate::core::types::{
    Priority, ProviderStatus, RouteEvent, RouteObserver, RouterRequest, RouterResponse,
    StatusSnapshot,
};
use crate::error::{ErrorKind, ProviderAttempt, Result, RouterError};
use crate::providers::{ChatCompletion, Provider, ProviderRegistry, StreamChunk};
use crate::state::{InMemoryStateBackend, RedisStateBackend, StateBackend};

/// Stream of completion fragments returned by [`Router::stream`].
pub type RouterStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Adaptive, rate-limit-aware LLM router.
pub struct Router {
    config: Arc<RouterConfig>,
    registry: ProviderRegistry,
    scorer: Scorer,
    latency: Arc<LatencyTracker>,
    predictor: Arc<ExhaustionPredictor>,
    breaker: Arc<CircuitBreaker>,
    state: Arc<dyn StateBackend>,
    observer: Option<Arc<dyn RouteObserver>>,
}

impl Router {
    /// Build a router from its configuration. Connects to the shared
    /// store when one is configured, otherwise state stays in-process.
    pub async fn new(config: RouterConfig) -> Result<Self> {
        config.validate().map_err(RouterError::Config)?;
        match &config.shared_store_url {
            Some(url) => {
                let backend = RedisStateBackend::connect(url).await?;
                let shared = backend.connection();
                let mut router = Self::with_backend(config, Arc::new(backend)).await?;
                router.breaker = Arc::new(
                    CircuitBreaker::new(
                        router.config.circuit_breaker.failure_threshold,
                        Duration::from_secs(router.config.circuit_breaker.cooldown_seconds),
                    )
                    .with_shared(shared),
                );
                Ok(router)
            }
            None => Self::with_backend(config, Arc::new(InMemoryStateBackend::new())).await,
        }
    }

    /// Build a router on top of a caller-supplied state backend.
    pub async fn with_backend(
        config: RouterConfig,
        state: Arc<dyn StateBackend>,
    ) -> Result<Self> {
        config.validate().map_err(RouterError::Config)?;

        let registry = ProviderRegistry::new();
        for provider in &config.providers {
            registry.register_from_config(provider).await?;
        }
        info!(providers = config.providers.len(), "router initialized");

        let scorer = Scorer::new(config.routing_weights, config.high_priority_reserve_fraction);
        let breaker = CircuitBreaker::new(
            config.circuit_breaker.failure_threshold,
            Duration::from_secs(config.circuit_breaker.cooldown_seconds),
        );
        let predictor = ExhaustionPredictor::new(&config.exhaustion, config.window_seconds);
        let latency = LatencyTracker::new(config.ema_alpha);

        Ok(Self {
            config: Arc::new(config),
            registry,
            scorer,
            latency: Arc::new(latency),
            predictor: Arc::new(predictor),
            breaker: Arc::new(breaker),
            state,
            observer: None,
        })
    }

    /// Load the configuration from a YAML file and build a router.
    pub async fn from_yaml(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(RouterConfig::from_yaml_file(path).await?).await
    }

    /// Build a router from environment variables.
    pub async fn from_env() -> Result<Self> {
        Self::new(RouterConfig::from_env()?).await
    }

    /// Attach a route observer. One event is delivered per completed
    /// attempt sequence; observer errors are logged and discarded.
    pub fn with_observer(mut self, observer: Arc<dyn RouteObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The provider registry, for runtime registration.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Register a pre-built adapter at runtime.
    pub async fn register_adapter(&self, adapter: Arc<dyn Provider>) {
        self.registry.register_adapter(adapter).await;
    }

    /// Register a BYOC provider: wrap a caller-configured
    /// `reqwest::Client` in the built-in adapter matching `name`.
    pub async fn register(
        &self,
        name: &str,
        client: reqwest::Client,
        model: &str,
        rpm_limit: u32,
        tpm_limit: u64,
        weight: f64,
    ) -> Result<()> {
        self.registry
            .register_byoc(name, client, model, rpm_limit, tpm_limit, weight)
            .await
    }

    // ========== Routing ==========

    /// Route a chat completion to the best available provider, falling
    /// back through the ranked candidates until one succeeds.
    pub async fn chat(&self, request: RouterRequest) -> Result<RouterResponse> {
        let estimated_tokens = estimate_tokens(&request.messages);
        let (candidates, bound) = self.resolve_candidates(&request, estimated_tokens).await?;

        let started = Instant::now();
        if candidates.is_empty() {
            self.emit_failure(&request, 0, started, None, None).await;
            return Err(RouterError::AllProvidersFailed { attempts: vec![] });
        }

        let deadline = self
            .config
            .fallback_budget_seconds
            .map(|secs| started + Duration::from_secs_f64(secs));

        let mut attempts = 0u32;
        let mut attempt_errors: Vec<ProviderAttempt> = Vec::new();

        for provider in candidates {
            let name = provider.name().to_string();

            // Open circuits are skipped without consuming an attempt.
            if self.breaker.guard(&name).await.is_err() {
                debug!(provider = %name, "skipping provider with open circuit");
                continue;
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!("fallback budget exhausted before next attempt");
                        break;
                    }
                    Some(remaining)
                }
                None => None,
            };

            attempts += 1;
            let call_started = Instant::now();
            let call = provider.chat(
                &request.messages,
                request.max_tokens,
                request.temperature,
                &request.options,
            );
            let outcome = match remaining {
                Some(remaining) => match tokio::time::timeout(remaining, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // The budget ran out mid-call; the provider did
                        // not fail, so no breaker event is recorded.
                        attempt_errors.push(ProviderAttempt {
                            provider: name.clone(),
                            kind: ErrorKind::Timeout,
                            message: "fallback budget exhausted".to_string(),
                        });
                        break;
                    }
                },
                None => call.await,
            };

            match outcome {
                Ok(completion) => {
                    let latency_ms = call_started.elapsed().as_secs_f64() * 1_000.0;
                    return self
                        .finish_chat(&request, provider, completion, latency_ms, attempts, bound.clone())
                        .await;
                }
                Err(err) => {
                    self.breaker.record_failure(&name).await;
                    warn!(provider = %name, kind = %err.kind(), error = %err, "provider call failed");
                    attempt_errors.push(ProviderAttempt::from_error(&err));

                    if !err.is_retriable() {
                        self.emit_failure(&request, attempts, started, Some(&name), Some(err.kind()))
                            .await;
                        return Err(RouterError::Provider(err));
                    }
                }
            }
        }

        let last = attempt_errors.last().map(|a| (a.provider.clone(), a.kind));
        self.emit_failure(
            &request,
            attempts,
            started,
            last.as_ref().map(|(p, _)| p.as_str()),
            last.as_ref().map(|&(_, k)| k),
        )
        .await;
        Err(RouterError::AllProvidersFailed {
            attempts: attempt_errors,
        })
    }

    /// Route a streaming chat completion.
    ///
    /// Fallback to the next candidate is possible only until the first
    /// fragment has been produced; once streaming has started, mid-stream
    /// errors surface to the caller as-is. Dropping the returned stream
    /// mid-flight records nothing.
    pub async fn stream(&self, request: RouterRequest) -> Result<RouterStream> {
        let estimated_tokens = estimate_tokens(&request.messages);
        let (candidates, bound) = self.resolve_candidates(&request, estimated_tokens).await?;

        let started = Instant::now();
        if candidates.is_empty() {
            self.emit_failure(&request, 0, started, None, None).await;
            return Err(RouterError::AllProvidersFailed { attempts: vec![] });
        }

        let deadline = self
            .config
            .fallback_budget_seconds
            .map(|secs| started + Duration::from_secs_f64(secs));

        let mut attempts = 0u32;
        let mut attempt_errors: Vec<ProviderAttempt> = Vec::new();

        for provider in candidates {
            let name = provider.name().to_string();
            if self.breaker.guard(&name).await.is_err() {
                debug!(provider = %name, "skipping provider with open circuit");
                continue;
            }
            if let Some(deadline) = deadline {
                if deadline.saturating_duration_since(Instant::now()).is_zero() {
                    debug!("fallback budget exhausted before next attempt");
                    break;
                }
            }

            attempts += 1;
            let call_started = Instant::now();
            let mut upstream = match provider
                .stream(
                    &request.messages,
                    request.max_tokens,
                    request.temperature,
                    &request.options,
                )
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    self.breaker.record_failure(&name).await;
                    warn!(provider = %name, error = %err, "provider stream failed to open");
                    attempt_errors.push(ProviderAttempt::from_error(&err));
                    if !err.is_retriable() {
                        self.emit_failure(&request, attempts, started, Some(&name), Some(err.kind()))
                            .await;
                        return Err(RouterError::Provider(err));
                    }
                    continue;
                }
            };

            // The fallback window stays open until the stream produces
            // its first item.
            match upstream.next().await {
                Some(Err(err)) => {
                    self.breaker.record_failure(&name).await;
                    warn!(provider = %name, error = %err, "provider stream failed before first fragment");
                    attempt_errors.push(ProviderAttempt::from_error(&err));
                    if !err.is_retriable() {
                        self.emit_failure(&request, attempts, started, Some(&name), Some(err.kind()))
                            .await;
                        return Err(RouterError::Provider(err));
                    }
                }
                first => {
                    return Ok(self.committed_stream(
                        &request,
                        provider,
                        upstream,
                        first,
                        call_started,
                        attempts,
                        estimated_tokens,
                        bound.clone(),
                    ));
                }
            }
        }

        let last = attempt_errors.last().map(|a| (a.provider.clone(), a.kind));
        self.emit_failure(
            &request,
            attempts,
            started,
            last.as_ref().map(|(p, _)| p.as_str()),
            last.as_ref().map(|&(_, k)| k),
        )
        .await;
        Err(RouterError::AllProvidersFailed {
            attempts: attempt_errors,
        })
    }

    /// Per-provider usage, headroom, circuit and latency snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        let mut snapshot = HashMap::new();
        for provider in self.registry.get_all_enabled().await {
            let name = provider.name().to_string();
            let (rpm_used, tpm_used) = match self
                .state
                .get_usage(&name, self.config.window_seconds)
                .await
            {
                Ok(usage) => usage,
                Err(err) => {
                    warn!(provider = %name, error = %err, "usage unavailable for status");
                    (0, 0)
                }
            };

            let rpm_headroom = 1.0 - rpm_used as f64 / provider.rpm_limit() as f64;
            let tpm_headroom = 1.0 - tpm_used as f64 / provider.tpm_limit() as f64;
            let headroom_pct = (rpm_headroom.min(tpm_headroom) * 100.0).max(0.0);

            snapshot.insert(
                name.clone(),
                ProviderStatus {
                    rpm_used,
                    rpm_limit: provider.rpm_limit(),
                    tpm_used,
                    tpm_limit: provider.tpm_limit(),
                    headroom_pct,
                    circuit_open: self.breaker.is_open(&name).await,
                    avg_latency_ms: self.latency.get(&name),
                },
            );
        }
        snapshot
    }

    /// Release adapters and the state backend.
    pub async fn close(&self) {
        self.registry.close_all().await;
        self.state.close().await;
    }

    // ========== Candidate resolution ==========

    /// Ranked candidate list plus the session binding in effect, if any.
    async fn resolve_candidates(
        &self,
        request: &RouterRequest,
        estimated_tokens: u64,
    ) -> Result<(Vec<Arc<dyn Provider>>, Option<String>)> {
        let all = self.registry.get_all_enabled().await;
        if all.is_empty() {
            return Err(RouterError::NoProvidersConfigured);
        }

        let bound = match &request.session_id {
            Some(session_id) => match self.state.get_session_provider(session_id).await {
                Ok(bound) => bound,
                Err(err) => {
                    warn!(error = %err, "session lookup failed; routing without affinity");
                    None
                }
            },
            None => None,
        };

        // Forced pinning wins over everything else.
        if let Some(forced) = &request.force_provider {
            if let Some(pinned) = self.registry.get(forced).await.filter(|p| p.enabled()) {
                let mut candidates: Vec<Arc<dyn Provider>> = vec![pinned];
                if self.config.forced_fallback {
                    let ranked = self.ranked_by_score(&all, estimated_tokens, request.priority).await;
                    candidates.extend(ranked.into_iter().filter(|p| p.name() != forced.as_str()));
                }
                return Ok((candidates, bound));
            }
        }

        let mut candidates = self.ranked_by_score(&all, estimated_tokens, request.priority).await;

        // Session affinity: an unexpired binding to an eligible provider
        // goes to the front of the list.
        if let Some(bound_name) = &bound {
            if let Some(pinned) = self.registry.get(bound_name).await.filter(|p| p.enabled()) {
                if !self.breaker.is_open(bound_name).await {
                    candidates.retain(|p| p.name() != bound_name.as_str());
                    candidates.insert(0, pinned);
                }
            }
        }

        Ok((candidates, bound))
    }

    /// Score and rank every provider that is eligible for this request.
    async fn ranked_by_score(
        &self,
        all: &[Arc<dyn Provider>],
        estimated_tokens: u64,
        priority: Priority,
    ) -> Vec<Arc<dyn Provider>> {
        let mut scores = Vec::with_capacity(all.len());
        for provider in all {
            let name = provider.name();
            let (rpm_used, tpm_used) = match self
                .state
                .get_usage(name, self.config.window_seconds)
                .await
            {
                Ok(usage) => usage,
                Err(err) => {
                    // Reduced visibility: high-priority traffic assumes a
                    // blind provider is idle, everything else avoids it.
                    warn!(provider = %name, error = %err, "usage unavailable");
                    if priority == Priority::High {
                        (0, 0)
                    } else {
                        continue;
                    }
                }
            };

            let at_risk = self.predictor.is_at_risk(
                name,
                rpm_used,
                provider.rpm_limit(),
                tpm_used,
                provider.tpm_limit(),
            );

            let input = ScoreInput {
                name,
                rpm_used,
                rpm_limit: provider.rpm_limit(),
                tpm_used,
                tpm_limit: provider.tpm_limit(),
                estimated_tokens,
                latency_ema_ms: self.latency.get(name),
                static_weight: provider.weight(),
                at_risk,
            };
            if let Some(score) = self.scorer.score_provider(&input, priority) {
                scores.push(score);
            }
        }

        let by_name: HashMap<&str, &Arc<dyn Provider>> =
            all.iter().map(|p| (p.name(), p)).collect();
        self.scorer
            .rank(scores)
            .into_iter()
            .filter_map(|score| by_name.get(score.name.as_str()).map(|p| Arc::clone(*p)))
            .collect()
    }

    // ========== Bookkeeping ==========

    async fn finish_chat(
        &self,
        request: &RouterRequest,
        provider: Arc<dyn Provider>,
        completion: ChatCompletion,
        latency_ms: f64,
        attempts: u32,
        bound: Option<String>,
    ) -> Result<RouterResponse> {
        let name = provider.name().to_string();
        let total_tokens = completion.input_tokens + completion.output_tokens;

        self.record_usage(&name, total_tokens).await;
        self.latency.update(&name, latency_ms);
        self.predictor.record(&name, total_tokens);
        self.breaker.record_success(&name);
        self.bind_session(request, &name, bound).await;

        self.emit(RouteEvent {
            provider: Some(name.clone()),
            model: Some(provider.model().to_string()),
            latency_ms,
            attempts,
            priority: request.priority,
            session_id: request.session_id.clone(),
            success: true,
            error_kind: None,
            input_tokens: Some(completion.input_tokens),
            output_tokens: Some(completion.output_tokens),
            timestamp: Utc::now(),
        })
        .await;

        Ok(RouterResponse {
            content: completion.content,
            provider: name,
            model: provider.model().to_string(),
            latency_ms,
            attempts,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
        })
    }

    /// Build the post-commit output stream: forward fragments, intercept
    /// the completion signal, then run the success bookkeeping.
    #[allow(clippy::too_many_arguments)]
    fn committed_stream(
        &self,
        request: &RouterRequest,
        provider: Arc<dyn Provider>,
        mut upstream: crate::providers::ChatStream,
        first: Option<std::result::Result<StreamChunk, crate::providers::ProviderError>>,
        call_started: Instant,
        attempts: u32,
        estimated_tokens: u64,
        bound: Option<String>,
    ) -> RouterStream {
        let state = Arc::clone(&self.state);
        let latency = Arc::clone(&self.latency);
        let predictor = Arc::clone(&self.predictor);
        let breaker = Arc::clone(&self.breaker);
        let observer = self.observer.clone();
        let config = Arc::clone(&self.config);
        let session_id = request.session_id.clone();
        let priority = request.priority;

        let out = async_stream::stream! {
            let name = provider.name().to_string();
            let mut pending = first;
            let mut usage: Option<(u64, u64)> = None;

            loop {
                let item = match pending.take() {
                    Some(item) => Some(item),
                    None => upstream.next().await,
                };
                match item {
                    None => break,
                    Some(Ok(StreamChunk::Delta(text))) => {
                        yield Ok(text);
                    }
                    Some(Ok(StreamChunk::Done { input_tokens, output_tokens })) => {
                        usage = Some((input_tokens, output_tokens));
                    }
                    Some(Err(err)) => {
                        // Streaming already started: no cross-provider
                        // resumption, the error surfaces as-is.
                        breaker.record_failure(&name).await;
                        Self::emit_to(&observer, RouteEvent {
                            provider: Some(name.clone()),
                            model: Some(provider.model().to_string()),
                            latency_ms: call_started.elapsed().as_secs_f64() * 1_000.0,
                            attempts,
                            priority,
                            session_id: session_id.clone(),
                            success: false,
                            error_kind: Some(err.kind()),
                            input_tokens: None,
                            output_tokens: None,
                            timestamp: Utc::now(),
                        }).await;
                        yield Err(RouterError::Provider(err));
                        return;
                    }
                }
            }

            let latency_ms = call_started.elapsed().as_secs_f64() * 1_000.0;
            // Without a completion signal, fall back to the pre-flight
            // estimate so the window still sees one sample per call.
            let (input_tokens, output_tokens) = usage.unwrap_or((estimated_tokens, 0));
            let total_tokens = input_tokens + output_tokens;

            Self::record_usage_with(&state, &name, total_tokens, config.window_seconds).await;
            latency.update(&name, latency_ms);
            predictor.record(&name, total_tokens);
            breaker.record_success(&name);

            if let Some(session_id) = &session_id {
                if bound.as_deref() != Some(name.as_str()) {
                    if let Err(err) = state
                        .set_session_provider(session_id, &name, config.session_ttl_seconds)
                        .await
                    {
                        warn!(error = %err, "failed to persist session binding");
                    }
                }
            }

            Self::emit_to(&observer, RouteEvent {
                provider: Some(name.clone()),
                model: Some(provider.model().to_string()),
                latency_ms,
                attempts,
                priority,
                session_id: session_id.clone(),
                success: true,
                error_kind: None,
                input_tokens: usage.map(|(i, _)| i),
                output_tokens: usage.map(|(_, o)| o),
                timestamp: Utc::now(),
            }).await;
        };

        Box::pin(out)
    }

    /// Record a usage sample, retrying a failed shared-store write once
    /// before dropping it. A dropped sample never fails the request.
    async fn record_usage(&self, provider: &str, tokens: u64) {
        Self::record_usage_with(&self.state, provider, tokens, self.config.window_seconds).await;
    }

    async fn record_usage_with(
        state: &Arc<dyn StateBackend>,
        provider: &str,
        tokens: u64,
        window_seconds: u64,
    ) {
        if let Err(err) = state.record_request(provider, tokens, window_seconds).await {
            warn!(provider = %provider, error = %err, "usage write failed; retrying once");
            if let Err(err) = state.record_request(provider, tokens, window_seconds).await {
                warn!(provider = %provider, error = %err, "usage write dropped");
            }
        }
    }

    /// Write the session binding lazily: only when no binding existed or
    /// a different provider served the request.
    async fn bind_session(&self, request: &RouterRequest, provider: &str, bound: Option<String>) {
        let Some(session_id) = &request.session_id else {
            return;
        };
        if bound.as_deref() == Some(provider) {
            return;
        }
        if let Err(err) = self
            .state
            .set_session_provider(session_id, provider, self.config.session_ttl_seconds)
            .await
        {
            warn!(error = %err, "failed to persist session binding");
        }
    }

    async fn emit(&self, event: RouteEvent) {
        Self::emit_to(&self.observer, event).await;
    }

    async fn emit_to(observer: &Option<Arc<dyn RouteObserver>>, event: RouteEvent) {
        if let Some(observer) = observer {
            if let Err(err) = observer.on_route(event).await {
                debug!(error = %err, "route observer failed; ignoring");
            }
        }
    }

    async fn emit_failure(
        &self,
        request: &RouterRequest,
        attempts: u32,
        started: Instant,
        provider: Option<&str>,
        error_kind: Option<ErrorKind>,
    ) {
        self.emit(RouteEvent {
            provider: provider.map(str::to_string),
            model: None,
            latency_ms: started.elapsed().as_secs_f64() * 1_000.0,
            attempts,
            priority: request.priority,
            session_id: request.session_id.clone(),
            success: false,
            error_kind,
            input_tokens: None,
            output_tokens: None,
            timestamp: Utc::now(),
        })
        .await;
    }
}
