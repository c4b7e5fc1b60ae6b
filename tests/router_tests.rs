//! End-to-end routing behavior against scripted mock providers.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use llm_router::{
    ErrorKind, InMemoryStateBackend, Message, Priority, ProviderError, Router, RouterConfig,
    RouterError, RouterRequest, StateBackend, StreamChunk,
};

use common::{CollectingObserver, FailingStateBackend, MockOutcome, MockProvider};

fn request() -> RouterRequest {
    RouterRequest::new(vec![Message::user("hello")])
}

fn config_with_breaker(failure_threshold: u32) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.circuit_breaker.failure_threshold = failure_threshold;
    config
}

async fn build_router(config: RouterConfig, providers: &[&Arc<MockProvider>]) -> Router {
    let router = Router::new(config).await.unwrap();
    for provider in providers {
        router
            .register_adapter(Arc::clone(*provider) as Arc<dyn llm_router::Provider>)
            .await;
    }
    router
}

/// Route `calls` forced requests at `provider` to fill its usage window.
async fn seed_usage(router: &Router, provider: &str, calls: usize) {
    for _ in 0..calls {
        router
            .chat(request().with_force_provider(provider))
            .await
            .unwrap();
    }
}

// ==================== Scoring-driven selection ====================

#[tokio::test]
async fn lightly_used_provider_is_selected() {
    // a: 90 requests / 9000 tokens used, b: 10 / 1000, equal weights and
    // latency, so b has all the headroom and must win.
    let a = Arc::new(MockProvider::new("a").with_default_tokens(50, 50));
    let b = Arc::new(MockProvider::new("b").with_default_tokens(50, 50));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    seed_usage(&router, "a", 90).await;
    seed_usage(&router, "b", 10).await;

    let response = router.chat(request()).await.unwrap();
    assert_eq!(response.provider, "b");
    assert_eq!(response.attempts, 1);
}

#[tokio::test]
async fn open_circuit_is_skipped_without_counting_an_attempt() {
    // a outranks b, but a's circuit is open: the request lands on b in a
    // single attempt.
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(config_with_breaker(1), &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::rate_limited("a", "429", None)));
    let tripping = router.chat(request().with_force_provider("a")).await.unwrap();
    assert_eq!(tripping.provider, "b");
    assert_eq!(tripping.attempts, 2);

    let response = router.chat(request()).await.unwrap();
    assert_eq!(response.provider, "b");
    assert_eq!(response.attempts, 1);

    let status = router.status().await;
    assert!(status["a"].circuit_open);
    assert!(!status["b"].circuit_open);
}

#[tokio::test]
async fn consecutive_failures_trip_the_breaker_and_exhaust_the_pool() {
    let a = Arc::new(MockProvider::new("a"));
    let router = build_router(config_with_breaker(3), &[&a]).await;

    a.push_failures(3, || ProviderError::server("a", 503, "overloaded"));

    for _ in 0..3 {
        let err = router.chat(request()).await.unwrap_err();
        match err {
            RouterError::AllProvidersFailed { attempts } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].kind, ErrorKind::ServerError);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    // The circuit is now open: the fourth call finds no one to try.
    let err = router.chat(request()).await.unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => assert!(attempts.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    assert!(router.status().await["a"].circuit_open);
}

// ==================== Session affinity ====================

#[tokio::test]
async fn session_sticks_then_rebinds_when_the_circuit_trips() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let state = Arc::new(InMemoryStateBackend::new());
    let router = Router::with_backend(config_with_breaker(1), state.clone())
        .await
        .unwrap();
    router.register_adapter(a.clone()).await;
    router.register_adapter(b.clone()).await;

    // First call pinned to b creates the binding.
    let first = router
        .chat(request().with_session("s1").with_force_provider("b"))
        .await
        .unwrap();
    assert_eq!(first.provider, "b");
    assert_eq!(
        state.get_session_provider("s1").await.unwrap().as_deref(),
        Some("b")
    );

    // Affinity beats a's better score.
    let second = router.chat(request().with_session("s1")).await.unwrap();
    assert_eq!(second.provider, "b");
    assert_eq!(second.attempts, 1);

    // Trip b's circuit, then the session must move to a and rebind.
    b.push(MockOutcome::Fail(ProviderError::server("b", 500, "boom")));
    router.chat(request().with_force_provider("b")).await.unwrap();

    let third = router.chat(request().with_session("s1")).await.unwrap();
    assert_eq!(third.provider, "a");
    assert_eq!(
        state.get_session_provider("s1").await.unwrap().as_deref(),
        Some("a")
    );
}

// ==================== Priority lanes ====================

#[tokio::test]
async fn reserve_keeps_a_hot_provider_for_high_priority_only() {
    // 17/20 requests used with a 20% reserve: the floor sits at 16, so
    // low-priority traffic is locked out while high still routes.
    let a = Arc::new(
        MockProvider::new("a")
            .with_limits(20, 100_000)
            .with_default_tokens(50, 50),
    );
    let router = build_router(RouterConfig::default(), &[&a]).await;
    seed_usage(&router, "a", 17).await;

    let err = router
        .chat(request().with_priority(Priority::Low))
        .await
        .unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => assert!(attempts.is_empty()),
        other => panic!("unexpected error: {other}"),
    }

    let response = router
        .chat(request().with_priority(Priority::High))
        .await
        .unwrap();
    assert_eq!(response.provider, "a");
}

#[tokio::test]
async fn zero_headroom_everywhere_fails_without_attempts() {
    let a = Arc::new(MockProvider::new("a").with_limits(2, 100_000));
    let router = build_router(RouterConfig::default(), &[&a]).await;
    seed_usage(&router, "a", 2).await;

    let err = router.chat(request()).await.unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => assert!(attempts.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
}

// ==================== Forced pinning ====================

#[tokio::test]
async fn forced_provider_is_used_when_healthy() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    let response = router
        .chat(request().with_force_provider("b"))
        .await
        .unwrap();
    assert_eq!(response.provider, "b");
    assert_eq!(response.attempts, 1);
    assert_eq!(a.calls(), 0);
}

#[tokio::test]
async fn forced_provider_falls_back_on_rate_limit() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::rate_limited("a", "429", Some(30))));
    let response = router
        .chat(request().with_force_provider("a"))
        .await
        .unwrap();
    assert_eq!(response.provider, "b");
    assert_eq!(response.attempts, 2);
}

#[tokio::test]
async fn forced_fallback_can_be_disabled() {
    let a = Arc::new(MockProvider::new("a"));
    let b = Arc::new(MockProvider::new("b"));
    let mut config = RouterConfig::default();
    config.forced_fallback = false;
    let router = build_router(config, &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::rate_limited("a", "429", None)));
    let err = router
        .chat(request().with_force_provider("a"))
        .await
        .unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].provider, "a");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.calls(), 0);
}

// ==================== Error propagation ====================

#[tokio::test]
async fn empty_registry_is_reported_immediately() {
    let router = Router::new(RouterConfig::default()).await.unwrap();
    let err = router.chat(request()).await.unwrap_err();
    assert!(matches!(err, RouterError::NoProvidersConfigured));
}

#[tokio::test]
async fn non_retriable_errors_stop_the_fallback_loop() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::auth("a", "invalid api key")));
    let err = router.chat(request()).await.unwrap_err();
    match err {
        RouterError::Provider(provider_err) => {
            assert_eq!(provider_err.kind(), ErrorKind::AuthError);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn attempt_list_preserves_failure_order() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::rate_limited("a", "429", None)));
    b.push(MockOutcome::Fail(ProviderError::timeout("b", "deadline")));

    let err = router.chat(request()).await.unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].provider, "a");
            assert_eq!(attempts[0].kind, ErrorKind::RateLimited);
            assert_eq!(attempts[1].provider, "b");
            assert_eq!(attempts[1].kind, ErrorKind::Timeout);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ==================== Observability ====================

#[tokio::test]
async fn observer_failures_never_affect_routing() {
    let a = Arc::new(MockProvider::new("a"));
    let observer = CollectingObserver::failing();
    let router = build_router(RouterConfig::default(), &[&a])
        .await
        .with_observer(observer.clone());

    let response = router.chat(request()).await.unwrap();
    assert_eq!(response.provider, "a");

    let events = observer.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].provider.as_deref(), Some("a"));
    assert_eq!(events[0].attempts, 1);
}

#[tokio::test]
async fn terminal_failures_emit_an_event() {
    let a = Arc::new(MockProvider::new("a").with_limits(1, 100_000));
    let observer = CollectingObserver::new();
    let router = build_router(RouterConfig::default(), &[&a])
        .await
        .with_observer(observer.clone());

    seed_usage(&router, "a", 1).await;
    let _ = router.chat(request()).await.unwrap_err();

    let events = observer.events();
    let last = events.last().unwrap();
    assert!(!last.success);
    assert_eq!(last.attempts, 0);
}

#[tokio::test]
async fn status_reports_usage_and_latency() {
    let a = Arc::new(MockProvider::new("a").with_default_tokens(60, 40));
    let router = build_router(RouterConfig::default(), &[&a]).await;

    for _ in 0..3 {
        router.chat(request()).await.unwrap();
    }

    let status = router.status().await;
    let a_status = &status["a"];
    assert_eq!(a_status.rpm_used, 3);
    assert_eq!(a_status.tpm_used, 300);
    assert_eq!(a_status.rpm_limit, 100);
    assert!(!a_status.circuit_open);
    assert!(a_status.headroom_pct > 90.0);
    assert!(a_status.avg_latency_ms >= 0.0);
}

// ==================== Registration ====================

#[tokio::test]
async fn reregistering_a_name_keeps_the_latest_adapter() {
    let v1 = Arc::new(MockProvider::new("a").with_model("v1"));
    let v2 = Arc::new(MockProvider::new("a").with_model("v2"));
    let router = build_router(RouterConfig::default(), &[&v1, &v2]).await;

    let response = router.chat(request()).await.unwrap();
    assert_eq!(response.model, "v2");
    assert_eq!(v1.calls(), 0);
}

// ==================== Reduced visibility ====================

#[tokio::test]
async fn blind_usage_drops_providers_except_for_high_priority() {
    let a = Arc::new(MockProvider::new("a"));
    let router = Router::with_backend(RouterConfig::default(), Arc::new(FailingStateBackend))
        .await
        .unwrap();
    router.register_adapter(a.clone()).await;

    let err = router.chat(request()).await.unwrap_err();
    match err {
        RouterError::AllProvidersFailed { attempts } => assert!(attempts.is_empty()),
        other => panic!("unexpected error: {other}"),
    }

    // High priority scores the blind provider as idle and proceeds; the
    // dropped usage write must not fail the request either.
    let response = router
        .chat(request().with_priority(Priority::High))
        .await
        .unwrap();
    assert_eq!(response.provider, "a");
}

// ==================== Streaming ====================

#[tokio::test]
async fn stream_collects_fragments_and_records_usage() {
    let a = Arc::new(MockProvider::new("a"));
    let router = build_router(RouterConfig::default(), &[&a]).await;

    let mut stream = router.stream(request()).await.unwrap();
    let mut collected = String::new();
    while let Some(item) = stream.next().await {
        collected.push_str(&item.unwrap());
    }
    assert_eq!(collected, "ok from a");

    let status = router.status().await;
    assert_eq!(status["a"].rpm_used, 1);
    assert_eq!(status["a"].tpm_used, 100);
}

#[tokio::test]
async fn stream_falls_back_when_the_first_provider_refuses() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    a.push(MockOutcome::Fail(ProviderError::rate_limited("a", "429", None)));
    let mut stream = router.stream(request()).await.unwrap();
    let mut collected = String::new();
    while let Some(item) = stream.next().await {
        collected.push_str(&item.unwrap());
    }
    assert_eq!(collected, "ok from b");
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
}

#[tokio::test]
async fn stream_falls_back_on_an_error_before_the_first_fragment() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    // The stream opens but dies before producing anything.
    a.push(MockOutcome::StreamItems(vec![Err(ProviderError::server(
        "a", 502, "bad gateway",
    ))]));
    let mut stream = router.stream(request()).await.unwrap();
    let mut collected = String::new();
    while let Some(item) = stream.next().await {
        collected.push_str(&item.unwrap());
    }
    assert_eq!(collected, "ok from b");
}

#[tokio::test]
async fn mid_stream_errors_surface_without_cross_provider_resumption() {
    let a = Arc::new(MockProvider::new("a").with_weight(1.0));
    let b = Arc::new(MockProvider::new("b").with_weight(0.5));
    let router = build_router(RouterConfig::default(), &[&a, &b]).await;

    a.push(MockOutcome::StreamItems(vec![
        Ok(StreamChunk::Delta("Hel".to_string())),
        Err(ProviderError::server("a", 500, "connection reset")),
    ]));

    let mut stream = router.stream(request()).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");

    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, RouterError::Provider(_)));
    assert!(stream.next().await.is_none());
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn stream_binds_the_session_on_completion() {
    let a = Arc::new(MockProvider::new("a"));
    let state = Arc::new(InMemoryStateBackend::new());
    let router = Router::with_backend(RouterConfig::default(), state.clone())
        .await
        .unwrap();
    router.register_adapter(a.clone()).await;

    let mut stream = router.stream(request().with_session("s9")).await.unwrap();
    while let Some(item) = stream.next().await {
        item.unwrap();
    }
    assert_eq!(
        state.get_session_provider("s9").await.unwrap().as_deref(),
        Some("a")
    );
}
