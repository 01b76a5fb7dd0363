//! 路由 / 隔离 / 自愈 / 工具门面 集成测试

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use openllm::config::{AppConfig, MemoryBackend};
use openllm::core::{ProviderErrorKind, RouterError, ToolError};
use openllm::healing::{HealingEvent, MonitorPolicy, SelfHealingMonitor};
use openllm::llm::{
    CostClass, HealthPolicy, HealthTracker, MockAdapter, MockBehavior, Provider, ProviderKind,
    ProviderRegistry, ProviderState, Request, Router, RouterPolicy,
};
use openllm::memory::{InMemoryInteractionStore, InteractionStore, Message, Outcome};
use openllm::EngineBuilder;

fn provider(id: &str, priority: u32) -> Provider {
    Provider {
        id: id.into(),
        kind: ProviderKind::Mock,
        endpoint: None,
        model: None,
        priority,
        cost_class: CostClass::FreeRemote,
    }
}

fn registry_of(providers: Vec<(&str, u32, Arc<MockAdapter>)>) -> Arc<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (id, priority, adapter) in providers {
        registry.register(provider(id, priority), true, adapter).unwrap();
    }
    Arc::new(registry)
}

fn health(threshold: u32) -> Arc<HealthTracker> {
    Arc::new(HealthTracker::new(HealthPolicy {
        failure_threshold: threshold,
        base_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(600),
    }))
}

fn chat(session: &str) -> Request {
    Request::chat(session, vec![Message::user("hello")])
}

#[tokio::test]
async fn test_hanging_primary_times_out_and_secondary_answers() {
    let p1 = Arc::new(MockAdapter::hanging());
    let p2 = Arc::new(MockAdapter::new(MockBehavior::Delayed(
        Duration::from_millis(50),
        Box::new(MockBehavior::Reply("from p2".into())),
    )));
    let p3 = Arc::new(MockAdapter::replying("from p3"));
    let registry = registry_of(vec![("p1", 1, p1.clone()), ("p2", 2, p2.clone()), ("p3", 3, p3.clone())]);
    let memory = Arc::new(InMemoryInteractionStore::new());
    let router = Router::new(
        registry,
        health(3),
        memory.clone(),
        RouterPolicy {
            per_provider_timeout: Duration::from_millis(200),
        },
    )
    .unwrap();

    let response = router.dispatch(chat("s-timeout")).await.unwrap();
    assert_eq!(response.provider_id, "p2");
    assert_eq!(response.content, "from p2");
    assert_eq!(p3.calls(), 0);

    let records = memory.context_for("s-timeout", 10).await.unwrap();
    let trail: Vec<_> = records
        .iter()
        .map(|r| (r.provider_id.clone().unwrap_or_default(), r.outcome))
        .collect();
    assert_eq!(
        trail,
        vec![("p1".to_string(), Outcome::Timeout), ("p2".to_string(), Outcome::Success)]
    );
    assert!(records[0].error_signature.as_deref().unwrap_or("").starts_with("timeout:"));

    let p1_health = router.health().snapshot("p1").unwrap();
    assert_eq!(p1_health.consecutive_failures, 1);
}

#[tokio::test]
async fn test_quarantined_provider_is_not_called_again() {
    let adapter = Arc::new(MockAdapter::failing(ProviderErrorKind::Transport));
    let registry = registry_of(vec![("only", 1, adapter.clone())]);
    let memory = Arc::new(InMemoryInteractionStore::new());
    let router = Router::new(registry, health(3), memory.clone(), RouterPolicy::default()).unwrap();

    for _ in 0..3 {
        let err = router.dispatch(chat("s-q")).await.unwrap_err();
        assert!(matches!(err, RouterError::AllProvidersExhausted { last_error: Some(ref sig) } if sig.starts_with("transport:")));
    }
    assert_eq!(adapter.calls(), 3);
    assert!(router.health().is_quarantined("only", Utc::now()));

    // 隔离期内：无候选，直接耗尽，不再调用 Adapter
    for _ in 0..2 {
        let err = router.dispatch(chat("s-q")).await.unwrap_err();
        assert!(matches!(err, RouterError::AllProvidersExhausted { .. }));
    }
    assert_eq!(adapter.calls(), 3);

    let status = router.stats();
    assert_eq!(status.len(), 1);
    assert!(!status[0].available);
}

#[tokio::test]
async fn test_monitor_disables_systemic_failure_then_probe_restores() {
    let flaky = Arc::new(MockAdapter::failing(ProviderErrorKind::Auth));
    let backup = Arc::new(MockAdapter::replying("backup"));
    let registry = registry_of(vec![("flaky", 1, flaky.clone()), ("backup", 2, backup.clone())]);
    let memory: Arc<InMemoryInteractionStore> = Arc::new(InMemoryInteractionStore::new());
    // 阈值调高，使 flaky 在窗口内攒够样本
    let tracker = health(100);
    let router = Router::new(
        Arc::clone(&registry),
        Arc::clone(&tracker),
        memory.clone(),
        RouterPolicy::default(),
    )
    .unwrap();
    let monitor = SelfHealingMonitor::new(
        Arc::clone(&registry),
        tracker,
        memory.clone(),
        MonitorPolicy::default(),
    );

    for _ in 0..5 {
        let response = router.dispatch(chat("s-heal")).await.unwrap();
        assert_eq!(response.provider_id, "backup");
    }
    assert_eq!(flaky.calls(), 5);

    let events = monitor.reconcile_at(Utc::now()).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], HealingEvent::Disabled { provider_id, error_class, samples, .. }
        if provider_id == "flaky" && error_class == "auth" && *samples == 5));
    assert_eq!(registry.get("flaky").unwrap().state(), ProviderState::DisabledByMonitor);

    // 已禁用：路由直接跳过
    router.dispatch(chat("s-heal")).await.unwrap();
    assert_eq!(flaky.calls(), 5);

    // 窗口过去后探测成功，重新启用并恢复优先
    flaky.set_fallback(MockBehavior::Reply("flaky is back".into()));
    let later = Utc::now() + chrono::Duration::minutes(11);
    let events = monitor.reconcile_at(later).await;
    assert_eq!(events, vec![HealingEvent::Reenabled { provider_id: "flaky".into() }]);

    let response = router.dispatch(chat("s-heal")).await.unwrap();
    assert_eq!(response.provider_id, "flaky");
    assert_eq!(response.content, "flaky is back");
}

#[tokio::test]
async fn test_operator_disable_and_reenable_through_router() {
    let a = Arc::new(MockAdapter::replying("a"));
    let b = Arc::new(MockAdapter::replying("b"));
    let registry = registry_of(vec![("a", 1, a.clone()), ("b", 2, b.clone())]);
    let router = Router::new(
        registry,
        health(3),
        Arc::new(InMemoryInteractionStore::new()),
        RouterPolicy::default(),
    )
    .unwrap();

    assert!(router.set_enabled("a", false));
    assert_eq!(router.dispatch(chat("s-op")).await.unwrap().provider_id, "b");
    assert!(router.set_enabled("a", true));
    assert_eq!(router.dispatch(chat("s-op")).await.unwrap().provider_id, "a");
    assert!(!router.set_enabled("missing", true));
}

fn engine_config(dir: &std::path::Path, backend: MemoryBackend) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.data_dir = dir.join("data");
    config.app.workspace_root = dir.join("workspace");
    config.memory.backend = backend;
    config
}

#[tokio::test]
async fn test_facade_end_to_end_with_sqlite_memory() {
    let dir = tempfile::tempdir().unwrap();
    let registry = {
        let mut registry = ProviderRegistry::new();
        registry
            .register(provider("text", 1), true, Arc::new(MockAdapter::echo()))
            .unwrap();
        registry
            .register(provider("vision", 2), true, Arc::new(MockAdapter::replying("a red square").with_vision(true)))
            .unwrap();
        registry
    };
    let engine = EngineBuilder::new(engine_config(dir.path(), MemoryBackend::Sqlite))
        .with_registry(registry)
        .build()
        .unwrap();
    let facade = &engine.facade;

    let out = facade
        .invoke("chat", serde_json::json!({ "message": "first", "session_id": "e2e" }))
        .await
        .unwrap();
    assert_eq!(out["provider_id"], "text");
    assert_eq!(out["content"], "Echo from Mock: first");
    facade
        .invoke("chat", serde_json::json!({ "message": "second", "session_id": "e2e" }))
        .await
        .unwrap();
    let history = engine.facade.memory().context_for("e2e", 20).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.outcome == Outcome::Success));

    let written = facade
        .invoke("writeFile", serde_json::json!({ "path": "notes/a.txt", "content": "hello world" }))
        .await
        .unwrap();
    assert_eq!(written["bytes_written"], 11);
    let read = facade
        .invoke("readFile", serde_json::json!({ "path": "notes/a.txt" }))
        .await
        .unwrap();
    assert_eq!(read["content"], "hello world");

    let found = facade
        .invoke("searchFiles", serde_json::json!({ "pattern": "world", "content_search": true }))
        .await
        .unwrap();
    assert_eq!(found.as_array().map(|a| a.len()), Some(1));

    let escape = facade
        .invoke("readFile", serde_json::json!({ "path": "../outside.txt" }))
        .await
        .unwrap_err();
    assert!(matches!(escape, ToolError::AccessDenied(_)));

    let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    std::fs::write(dir.path().join("workspace").join("pic.png"), png).unwrap();
    let described = facade
        .invoke("describeImage", serde_json::json!({ "path": "pic.png" }))
        .await
        .unwrap();
    assert_eq!(described["provider_id"], "vision");
    assert_eq!(described["content"], "a red square");

    let status = facade.invoke("providerStatus", serde_json::json!({})).await.unwrap();
    assert_eq!(status.as_array().map(|a| a.len()), Some(2));

    let summary = facade.invoke("errorSummary", serde_json::json!({})).await.unwrap();
    assert_eq!(summary["total_attempts"], 3);
    assert_eq!(summary["total_failures"], 0);
    assert_eq!(summary["providers"][0]["provider_id"], "text");
    assert_eq!(summary["providers"][0]["attempts"], 2);
    assert_eq!(summary["providers"][1]["attempts"], 1);

    let unknown = facade.invoke("shell", serde_json::json!({})).await.unwrap_err();
    assert!(matches!(unknown, ToolError::UnknownTool(_)));

    // 记录在重新打开后仍在
    drop(engine);
    let reopened = openllm::memory::SqliteInteractionStore::open(dir.path().join("data").join("interactions.db")).unwrap();
    assert!(reopened.len().await.unwrap() >= 3);
}

#[tokio::test]
async fn test_facade_reports_exhaustion_when_every_provider_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ProviderRegistry::new();
    registry
        .register(provider("down", 1), true, Arc::new(MockAdapter::failing(ProviderErrorKind::RateLimit)))
        .unwrap();
    let memory: Arc<dyn InteractionStore> = Arc::new(InMemoryInteractionStore::new());
    let engine = EngineBuilder::new(engine_config(dir.path(), MemoryBackend::Memory))
        .with_registry(registry)
        .with_memory(Arc::clone(&memory))
        .build()
        .unwrap();

    let err = engine
        .facade
        .invoke("chat", serde_json::json!({ "message": "anyone?", "session_id": "dead" }))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::AllProvidersExhausted(Some(ref sig)) if sig.starts_with("rate_limit:")));

    let records = memory.context_for("dead", 10).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, Outcome::ProviderError);
    assert_eq!(records[1].outcome, Outcome::AllProvidersExhausted);
    assert!(records[1].provider_id.is_none());
}
