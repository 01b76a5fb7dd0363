//! Provider 路由器：按优先级与健康度排序，逐个尝试直到首个成功
//!
//! 候选列表 = 已启用、未隔离、支持该操作的 Provider，
//! 按 (priority 升序, cost_class 升序, health_score 降序) 稳定排序。
//! 失败立即尝试下一个（不做尝试间等待，退避体现在隔离期上）；全部失败返回 AllProvidersExhausted。
//!
//! 每次尝试在独立 task 中执行：调用方取消 dispatch 后，正在进行的调用仍会完成并记入健康状态与记忆。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::{ProviderError, ProviderErrorKind, RouterError};
use crate::healing::error_signature;
use crate::llm::{
    CostClass, HealthRecord, HealthTracker, Operation, ProviderEntry, ProviderRegistry,
    ProviderState, Request, Response,
};
use crate::memory::{InteractionRecord, InteractionStore, Outcome};

/// 路由策略
#[derive(Debug, Clone)]
pub struct RouterPolicy {
    /// 单个 Provider 调用上限；超时按 TIMEOUT 处理
    pub per_provider_timeout: Duration,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            per_provider_timeout: Duration::from_secs(30),
        }
    }
}

/// Provider 运行状态（providerStatus 工具与日志使用）
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub backend: &'static str,
    pub priority: u32,
    pub cost_class: CostClass,
    pub state: ProviderState,
    /// 已启用且未隔离
    pub available: bool,
    pub health_score: f64,
    pub health: HealthRecord,
}

/// 单次尝试的结果
enum Attempt {
    Success(Response),
    Failed(String),
    /// Adapter 不支持该操作：跳过，不计健康失败
    Unsupported(String),
}

/// 路由器：持有注册表、健康追踪与交互记忆的共享句柄
pub struct Router {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    memory: Arc<dyn InteractionStore>,
    policy: RouterPolicy,
}

impl Router {
    /// 注册表为空或全部禁用时返回 NoProviderConfigured
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        memory: Arc<dyn InteractionStore>,
        policy: RouterPolicy,
    ) -> Result<Self, RouterError> {
        if registry.enabled_count() == 0 {
            return Err(RouterError::NoProviderConfigured);
        }
        for entry in registry.iter() {
            health.register(entry.id());
        }
        Ok(Self {
            registry,
            health,
            memory,
            policy,
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn memory(&self) -> &Arc<dyn InteractionStore> {
        &self.memory
    }

    pub fn policy(&self) -> &RouterPolicy {
        &self.policy
    }

    /// 当前时刻可用于该操作的候选（已排序）
    pub fn candidates(&self, operation: Operation, now: DateTime<Utc>) -> Vec<Arc<ProviderEntry>> {
        let mut candidates: Vec<(Arc<ProviderEntry>, f64)> = self
            .registry
            .iter()
            .filter(|e| self.health.is_available(e.id(), e.is_enabled(), now))
            .filter(|e| e.adapter().supports(operation))
            .map(|e| (Arc::clone(e), self.health.health_score(e.id())))
            .collect();
        candidates.sort_by(|(a, sa), (b, sb)| {
            a.provider
                .priority
                .cmp(&b.provider.priority)
                .then(a.provider.cost_class.cmp(&b.provider.cost_class))
                .then(sb.total_cmp(sa))
        });
        candidates.into_iter().map(|(e, _)| e).collect()
    }

    /// 分发请求：首个成功即返回
    pub async fn dispatch(&self, request: Request) -> Result<Response, RouterError> {
        self.dispatch_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// 可取消的分发：取消后不再推进到下一个候选，返回 Cancelled
    pub async fn dispatch_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, RouterError> {
        let request = Arc::new(request);
        let candidates = self.candidates(request.operation, Utc::now());

        if candidates.is_empty() {
            tracing::warn!(
                request_id = %request.id,
                operation = %request.operation,
                "No eligible provider for request"
            );
            self.append_exhausted(&request, None).await;
            return Err(RouterError::AllProvidersExhausted { last_error: None });
        }

        let mut last_error: Option<String> = None;
        for entry in candidates {
            if cancel.is_cancelled() {
                return Err(RouterError::Cancelled);
            }
            let provider_id = entry.id().to_string();
            let started = Instant::now();
            let attempt = tokio::spawn(run_attempt(
                entry,
                Arc::clone(&self.health),
                Arc::clone(&self.memory),
                Arc::clone(&request),
                self.policy.per_provider_timeout,
            ));
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(request_id = %request.id, "Dispatch cancelled, in-flight attempt left to finish");
                    return Err(RouterError::Cancelled);
                }
                joined = attempt => joined,
            };
            match joined {
                Ok(Attempt::Success(response)) => return Ok(response),
                Ok(Attempt::Failed(signature)) => last_error = Some(signature),
                Ok(Attempt::Unsupported(signature)) => {
                    if last_error.is_none() {
                        last_error = Some(signature);
                    }
                }
                Err(e) => {
                    tracing::error!(request_id = %request.id, provider = %provider_id, error = %e, "Attempt task failed");
                    // Adapter panic 与普通传输错误同样计入健康与记忆，保证反复 panic 的 Provider 会被隔离
                    let error = ProviderError::new(
                        ProviderErrorKind::Transport,
                        format!("adapter task failed: {}", e),
                    );
                    let signature = record_failure(
                        &self.health,
                        self.memory.as_ref(),
                        &request,
                        provider_id,
                        &error,
                        started.elapsed().as_millis() as u64,
                    )
                    .await;
                    last_error = Some(signature);
                }
            }
        }

        tracing::warn!(
            request_id = %request.id,
            operation = %request.operation,
            last_error = last_error.as_deref().unwrap_or("none"),
            "All providers exhausted"
        );
        self.append_exhausted(&request, last_error.clone()).await;
        Err(RouterError::AllProvidersExhausted { last_error })
    }

    /// 运维启用 / 禁用；返回 Provider 是否存在
    pub fn set_enabled(&self, provider_id: &str, enabled: bool) -> bool {
        match self.registry.get(provider_id) {
            Some(entry) => {
                entry.set_operator_enabled(enabled);
                tracing::info!(provider = %provider_id, enabled, "Provider state changed by operator");
                true
            }
            None => false,
        }
    }

    /// 各 Provider 状态快照（按注册顺序）
    pub fn stats(&self) -> Vec<ProviderStatus> {
        let now = Utc::now();
        self.registry
            .iter()
            .map(|e| {
                let health = self.health.snapshot(e.id()).unwrap_or_default();
                ProviderStatus {
                    id: e.provider.id.clone(),
                    backend: e.adapter().backend(),
                    priority: e.provider.priority,
                    cost_class: e.provider.cost_class,
                    state: e.state(),
                    available: e.is_enabled() && !health.is_quarantined(now),
                    health_score: health.health_score(),
                    health,
                }
            })
            .collect()
    }

    async fn append_exhausted(&self, request: &Request, last_error: Option<String>) {
        let mut record = InteractionRecord::new(
            request.id,
            request.session_id.clone(),
            None,
            request.operation,
            Outcome::AllProvidersExhausted,
        )
        .with_prompt(request.payload.last_prompt());
        if let Some(sig) = last_error {
            record = record.with_signature(sig);
        }
        append_best_effort(self.memory.as_ref(), record).await;
    }
}

/// 记忆写入失败只记日志，不影响响应
async fn append_best_effort(memory: &dyn InteractionStore, record: InteractionRecord) {
    let request_id = record.request_id;
    if let Err(e) = memory.append(record).await {
        tracing::warn!(request_id = %request_id, error = %e, "Interaction record lost");
    }
}

async fn run_attempt(
    entry: Arc<ProviderEntry>,
    health: Arc<HealthTracker>,
    memory: Arc<dyn InteractionStore>,
    request: Arc<Request>,
    timeout: Duration,
) -> Attempt {
    let provider_id = entry.id().to_string();
    let adapter = entry.adapter();
    let started = Instant::now();
    let result = tokio::time::timeout(
        timeout,
        adapter.invoke(request.operation, &request.payload, timeout),
    )
    .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let error = match result {
        Ok(Ok(mut response)) => {
            response.provider_id = provider_id.clone();
            response.latency_ms = latency_ms;
            health.record_outcome(&provider_id, Outcome::Success, latency_ms);
            tracing::info!(
                request_id = %request.id,
                provider = %provider_id,
                latency_ms,
                "Provider succeeded"
            );
            let record = InteractionRecord::new(
                request.id,
                request.session_id.clone(),
                Some(provider_id),
                request.operation,
                Outcome::Success,
            )
            .with_latency(latency_ms)
            .with_tokens(response.tokens_used)
            .with_prompt(request.payload.last_prompt())
            .with_response(response.content.clone());
            append_best_effort(memory.as_ref(), record).await;
            return Attempt::Success(response);
        }
        Ok(Err(e)) if e.kind == ProviderErrorKind::UnsupportedOperation => {
            tracing::debug!(provider = %provider_id, error = %e, "Provider skipped");
            return Attempt::Unsupported(error_signature(&e));
        }
        Ok(Err(e)) => e,
        Err(_) => ProviderError::timeout(format!(
            "no response within {}ms",
            timeout.as_millis()
        )),
    };

    Attempt::Failed(record_failure(&health, memory.as_ref(), &request, provider_id, &error, latency_ms).await)
}

/// 失败尝试：更新健康计数、写入记忆，返回错误签名
async fn record_failure(
    health: &HealthTracker,
    memory: &dyn InteractionStore,
    request: &Request,
    provider_id: String,
    error: &ProviderError,
    latency_ms: u64,
) -> String {
    let outcome = if error.kind == ProviderErrorKind::Timeout {
        Outcome::Timeout
    } else {
        Outcome::ProviderError
    };
    let signature = error_signature(error);
    health.record_outcome(&provider_id, outcome, latency_ms);
    tracing::warn!(
        request_id = %request.id,
        provider = %provider_id,
        outcome = outcome.as_str(),
        signature = %signature,
        latency_ms,
        "Provider attempt failed"
    );
    let record = InteractionRecord::new(
        request.id,
        request.session_id.clone(),
        Some(provider_id),
        request.operation,
        outcome,
    )
    .with_signature(signature.clone())
    .with_latency(latency_ms)
    .with_prompt(request.payload.last_prompt());
    append_best_effort(memory, record).await;
    signature
}
