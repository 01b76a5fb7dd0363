//! 自愈巡检
//!
//! 周期性读取交互记忆，发现“系统性”故障（失败率高且错误签名集中于同一类别）时禁用 Provider；
//! 对巡检禁用、且窗口内无失败记录的 Provider 发一次探测请求，成功则重新启用。
//! 不删除记录，不回答请求；只修改 Provider 启用状态与健康记录。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::MemoryError;
use crate::healing::{error_signature, signature_class};
use crate::llm::{HealthTracker, Operation, Payload, ProviderEntry, ProviderRegistry, ProviderState};
use crate::memory::{InteractionRecord, InteractionStore, Message, Outcome};

/// 探测请求使用的会话 id
pub const PROBE_SESSION_ID: &str = "__probe__";

/// 巡检策略
#[derive(Debug, Clone)]
pub struct MonitorPolicy {
    pub interval: Duration,
    pub window: Duration,
    /// 失败率需严格大于该值
    pub failure_rate_threshold: f64,
    pub min_samples: usize,
    /// 主导错误类别在失败中的最低占比
    pub dominant_share: f64,
    pub probe_timeout: Duration,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(600),
            failure_rate_threshold: 0.5,
            min_samples: 5,
            dominant_share: 0.8,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// 巡检产生的诊断事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HealingEvent {
    Disabled {
        provider_id: String,
        failure_rate: f64,
        error_class: String,
        samples: usize,
    },
    ProbeFailed {
        provider_id: String,
        signature: String,
    },
    Reenabled {
        provider_id: String,
    },
}

/// 单个 Provider 在窗口内的统计
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub attempts: usize,
    pub failures: usize,
    pub dominant_class: Option<String>,
    pub dominant_count: usize,
}

impl WindowStats {
    pub fn from_records(records: &[InteractionRecord]) -> Self {
        let attempts = records
            .iter()
            .filter(|r| r.outcome != Outcome::AllProvidersExhausted)
            .count();
        let mut classes: HashMap<&str, usize> = HashMap::new();
        let mut failures = 0;
        for r in records.iter().filter(|r| r.outcome.is_failure()) {
            failures += 1;
            let class = r
                .error_signature
                .as_deref()
                .map(signature_class)
                .unwrap_or(r.outcome.as_str());
            *classes.entry(class).or_default() += 1;
        }
        // 计数相同取字典序最小，保证结果确定
        let dominant = classes
            .into_iter()
            .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then(cb.cmp(ca)));
        Self {
            attempts,
            failures,
            dominant_class: dominant.map(|(c, _)| c.to_string()),
            dominant_count: dominant.map(|(_, n)| n).unwrap_or(0),
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts as f64
        }
    }
}

/// 自愈巡检器
pub struct SelfHealingMonitor {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    memory: Arc<dyn InteractionStore>,
    policy: MonitorPolicy,
    events: broadcast::Sender<HealingEvent>,
}

impl SelfHealingMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        memory: Arc<dyn InteractionStore>,
        policy: MonitorPolicy,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry,
            health,
            memory,
            policy,
            events,
        }
    }

    /// 订阅诊断事件
    pub fn subscribe(&self) -> broadcast::Receiver<HealingEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &MonitorPolicy {
        &self.policy
    }

    /// 后台周期巡检，直到 token 取消
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.policy.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 首次 tick 立即返回，跳过以免启动即巡检
            interval.tick().await;
            tracing::info!(
                interval_ms = self.policy.interval.as_millis() as u64,
                window_ms = self.policy.window.as_millis() as u64,
                "Self-healing monitor started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Self-healing monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let events = self.reconcile_at(Utc::now()).await;
                        if !events.is_empty() {
                            tracing::debug!(count = events.len(), "Reconciliation produced events");
                        }
                    }
                }
            }
        })
    }

    /// 一轮巡检（以 now 为窗口终点）；返回本轮产生的事件
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Vec<HealingEvent> {
        let since = now
            - chrono::Duration::from_std(self.policy.window)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        // 各 Provider 互不依赖，探测可能较慢，故并发检查；join_all 保持注册顺序
        let checks = self.registry.iter().map(|entry| async move {
            let result = match entry.state() {
                ProviderState::Enabled => self.check_enabled(entry, since).await,
                ProviderState::DisabledByMonitor => self.check_disabled(entry, since).await,
                ProviderState::DisabledByOperator => Ok(None),
            };
            (entry, result)
        });

        let mut events = Vec::new();
        for (entry, result) in join_all(checks).await {
            match result {
                Ok(Some(event)) => {
                    let _ = self.events.send(event.clone());
                    events.push(event);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(provider = %entry.id(), error = %e, "Reconciliation skipped, memory unavailable");
                }
            }
        }
        events
    }

    async fn check_enabled(
        &self,
        entry: &Arc<ProviderEntry>,
        since: DateTime<Utc>,
    ) -> Result<Option<HealingEvent>, MemoryError> {
        let records = self.memory.recent_outcomes(entry.id(), since).await?;
        let stats = WindowStats::from_records(&records);
        if stats.attempts < self.policy.min_samples || stats.failures == 0 {
            return Ok(None);
        }
        let rate = stats.failure_rate();
        let share = stats.dominant_count as f64 / stats.failures as f64;
        if rate <= self.policy.failure_rate_threshold || share < self.policy.dominant_share {
            return Ok(None);
        }
        if !entry.monitor_disable() {
            return Ok(None);
        }
        let error_class = stats.dominant_class.unwrap_or_default();
        tracing::warn!(
            provider = %entry.id(),
            failure_rate = rate,
            error_class = %error_class,
            samples = stats.attempts,
            "Provider disabled by self-healing monitor"
        );
        Ok(Some(HealingEvent::Disabled {
            provider_id: entry.id().to_string(),
            failure_rate: rate,
            error_class,
            samples: stats.attempts,
        }))
    }

    async fn check_disabled(
        &self,
        entry: &Arc<ProviderEntry>,
        since: DateTime<Utc>,
    ) -> Result<Option<HealingEvent>, MemoryError> {
        let failures = self.memory.recent_failures(entry.id(), since).await?;
        if !failures.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.probe(entry).await))
    }

    /// 合成探测请求；结果写入记忆，但不计入健康计数
    async fn probe(&self, entry: &Arc<ProviderEntry>) -> HealingEvent {
        let provider_id = entry.id().to_string();
        let payload = Payload::chat(vec![Message::user("ping")]);
        let adapter = entry.adapter();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.policy.probe_timeout,
            adapter.invoke(Operation::Chat, &payload, self.policy.probe_timeout),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let record = InteractionRecord::new(
            uuid::Uuid::new_v4(),
            PROBE_SESSION_ID,
            Some(provider_id.clone()),
            Operation::Chat,
            Outcome::Success,
        )
        .with_latency(latency_ms)
        .with_prompt(Some("ping".into()));

        let (record, event) = match result {
            Ok(Ok(_)) => {
                if entry.monitor_enable() {
                    self.health.clear_quarantine(&provider_id);
                    tracing::info!(provider = %provider_id, latency_ms, "Provider re-enabled after successful probe");
                }
                (
                    record,
                    HealingEvent::Reenabled {
                        provider_id: provider_id.clone(),
                    },
                )
            }
            Ok(Err(e)) => {
                let signature = error_signature(&e);
                let mut record = record.with_signature(signature.clone());
                record.outcome = if e.kind == crate::core::ProviderErrorKind::Timeout {
                    Outcome::Timeout
                } else {
                    Outcome::ProviderError
                };
                (record, self.probe_failed(&provider_id, signature))
            }
            Err(_) => {
                let signature = error_signature(&crate::core::ProviderError::timeout(format!(
                    "probe exceeded {}ms",
                    self.policy.probe_timeout.as_millis()
                )));
                let mut record = record.with_signature(signature.clone());
                record.outcome = Outcome::Timeout;
                (record, self.probe_failed(&provider_id, signature))
            }
        };
        if let Err(e) = self.memory.append(record).await {
            tracing::warn!(provider = %provider_id, error = %e, "Probe record lost");
        }
        event
    }

    fn probe_failed(&self, provider_id: &str, signature: String) -> HealingEvent {
        tracing::info!(provider = %provider_id, signature = %signature, "Probe failed, provider stays disabled");
        HealingEvent::ProbeFailed {
            provider_id: provider_id.to_string(),
            signature,
        }
    }
}
