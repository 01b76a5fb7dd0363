//! 健康追踪
//!
//! 每个 Provider 一条 HealthRecord，存放在 DashMap 中；更新在该 Provider 的分片锁内完成，
//! 并发的成功 / 失败不会丢失计数，不同 Provider 之间互不阻塞。纯计算，无 I/O。

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::memory::Outcome;

/// 隔离策略
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// 连续失败达到该值即进入隔离
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    /// 隔离时长上限，保证 Provider 终会被重试
    pub max_backoff: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl HealthPolicy {
    /// min(max_backoff, base_backoff * 2^consecutive_failures)
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive_failures).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// 单个 Provider 的健康记录
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthRecord {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: u64,
    pub quarantined_until: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// success / (success + failure + 1)
    pub fn health_score(&self) -> f64 {
        self.success_count as f64 / (self.success_count + self.failure_count + 1) as f64
    }

    pub fn is_quarantined(&self, now: DateTime<Utc>) -> bool {
        self.quarantined_until.is_some_and(|until| until > now)
    }
}

/// 健康追踪器：HealthRecord 的唯一修改入口（Router 与 SelfHealingMonitor 共用）
pub struct HealthTracker {
    records: DashMap<String, HealthRecord>,
    policy: HealthPolicy,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// 预先登记 Provider（Registry 构建时调用）
    pub fn register(&self, provider_id: &str) {
        self.records.entry(provider_id.to_string()).or_default();
    }

    /// 记录一次结果（当前时间）
    pub fn record_outcome(&self, provider_id: &str, outcome: Outcome, latency_ms: u64) {
        self.record_outcome_at(provider_id, outcome, latency_ms, Utc::now());
    }

    /// 记录一次结果：成功清零连续失败并解除隔离；失败累加并在达到阈值时设置隔离期限。
    /// 每次调用都是真实事件，不做幂等去重。
    pub fn record_outcome_at(
        &self,
        provider_id: &str,
        outcome: Outcome,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) {
        let mut record = self.records.entry(provider_id.to_string()).or_default();
        record.last_latency_ms = latency_ms;
        match outcome {
            Outcome::Success => {
                record.success_count += 1;
                record.consecutive_failures = 0;
                record.quarantined_until = None;
            }
            Outcome::ProviderError | Outcome::Timeout => {
                record.failure_count += 1;
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                if record.consecutive_failures >= self.policy.failure_threshold {
                    let backoff = self.policy.backoff_for(record.consecutive_failures);
                    let until = chrono::Duration::from_std(backoff)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(now);
                    record.quarantined_until = Some(until);
                    tracing::warn!(
                        provider = %provider_id,
                        consecutive_failures = record.consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Provider quarantined"
                    );
                }
            }
            Outcome::AllProvidersExhausted => {}
        }
    }

    /// enabled && 未处于隔离期
    pub fn is_available(&self, provider_id: &str, enabled: bool, now: DateTime<Utc>) -> bool {
        enabled && !self.is_quarantined(provider_id, now)
    }

    pub fn is_quarantined(&self, provider_id: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(provider_id)
            .is_some_and(|r| r.is_quarantined(now))
    }

    pub fn health_score(&self, provider_id: &str) -> f64 {
        self.records
            .get(provider_id)
            .map(|r| r.health_score())
            .unwrap_or(0.0)
    }

    /// 某 Provider 记录的快照（克隆，不持有锁）
    pub fn snapshot(&self, provider_id: &str) -> Option<HealthRecord> {
        self.records.get(provider_id).map(|r| r.clone())
    }

    /// 清除隔离与连续失败（探测成功后由 Monitor 调用），累计计数保留
    pub fn clear_quarantine(&self, provider_id: &str) {
        if let Some(mut record) = self.records.get_mut(provider_id) {
            record.consecutive_failures = 0;
            record.quarantined_until = None;
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}
