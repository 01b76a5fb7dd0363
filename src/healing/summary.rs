//! 错误与性能摘要
//!
//! 只读汇总交互记忆：每个 Provider 的尝试数、成功率、平均延迟、token 总数，
//! 以及按错误签名类别统计的失败数。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::MemoryError;
use crate::healing::signature_class;
use crate::memory::{InteractionRecord, InteractionStore, Outcome};

/// 没有签名的失败归入该类别
const UNKNOWN_CLASS: &str = "unknown";

/// 单个 Provider 的摘要
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSummary {
    pub provider_id: String,
    pub attempts: usize,
    pub successes: usize,
    pub failures: usize,
    /// 无尝试时为 0
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub failures_by_class: BTreeMap<String, usize>,
}

impl ProviderSummary {
    pub fn from_records(provider_id: &str, records: &[InteractionRecord]) -> Self {
        let mut summary = ProviderSummary {
            provider_id: provider_id.to_string(),
            attempts: 0,
            successes: 0,
            failures: 0,
            success_rate: 0.0,
            avg_latency_ms: 0.0,
            total_tokens: 0,
            failures_by_class: BTreeMap::new(),
        };
        let mut latency_total: u64 = 0;
        for r in records {
            if r.outcome == Outcome::AllProvidersExhausted {
                continue;
            }
            summary.attempts += 1;
            latency_total += r.latency_ms;
            summary.total_tokens += r.tokens_used;
            if r.outcome == Outcome::Success {
                summary.successes += 1;
            } else {
                summary.failures += 1;
                let class = r
                    .error_signature
                    .as_deref()
                    .map(signature_class)
                    .unwrap_or(UNKNOWN_CLASS);
                *summary.failures_by_class.entry(class.to_string()).or_default() += 1;
            }
        }
        if summary.attempts > 0 {
            summary.success_rate = summary.successes as f64 / summary.attempts as f64;
            summary.avg_latency_ms = latency_total as f64 / summary.attempts as f64;
        }
        summary
    }
}

/// 全部 Provider 的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub since: DateTime<Utc>,
    pub total_attempts: usize,
    pub total_failures: usize,
    pub failures_by_class: BTreeMap<String, usize>,
    pub providers: Vec<ProviderSummary>,
}

/// 汇总 since 以来各 Provider 的记录（按给定顺序输出）
pub async fn error_summary(
    memory: &dyn InteractionStore,
    provider_ids: &[String],
    since: DateTime<Utc>,
) -> Result<ErrorSummary, MemoryError> {
    let mut providers = Vec::with_capacity(provider_ids.len());
    for id in provider_ids {
        let records = memory.recent_outcomes(id, since).await?;
        providers.push(ProviderSummary::from_records(id, &records));
    }

    let mut failures_by_class = BTreeMap::new();
    for p in &providers {
        for (class, n) in &p.failures_by_class {
            *failures_by_class.entry(class.clone()).or_default() += n;
        }
    }
    Ok(ErrorSummary {
        since,
        total_attempts: providers.iter().map(|p| p.attempts).sum(),
        total_failures: providers.iter().map(|p| p.failures).sum(),
        failures_by_class,
        providers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Operation;
    use crate::memory::InMemoryInteractionStore;

    fn record(provider: &str, outcome: Outcome, latency_ms: u64) -> InteractionRecord {
        InteractionRecord::new(
            uuid::Uuid::new_v4(),
            "s",
            Some(provider.to_string()),
            Operation::Chat,
            outcome,
        )
        .with_latency(latency_ms)
    }

    #[test]
    fn test_provider_summary_counts_and_averages() {
        let records = vec![
            record("p", Outcome::Success, 100).with_tokens(40),
            record("p", Outcome::Success, 300).with_tokens(60),
            record("p", Outcome::ProviderError, 50).with_signature("auth:invalid key"),
            record("p", Outcome::Timeout, 1000).with_signature("timeout:no response within #ms"),
            record("p", Outcome::ProviderError, 50),
        ];
        let s = ProviderSummary::from_records("p", &records);
        assert_eq!(s.attempts, 5);
        assert_eq!(s.successes, 2);
        assert_eq!(s.failures, 3);
        assert!((s.success_rate - 0.4).abs() < 1e-9);
        assert!((s.avg_latency_ms - 300.0).abs() < 1e-9);
        assert_eq!(s.total_tokens, 100);
        assert_eq!(s.failures_by_class.get("auth"), Some(&1));
        assert_eq!(s.failures_by_class.get("timeout"), Some(&1));
        assert_eq!(s.failures_by_class.get("unknown"), Some(&1));
    }

    #[test]
    fn test_empty_provider_has_zero_rates() {
        let s = ProviderSummary::from_records("idle", &[]);
        assert_eq!(s.attempts, 0);
        assert_eq!(s.success_rate, 0.0);
        assert_eq!(s.avg_latency_ms, 0.0);
    }

    #[tokio::test]
    async fn test_error_summary_respects_window_and_totals() {
        let memory = InMemoryInteractionStore::new();
        let now = Utc::now();
        memory.append(record("a", Outcome::Success, 10).at(now)).await.unwrap();
        memory
            .append(record("a", Outcome::ProviderError, 10).with_signature("rate_limit:slow down").at(now))
            .await
            .unwrap();
        memory
            .append(record("b", Outcome::ProviderError, 10).with_signature("rate_limit:quota").at(now))
            .await
            .unwrap();
        memory
            .append(
                record("b", Outcome::ProviderError, 10)
                    .with_signature("auth:old")
                    .at(now - chrono::Duration::hours(3)),
            )
            .await
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let summary = error_summary(&memory, &ids, now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(summary.total_attempts, 3);
        assert_eq!(summary.total_failures, 2);
        assert_eq!(summary.failures_by_class.get("rate_limit"), Some(&2));
        assert!(!summary.failures_by_class.contains_key("auth"));
        assert_eq!(summary.providers[0].provider_id, "a");
        assert!((summary.providers[0].success_rate - 0.5).abs() < 1e-9);
    }
}
