//! 交互记录：每次 Provider 尝试（或无候选时的一次拒绝）对应一条只追加的记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::Operation;

/// 尝试结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    ProviderError,
    Timeout,
    AllProvidersExhausted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::ProviderError => "PROVIDER_ERROR",
            Outcome::Timeout => "TIMEOUT",
            Outcome::AllProvidersExhausted => "ALL_PROVIDERS_EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUCCESS" => Some(Outcome::Success),
            "PROVIDER_ERROR" => Some(Outcome::ProviderError),
            "TIMEOUT" => Some(Outcome::Timeout),
            "ALL_PROVIDERS_EXHAUSTED" => Some(Outcome::AllProvidersExhausted),
            _ => None,
        }
    }

    /// 计入 Provider 失败（Monitor 统计失败率时使用）
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::ProviderError | Outcome::Timeout)
    }
}

/// 持久化的交互记录；seq 由存储层在追加时分配（单调递增）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub seq: Option<u64>,
    pub request_id: Uuid,
    pub session_id: String,
    /// 无 Provider 接受请求时为 None
    pub provider_id: Option<String>,
    pub operation: Operation,
    pub outcome: Outcome,
    pub error_signature: Option<String>,
    pub latency_ms: u64,
    /// 成功调用时后端报告的 token 数
    #[serde(default)]
    pub tokens_used: u64,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InteractionRecord {
    pub fn new(
        request_id: Uuid,
        session_id: impl Into<String>,
        provider_id: Option<String>,
        operation: Operation,
        outcome: Outcome,
    ) -> Self {
        Self {
            seq: None,
            request_id,
            session_id: session_id.into(),
            provider_id,
            operation,
            outcome,
            error_signature: None,
            latency_ms: 0,
            tokens_used: 0,
            prompt: None,
            response: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.error_signature = Some(signature.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_tokens(mut self, tokens_used: u64) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
