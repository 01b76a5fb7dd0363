//! Provider Adapter 抽象
//!
//! 每个后端（Ollama / HuggingFace / Groq / OpenAI / Mock）实现 ProviderAdapter。
//! Adapter 是唯一允许做网络 I/O 的组件；后端特有的响应格式在 Adapter 内部折叠为统一的 Response。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::ProviderError;
use crate::llm::{Operation, Payload, Response};

/// 统一的后端调用契约
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// 调用后端；timeout 为本次调用的上限（Router 另外在外层强制同一上限）
    async fn invoke(
        &self,
        operation: Operation,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<Response, ProviderError>;

    /// 是否支持该操作；不支持的 Provider 会被 Router 跳过且不计入健康失败
    fn supports(&self, operation: Operation) -> bool {
        operation == Operation::Chat
    }

    /// 用于日志的后端名称
    fn backend(&self) -> &'static str;
}
