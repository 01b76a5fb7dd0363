//! Groq 免费层（OpenAI 兼容格式）
//!
//! - Base URL: https://api.groq.com/openai/v1
//! - 默认模型: llama3-8b-8192
//! - API Key: 由注册表解析（api_key_env，其次 `GROQ_API_KEY`）

use crate::llm::OpenAiAdapter;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const GROQ_DEFAULT_MODEL: &str = "llama3-8b-8192";

/// 创建 Groq Adapter
pub fn create_groq_adapter(
    endpoint: Option<&str>,
    model: Option<&str>,
    api_key: Option<String>,
) -> OpenAiAdapter {
    OpenAiAdapter::new(
        Some(endpoint.unwrap_or(GROQ_BASE_URL)),
        model.unwrap_or(GROQ_DEFAULT_MODEL),
        api_key,
        false,
    )
    .with_backend("groq")
}
