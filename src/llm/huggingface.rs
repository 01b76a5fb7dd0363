//! HuggingFace Inference API（免费层，文本生成）
//!
//! 对话消息拼成 "User: ...\nAssistant: ..." 形式的单段 prompt；只支持 Chat。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::{ProviderError, ProviderErrorKind};
use crate::llm::{Operation, Payload, ProviderAdapter, Response};
use crate::memory::Role;

pub const HUGGINGFACE_DEFAULT_ENDPOINT: &str = "https://api-inference.huggingface.co";
pub const HUGGINGFACE_DEFAULT_MODEL: &str = "microsoft/DialoGPT-large";

/// HuggingFace Adapter
pub struct HuggingFaceAdapter {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HuggingFaceAdapter {
    pub fn new(endpoint: Option<&str>, model: Option<&str>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: endpoint
                .unwrap_or(HUGGINGFACE_DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or(HUGGINGFACE_DEFAULT_MODEL).to_string(),
            api_key,
        }
    }

    fn build_prompt(payload: &Payload) -> Option<String> {
        let Payload::Chat {
            messages,
            system_prompt,
            ..
        } = payload
        else {
            return None;
        };
        let mut prompt = String::new();
        if let Some(system) = system_prompt {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }
        for m in messages {
            let label = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            prompt.push_str(&format!("{}: {}\n", label, m.content));
        }
        prompt.push_str("Assistant: ");
        Some(prompt)
    }

    fn build_body(payload: &Payload) -> Option<Value> {
        let prompt = Self::build_prompt(payload)?;
        let (max_tokens, temperature) = match payload {
            Payload::Chat {
                max_tokens,
                temperature,
                ..
            } => (max_tokens.unwrap_or(256), temperature.unwrap_or(0.7)),
            Payload::Image { .. } => return None,
        };
        Some(json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": max_tokens,
                "temperature": temperature,
                "return_full_text": false,
            }
        }))
    }
}

/// 响应可能是 [{generated_text}] 或 {generated_text}，出错时为 {error}
fn extract_generated_text(value: &Value) -> Result<String, ProviderError> {
    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        return Err(ProviderError::transport(format!("huggingface: {}", err)));
    }
    let item = value.as_array().and_then(|a| a.first()).unwrap_or(value);
    item.get("generated_text")
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| ProviderError::transport("huggingface response missing generated_text"))
}

#[async_trait]
impl ProviderAdapter for HuggingFaceAdapter {
    async fn invoke(
        &self,
        operation: Operation,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<Response, ProviderError> {
        let body = match (operation, Self::build_body(payload)) {
            (Operation::Chat, Some(body)) => body,
            _ => {
                return Err(ProviderError::unsupported(format!(
                    "huggingface does not support {}",
                    operation
                )))
            }
        };
        let url = format!("{}/models/{}", self.base_url, self.model);
        let mut req = self.client.post(&url).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                ProviderErrorKind::from_status(status.as_u16()),
                format!("huggingface http {}: {}", status.as_u16(), text),
            ));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport(format!("invalid huggingface response: {}", e)))?;
        let content = extract_generated_text(&value)?;

        Ok(Response {
            provider_id: String::new(),
            content,
            model: Some(self.model.clone()),
            tokens_used: 0,
            latency_ms: 0,
        })
    }

    fn backend(&self) -> &'static str {
        "huggingface"
    }
}
