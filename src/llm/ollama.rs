//! Ollama 本地后端（/api/chat，非流式）
//!
//! 系统提示拼接到首条 user 消息前；视觉模型通过 message.images 传入 base64 图片。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{ProviderError, ProviderErrorKind};
use crate::llm::{Operation, Payload, ProviderAdapter, Response};
use crate::memory::Role;

pub const OLLAMA_DEFAULT_ENDPOINT: &str = "http://localhost:11434";
pub const OLLAMA_DEFAULT_MODEL: &str = "llama3.1";

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

/// Ollama Adapter
pub struct OllamaAdapter {
    client: Client,
    base_url: String,
    model: String,
    vision: bool,
}

impl OllamaAdapter {
    pub fn new(endpoint: Option<&str>, model: Option<&str>, vision: bool) -> Self {
        Self {
            client: Client::new(),
            base_url: endpoint
                .unwrap_or(OLLAMA_DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or(OLLAMA_DEFAULT_MODEL).to_string(),
            vision,
        }
    }

    fn build_body(&self, payload: &Payload) -> Value {
        match payload {
            Payload::Chat {
                messages,
                system_prompt,
                max_tokens,
                temperature,
            } => {
                let mut out: Vec<Value> = Vec::with_capacity(messages.len());
                let mut system_pending = system_prompt.clone();
                for m in messages {
                    // 不直接使用 system 角色：合并到首条 user 消息
                    if m.role == Role::System {
                        system_pending = Some(match system_pending {
                            Some(s) => format!("{}\n{}", s, m.content),
                            None => m.content.clone(),
                        });
                        continue;
                    }
                    let content = match (m.role, system_pending.take()) {
                        (Role::User, Some(system)) => format!("{}\n\n{}", system, m.content),
                        (_, pending) => {
                            system_pending = pending;
                            m.content.clone()
                        }
                    };
                    out.push(json!({ "role": m.role.as_str(), "content": content }));
                }
                let mut options = json!({});
                if let Some(t) = temperature {
                    options["temperature"] = json!(t);
                }
                if let Some(n) = max_tokens {
                    options["num_predict"] = json!(n);
                }
                json!({
                    "model": self.model,
                    "messages": out,
                    "stream": false,
                    "options": options,
                })
            }
            Payload::Image { image, prompt } => json!({
                "model": self.model,
                "messages": [{
                    "role": "user",
                    "content": prompt,
                    "images": [image.base64],
                }],
                "stream": false,
            }),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn invoke(
        &self,
        operation: Operation,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<Response, ProviderError> {
        if !self.supports(operation) {
            return Err(ProviderError::unsupported(format!(
                "ollama model {} does not support {}",
                self.model, operation
            )));
        }
        let url = format!("{}/api/chat", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&self.build_body(payload))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                ProviderErrorKind::from_status(status.as_u16()),
                format!("ollama http {}: {}", status.as_u16(), body),
            ));
        }
        let reply: ChatReply = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport(format!("invalid ollama response: {}", e)))?;

        let tokens = reply.prompt_eval_count.unwrap_or(0) + reply.eval_count.unwrap_or(0);
        Ok(Response {
            provider_id: String::new(),
            content: reply.message.map(|m| m.content).unwrap_or_default(),
            model: reply.model.or_else(|| Some(self.model.clone())),
            tokens_used: tokens,
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: Operation) -> bool {
        !operation.needs_vision() || self.vision
    }

    fn backend(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageInput;
    use crate::memory::Message;

    #[test]
    fn test_system_prompt_merged_into_first_user_message() {
        let adapter = OllamaAdapter::new(None, None, false);
        let payload = Payload::Chat {
            messages: vec![Message::user("hello"), Message::assistant("hi"), Message::user("again")],
            system_prompt: Some("be brief".into()),
            max_tokens: Some(64),
            temperature: None,
        };
        let body = adapter.build_body(&payload);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "be brief\n\nhello");
        assert_eq!(messages[2]["content"], "again");
        assert_eq!(body["options"]["num_predict"], 64);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_image_payload_carries_base64() {
        let adapter = OllamaAdapter::new(Some("http://host:1/"), Some("llava"), true);
        let payload = Payload::Image {
            image: ImageInput {
                mime_type: "image/png".into(),
                base64: "AAAA".into(),
            },
            prompt: "describe".into(),
        };
        let body = adapter.build_body(&payload);
        assert_eq!(body["model"], "llava");
        assert_eq!(body["messages"][0]["images"][0], "AAAA");
        assert_eq!(adapter.base_url, "http://host:1");
    }

    #[tokio::test]
    async fn test_vision_ops_rejected_without_vision_model() {
        let adapter = OllamaAdapter::new(None, None, false);
        assert!(!adapter.supports(Operation::DescribeImage));
        let payload = Payload::Image {
            image: ImageInput {
                mime_type: "image/png".into(),
                base64: String::new(),
            },
            prompt: String::new(),
        };
        let err = adapter
            .invoke(Operation::DescribeImage, &payload, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::UnsupportedOperation);
    }
}
