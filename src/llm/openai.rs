//! OpenAI 兼容后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；Groq、OpenAI、自建代理等共用此实现。
//! 视觉模型通过 image_url（data URL）发送图片。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartImageArgs, ChatCompletionRequestMessageContentPartTextArgs,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::{ProviderError, ProviderErrorKind};
use crate::llm::{Operation, Payload, ProviderAdapter, Response};
use crate::memory::{Message, Role};

/// OpenAI 兼容 Adapter：持有 Client 与 model 名，invoke 时转换 Payload 并取首条 content
pub struct OpenAiAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    vision: bool,
    backend: &'static str,
}

impl OpenAiAdapter {
    /// 不读取任何环境变量；api_key 为空时请求会以 auth 错误失败
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<String>, vision: bool) -> Self {
        let api_key = api_key.unwrap_or_default();

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            vision,
            backend: "openai",
        }
    }

    /// 日志中显示的后端名（如 "groq"）
    pub fn with_backend(mut self, backend: &'static str) -> Self {
        self.backend = backend;
        self
    }

    fn to_openai_messages(
        messages: &[Message],
        system_prompt: Option<&str>,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()?,
            ));
        }
        for m in messages {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }

    fn build_messages(
        payload: &Payload,
    ) -> Result<(Vec<ChatCompletionRequestMessage>, Option<u32>, Option<f32>), OpenAIError> {
        match payload {
            Payload::Chat {
                messages,
                system_prompt,
                max_tokens,
                temperature,
            } => Ok((
                Self::to_openai_messages(messages, system_prompt.as_deref())?,
                *max_tokens,
                *temperature,
            )),
            Payload::Image { image, prompt } => {
                let data_url = format!("data:{};base64,{}", image.mime_type, image.base64);
                let parts: Vec<ChatCompletionRequestUserMessageContentPart> = vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(prompt.clone())
                        .build()?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(ImageUrlArgs::default().url(data_url).build()?)
                        .build()?
                        .into(),
                ];
                let user = ChatCompletionRequestUserMessageArgs::default()
                    .content(parts)
                    .build()?;
                Ok((vec![ChatCompletionRequestMessage::User(user)], None, None))
            }
        }
    }
}

/// async_openai 错误只暴露文本，按关键字归类
fn classify(err: &OpenAIError) -> ProviderError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    let kind = if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("api key")
        || lower.contains("api_key")
    {
        ProviderErrorKind::Auth
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("rate_limit") {
        ProviderErrorKind::RateLimit
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Transport
    };
    ProviderError::new(kind, message)
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn invoke(
        &self,
        operation: Operation,
        payload: &Payload,
        timeout: Duration,
    ) -> Result<Response, ProviderError> {
        if !self.supports(operation) {
            return Err(ProviderError::unsupported(format!(
                "{} model {} does not support {}",
                self.backend, self.model, operation
            )));
        }
        let (messages, max_tokens, temperature) =
            Self::build_messages(payload).map_err(|e| ProviderError::transport(e.to_string()))?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(messages);
        if let Some(n) = max_tokens {
            args.max_tokens(n);
        }
        if let Some(t) = temperature {
            args.temperature(t);
        }
        let request = args
            .build()
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let response = tokio::time::timeout(timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                ProviderError::timeout(format!("{} did not answer within {:?}", self.backend, timeout))
            })?
            .map_err(|e| classify(&e))?;

        let tokens_used = response
            .usage
            .as_ref()
            .map(|u| u.total_tokens as u64)
            .unwrap_or(0);
        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(Response {
            provider_id: String::new(),
            content,
            model: Some(response.model),
            tokens_used,
            latency_ms: 0,
        })
    }

    fn supports(&self, operation: Operation) -> bool {
        !operation.needs_vision() || self.vision
    }

    fn backend(&self) -> &'static str {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageInput;

    #[test]
    fn test_system_prompt_goes_first() {
        let payload = Payload::Chat {
            messages: vec![Message::user("hi")],
            system_prompt: Some("sys".into()),
            max_tokens: Some(10),
            temperature: None,
        };
        let (messages, max_tokens, _) = OpenAiAdapter::build_messages(&payload).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert_eq!(max_tokens, Some(10));
    }

    #[test]
    fn test_image_payload_builds_single_user_message() {
        let payload = Payload::Image {
            image: ImageInput {
                mime_type: "image/jpeg".into(),
                base64: "AAAA".into(),
            },
            prompt: "what is this".into(),
        };
        let (messages, _, _) = OpenAiAdapter::build_messages(&payload).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_vision_capability_gates_image_ops() {
        let text_only = OpenAiAdapter::new(Some("http://localhost:1"), "m", Some("k".into()), false);
        assert!(text_only.supports(Operation::Chat));
        assert!(!text_only.supports(Operation::ExtractText));
        let vision = OpenAiAdapter::new(None, "m", Some("k".into()), true).with_backend("custom");
        assert!(vision.supports(Operation::DescribeImage));
        assert_eq!(vision.backend(), "custom");
    }
}
