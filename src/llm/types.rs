//! 路由层数据模型：成本等级、操作、载荷、请求与响应
//!
//! Request 创建后不可变（Router 以 Arc 共享给各次尝试）；Response 不含任何后端特有字段。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::{Message, Role};

/// 成本等级：排序时免费优先（FreeLocal < FreeRemote < Paid）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    FreeLocal,
    FreeRemote,
    Paid,
}

impl fmt::Display for CostClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CostClass::FreeLocal => "free_local",
            CostClass::FreeRemote => "free_remote",
            CostClass::Paid => "paid",
        })
    }
}

/// 请求操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Chat,
    DescribeImage,
    ExtractText,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::DescribeImage => "describe_image",
            Operation::ExtractText => "extract_text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Operation::Chat),
            "describe_image" => Some(Operation::DescribeImage),
            "extract_text" => Some(Operation::ExtractText),
            _ => None,
        }
    }

    /// 需要视觉能力的操作
    pub fn needs_vision(&self) -> bool {
        matches!(self, Operation::DescribeImage | Operation::ExtractText)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已编码的图片（base64 + mime），由图片协作方生成
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub mime_type: String,
    pub base64: String,
}

/// 操作相关的载荷
#[derive(Debug, Clone)]
pub enum Payload {
    Chat {
        messages: Vec<Message>,
        system_prompt: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    },
    Image {
        image: ImageInput,
        prompt: String,
    },
}

impl Payload {
    pub fn chat(messages: Vec<Message>) -> Self {
        Payload::Chat {
            messages,
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }

    /// 最后一条 user 消息或图片提示词，原样写入交互记忆（chat 上下文据此还原）
    pub fn last_prompt(&self) -> Option<String> {
        let text = match self {
            Payload::Chat { messages, .. } => messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())?,
            Payload::Image { prompt, .. } => prompt.as_str(),
        };
        Some(text.to_string())
    }
}

/// 一次统一请求；字段在创建后不再修改
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub session_id: String,
    pub operation: Operation,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(session_id: impl Into<String>, operation: Operation, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            operation,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn chat(session_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::new(session_id, Operation::Chat, Payload::chat(messages))
    }
}

/// 统一响应（各 Adapter 负责把后端格式折叠为此结构）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub provider_id: String,
    pub content: String,
    pub model: Option<String>,
    pub tokens_used: u64,
    /// 由 Router 填写（Adapter 返回 0 即可）
    pub latency_ms: u64,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            provider_id: String::new(),
            content: content.into(),
            model: None,
            tokens_used: 0,
            latency_ms: 0,
        }
    }
}

/// 按字符截断，超长时追加省略号
pub fn excerpt(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
