//! Mock Adapter（用于测试与本地试跑，无需任何后端）
//!
//! 行为可脚本化：先按顺序消费 script 队列，队列空后使用 fallback；
//! 默认回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ProviderError, ProviderErrorKind};
use crate::llm::{Operation, Payload, ProviderAdapter, Response};
use crate::memory::Role;

/// 单次调用的行为
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// 回显最后一条 User 消息（或图片提示词）
    Echo,
    Reply(String),
    Fail(ProviderErrorKind),
    /// 永不返回，由调用方超时终止
    Hang,
    /// 先等待再执行内部行为
    Delayed(Duration, Box<MockBehavior>),
}

/// Mock 客户端
pub struct MockAdapter {
    script: Mutex<VecDeque<MockBehavior>>,
    fallback: Mutex<MockBehavior>,
    calls: AtomicUsize,
    vision: bool,
}

impl MockAdapter {
    pub fn new(fallback: MockBehavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicUsize::new(0),
            vision: false,
        }
    }

    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::new(MockBehavior::Reply(text.into()))
    }

    pub fn failing(kind: ProviderErrorKind) -> Self {
        Self::new(MockBehavior::Fail(kind))
    }

    pub fn hanging() -> Self {
        Self::new(MockBehavior::Hang)
    }

    /// 追加一条脚本行为（优先于 fallback）
    pub fn then(self, behavior: MockBehavior) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(behavior);
        }
        self
    }

    pub fn with_vision(mut self, vision: bool) -> Self {
        self.vision = vision;
        self
    }

    /// 运行中切换默认行为（模拟后端恢复 / 故障）
    pub fn set_fallback(&self, behavior: MockBehavior) {
        if let Ok(mut fallback) = self.fallback.lock() {
            *fallback = behavior;
        }
    }

    /// 已被调用次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> MockBehavior {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| {
            self.fallback
                .lock()
                .map(|f| f.clone())
                .unwrap_or(MockBehavior::Echo)
        })
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::echo()
    }
}

fn echo_text(payload: &Payload) -> String {
    let input = match payload {
        Payload::Chat { messages, .. } => messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)"),
        Payload::Image { prompt, .. } => prompt.as_str(),
    };
    format!("Echo from Mock: {}", input)
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn invoke(
        &self,
        operation: Operation,
        payload: &Payload,
        _timeout: Duration,
    ) -> Result<Response, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports(operation) {
            return Err(ProviderError::unsupported(format!("mock does not support {}", operation)));
        }
        let mut behavior = self.next_behavior();
        loop {
            match behavior {
                MockBehavior::Echo => return Ok(Response::text(echo_text(payload))),
                MockBehavior::Reply(text) => return Ok(Response::text(text)),
                MockBehavior::Fail(kind) => {
                    return Err(ProviderError::new(kind, format!("mock {} failure", kind)))
                }
                MockBehavior::Hang => {
                    std::future::pending::<()>().await;
                    return Err(ProviderError::timeout("mock hang finished"));
                }
                MockBehavior::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    behavior = *inner;
                }
            }
        }
    }

    fn supports(&self, operation: Operation) -> bool {
        !operation.needs_vision() || self.vision
    }

    fn backend(&self) -> &'static str {
        "mock"
    }
}
