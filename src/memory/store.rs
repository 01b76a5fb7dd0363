//! 交互记忆存储
//!
//! 只追加日志，按 provider_id 与 session_id 各维护一份索引，读取不需要全表扫描。
//! Router 与 SelfHealingMonitor 只追加 / 读取，从不修改已有记录。

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::MemoryError;
use crate::memory::InteractionRecord;

/// 交互记忆存储 trait
#[async_trait]
pub trait InteractionStore: Send + Sync {
    /// 追加一条记录，返回分配的序号；只在存储层 I/O 失败时返回错误
    async fn append(&self, record: InteractionRecord) -> Result<u64, MemoryError>;

    /// 某 Provider 自 since 起的全部尝试（按时间升序）
    async fn recent_outcomes(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>, MemoryError>;

    /// 某 Provider 自 since 起的失败记录（PROVIDER_ERROR / TIMEOUT）
    async fn recent_failures(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        Ok(self
            .recent_outcomes(provider_id, since)
            .await?
            .into_iter()
            .filter(|r| r.outcome.is_failure())
            .collect())
    }

    /// 会话最近 max_entries 条记录，按时间升序（超出时丢弃最旧的）
    async fn context_for(
        &self,
        session_id: &str,
        max_entries: usize,
    ) -> Result<Vec<InteractionRecord>, MemoryError>;

    /// 记录总数
    async fn len(&self) -> Result<u64, MemoryError>;
}

#[derive(Default)]
struct Inner {
    records: Vec<InteractionRecord>,
    by_provider: HashMap<String, Vec<usize>>,
    by_session: HashMap<String, Vec<usize>>,
}

/// 进程内实现（memory.backend = "memory" 或测试时使用）
#[derive(Default)]
pub struct InMemoryInteractionStore {
    inner: RwLock<Inner>,
}

impl InMemoryInteractionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InteractionStore for InMemoryInteractionStore {
    async fn append(&self, mut record: InteractionRecord) -> Result<u64, MemoryError> {
        let mut inner = self.inner.write().map_err(|_| MemoryError::Poisoned)?;
        let index = inner.records.len();
        let seq = index as u64 + 1;
        record.seq = Some(seq);
        if let Some(provider_id) = &record.provider_id {
            inner
                .by_provider
                .entry(provider_id.clone())
                .or_default()
                .push(index);
        }
        inner
            .by_session
            .entry(record.session_id.clone())
            .or_default()
            .push(index);
        inner.records.push(record);
        Ok(seq)
    }

    async fn recent_outcomes(
        &self,
        provider_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        let inner = self.inner.read().map_err(|_| MemoryError::Poisoned)?;
        let Some(indices) = inner.by_provider.get(provider_id) else {
            return Ok(Vec::new());
        };
        Ok(indices
            .iter()
            .map(|&i| &inner.records[i])
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn context_for(
        &self,
        session_id: &str,
        max_entries: usize,
    ) -> Result<Vec<InteractionRecord>, MemoryError> {
        let inner = self.inner.read().map_err(|_| MemoryError::Poisoned)?;
        let Some(indices) = inner.by_session.get(session_id) else {
            return Ok(Vec::new());
        };
        let skip = indices.len().saturating_sub(max_entries);
        Ok(indices[skip..]
            .iter()
            .map(|&i| inner.records[i].clone())
            .collect())
    }

    async fn len(&self) -> Result<u64, MemoryError> {
        let inner = self.inner.read().map_err(|_| MemoryError::Poisoned)?;
        Ok(inner.records.len() as u64)
    }
}
