//! Provider 注册表
//!
//! 启动时由配置构建，之后只读；唯一可变的是每个 Provider 的启用状态（原子量，
//! 由运维操作或 SelfHealingMonitor 切换）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::ProviderSection;
use crate::core::RegistryError;
use crate::llm::{
    create_groq_adapter, CostClass, HuggingFaceAdapter, MockAdapter, OllamaAdapter,
    OpenAiAdapter, ProviderAdapter,
};

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    HuggingFace,
    Groq,
    OpenAi,
    Mock,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Some(ProviderKind::Ollama),
            "huggingface" | "hf" => Some(ProviderKind::HuggingFace),
            "groq" => Some(ProviderKind::Groq),
            "openai" => Some(ProviderKind::OpenAi),
            "mock" => Some(ProviderKind::Mock),
            _ => None,
        }
    }
}

/// 启用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Enabled,
    /// 由自愈巡检禁用，探测成功后可自动恢复
    DisabledByMonitor,
    /// 由配置或运维禁用，巡检不会恢复
    DisabledByOperator,
}

impl ProviderState {
    fn to_u8(self) -> u8 {
        match self {
            ProviderState::Enabled => 0,
            ProviderState::DisabledByMonitor => 1,
            ProviderState::DisabledByOperator => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProviderState::Enabled,
            1 => ProviderState::DisabledByMonitor,
            _ => ProviderState::DisabledByOperator,
        }
    }
}

/// Provider 静态描述
#[derive(Debug, Clone, Serialize)]
pub struct Provider {
    pub id: String,
    pub kind: ProviderKind,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// 数值越小越优先
    pub priority: u32,
    pub cost_class: CostClass,
}

/// 注册表条目：描述 + 状态 + Adapter
pub struct ProviderEntry {
    pub provider: Provider,
    state: AtomicU8,
    adapter: Arc<dyn ProviderAdapter>,
}

impl ProviderEntry {
    pub fn new(provider: Provider, enabled: bool, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let state = if enabled {
            ProviderState::Enabled
        } else {
            ProviderState::DisabledByOperator
        };
        Self {
            provider,
            state: AtomicU8::new(state.to_u8()),
            adapter,
        }
    }

    pub fn id(&self) -> &str {
        &self.provider.id
    }

    pub fn adapter(&self) -> Arc<dyn ProviderAdapter> {
        Arc::clone(&self.adapter)
    }

    pub fn state(&self) -> ProviderState {
        ProviderState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == ProviderState::Enabled
    }

    /// 运维设置；无条件覆盖当前状态
    pub fn set_operator_enabled(&self, enabled: bool) {
        let next = if enabled {
            ProviderState::Enabled
        } else {
            ProviderState::DisabledByOperator
        };
        self.state.store(next.to_u8(), Ordering::Release);
    }

    /// Enabled -> DisabledByMonitor；状态已变化时返回 false
    pub fn monitor_disable(&self) -> bool {
        self.transition(ProviderState::Enabled, ProviderState::DisabledByMonitor)
    }

    /// DisabledByMonitor -> Enabled；运维禁用的 Provider 不受影响
    pub fn monitor_enable(&self) -> bool {
        self.transition(ProviderState::DisabledByMonitor, ProviderState::Enabled)
    }

    fn transition(&self, from: ProviderState, to: ProviderState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .field("backend", &self.adapter.backend())
            .finish()
    }
}

/// Provider 注册表（按注册顺序保存，另建 id 索引）
#[derive(Default)]
pub struct ProviderRegistry {
    entries: Vec<Arc<ProviderEntry>>,
    index: HashMap<String, usize>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Provider；id 重复时报错
    pub fn register(
        &mut self,
        provider: Provider,
        enabled: bool,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Result<(), RegistryError> {
        if self.index.contains_key(&provider.id) {
            return Err(RegistryError::DuplicateProvider(provider.id));
        }
        self.index.insert(provider.id.clone(), self.entries.len());
        self.entries
            .push(Arc::new(ProviderEntry::new(provider, enabled, adapter)));
        Ok(())
    }

    /// 由配置构建：按 kind 创建对应 Adapter
    pub fn from_config(sections: &[ProviderSection]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for section in sections {
            let kind = ProviderKind::parse(&section.kind).ok_or_else(|| RegistryError::UnknownKind {
                id: section.id.clone(),
                kind: section.kind.clone(),
            })?;
            let adapter = create_adapter(kind, section);
            let provider = Provider {
                id: section.id.clone(),
                kind,
                endpoint: section.endpoint.clone(),
                model: section.model.clone(),
                priority: section.priority,
                cost_class: section.cost_class,
            };
            registry.register(provider, section.enabled, adapter)?;
            tracing::info!(
                provider = %section.id,
                kind = ?kind,
                priority = section.priority,
                cost_class = %section.cost_class,
                enabled = section.enabled,
                "Provider registered"
            );
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ProviderEntry>> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_enabled()).count()
    }
}

/// 各后端自己的默认 Key 变量；绝不跨厂商回退
fn default_key_env(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::HuggingFace => Some("HUGGINGFACE_API_KEY"),
        ProviderKind::Groq => Some("GROQ_API_KEY"),
        ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
        ProviderKind::Ollama | ProviderKind::Mock => None,
    }
}

/// 先读配置的 api_key_env，再读该后端的默认变量
fn resolve_api_key(
    kind: ProviderKind,
    section: &ProviderSection,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    let read = |var: &str| lookup(var).filter(|k| !k.trim().is_empty());
    section
        .api_key_env
        .as_deref()
        .and_then(read)
        .or_else(|| default_key_env(kind).and_then(read))
}

/// 按后端种类创建 Adapter
fn create_adapter(kind: ProviderKind, section: &ProviderSection) -> Arc<dyn ProviderAdapter> {
    let api_key = resolve_api_key(kind, section, |var| std::env::var(var).ok());
    match kind {
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new(
            section.endpoint.as_deref(),
            section.model.as_deref(),
            section.supports_vision,
        )),
        ProviderKind::HuggingFace => Arc::new(HuggingFaceAdapter::new(
            section.endpoint.as_deref(),
            section.model.as_deref(),
            api_key,
        )),
        ProviderKind::Groq => Arc::new(create_groq_adapter(
            section.endpoint.as_deref(),
            section.model.as_deref(),
            api_key,
        )),
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(
            section.endpoint.as_deref(),
            section.model.as_deref().unwrap_or("gpt-4o-mini"),
            api_key,
            section.supports_vision,
        )),
        ProviderKind::Mock => Arc::new(MockAdapter::echo()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str, priority: u32) -> Provider {
        Provider {
            id: id.into(),
            kind: ProviderKind::Mock,
            endpoint: None,
            model: None,
            priority,
            cost_class: CostClass::FreeLocal,
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(provider("a", 1), true, Arc::new(MockAdapter::echo()))
            .unwrap();
        let err = registry
            .register(provider("a", 2), true, Arc::new(MockAdapter::echo()))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateProvider("a".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_monitor_transitions_do_not_override_operator() {
        let entry = ProviderEntry::new(provider("a", 1), false, Arc::new(MockAdapter::echo()));
        assert_eq!(entry.state(), ProviderState::DisabledByOperator);
        assert!(!entry.monitor_enable());
        assert!(!entry.is_enabled());

        entry.set_operator_enabled(true);
        assert!(entry.monitor_disable());
        assert!(!entry.monitor_disable());
        assert_eq!(entry.state(), ProviderState::DisabledByMonitor);
        assert!(entry.monitor_enable());
        assert!(entry.is_enabled());
    }

    #[test]
    fn test_from_config_rejects_unknown_kind() {
        let mut sections = crate::config::default_providers();
        sections[0].kind = "carrier-pigeon".into();
        let err = ProviderRegistry::from_config(&sections).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownKind { .. }));
    }

    #[test]
    fn test_from_config_builds_default_providers() {
        let registry = ProviderRegistry::from_config(&crate::config::default_providers()).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.enabled_count(), 3);
        let ollama = registry.get("ollama-local").unwrap();
        assert_eq!(ollama.provider.kind, ProviderKind::Ollama);
        assert!(ollama.adapter().supports(crate::llm::Operation::DescribeImage));
        assert!(!registry.get("openai-paid").unwrap().is_enabled());
    }

    #[test]
    fn test_api_key_never_crosses_vendors() {
        let only_openai = |var: &str| (var == "OPENAI_API_KEY").then(|| "sk-openai".to_string());
        let mut groq = crate::config::default_providers()
            .into_iter()
            .find(|s| s.kind == "groq")
            .unwrap();
        groq.api_key_env = None;
        assert_eq!(resolve_api_key(ProviderKind::Groq, &groq, only_openai), None);

        let openai = crate::config::default_providers()
            .into_iter()
            .find(|s| s.kind == "openai")
            .unwrap();
        assert_eq!(
            resolve_api_key(ProviderKind::OpenAi, &openai, only_openai).as_deref(),
            Some("sk-openai")
        );
    }

    #[test]
    fn test_configured_key_env_wins_and_blank_is_ignored() {
        let mut groq = crate::config::default_providers()
            .into_iter()
            .find(|s| s.kind == "groq")
            .unwrap();
        groq.api_key_env = Some("MY_GROQ".into());
        let lookup = |var: &str| match var {
            "MY_GROQ" => Some("custom".to_string()),
            "GROQ_API_KEY" => Some("fallback".to_string()),
            _ => None,
        };
        assert_eq!(resolve_api_key(ProviderKind::Groq, &groq, lookup).as_deref(), Some("custom"));

        let blank = |var: &str| match var {
            "MY_GROQ" => Some("  ".to_string()),
            "GROQ_API_KEY" => Some("fallback".to_string()),
            _ => None,
        };
        assert_eq!(resolve_api_key(ProviderKind::Groq, &groq, blank).as_deref(), Some("fallback"));
    }
}
