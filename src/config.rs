//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OPENLLM__*` 覆盖（双下划线表示嵌套，如 `OPENLLM__ROUTER__PER_PROVIDER_TIMEOUT_MS=5000`）。
//! Router / HealthTracker / SelfHealingMonitor 只读消费这些配置。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::RegistryError;
use crate::llm::{CostClass, HealthPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub router: RouterSection,
    pub quarantine: QuarantineSection,
    pub monitor: MonitorSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
    /// 为空时使用 default_providers()
    pub providers: Vec<ProviderSection>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            router: RouterSection::default(),
            quarantine: QuarantineSection::default(),
            monitor: MonitorSection::default(),
            memory: MemorySection::default(),
            tools: ToolsSection::default(),
            providers: Vec::new(),
        }
    }
}

/// [app] 段：数据目录与文件工具的沙箱根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            workspace_root: PathBuf::from("workspace"),
        }
    }
}

/// [router] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 单个 Provider 调用上限（毫秒）
    pub per_provider_timeout_ms: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            per_provider_timeout_ms: 30_000,
        }
    }
}

/// [quarantine] 段：连续失败阈值与指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuarantineSection {
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub failure_threshold: u32,
}

impl Default for QuarantineSection {
    fn default() -> Self {
        Self {
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            failure_threshold: 3,
        }
    }
}

/// [monitor] 段：自愈巡检
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_ms: u64,
    /// 统计失败率的尾随窗口
    pub window_ms: u64,
    pub failure_rate_threshold: f64,
    /// 窗口内尝试次数少于该值时不做判定
    pub min_samples: usize,
    /// 主导错误类别占失败数的最低比例
    pub dominant_share: f64,
    pub probe_timeout_ms: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            window_ms: 600_000,
            failure_rate_threshold: 0.5,
            min_samples: 5,
            dominant_share: 0.8,
            probe_timeout_ms: 10_000,
        }
    }
}

/// 记忆后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    Sqlite,
    Memory,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_context_entries: usize,
    pub backend: MemoryBackend,
    /// 未设置时为 <data_dir>/interactions.db
    pub sqlite_path: Option<PathBuf>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_context_entries: 20,
            backend: MemoryBackend::Sqlite,
            sqlite_path: None,
        }
    }
}

/// [tools] 段：文件 / 图片协作方的限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub max_file_bytes: u64,
    pub max_image_bytes: u64,
    pub blocked_extensions: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_file_bytes: 1024 * 1024,
            max_image_bytes: 20 * 1024 * 1024,
            blocked_extensions: default_blocked_extensions(),
        }
    }
}

fn default_blocked_extensions() -> Vec<String> {
    [
        "exe", "bat", "cmd", "com", "scr", "pif", "sh", "bash", "zsh", "fish", "ps1", "vbs",
        "js", "jar", "app", "deb", "rpm",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [[providers]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    pub id: String,
    /// ollama / huggingface / groq / openai / mock
    pub kind: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_cost_class")]
    pub cost_class: CostClass,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 读取 API Key 的环境变量名（如 GROQ_API_KEY）
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub supports_vision: bool,
}

fn default_priority() -> u32 {
    10
}

fn default_cost_class() -> CostClass {
    CostClass::FreeRemote
}

fn default_true() -> bool {
    true
}

/// 未配置 Provider 时的默认注册表：本地 Ollama、HuggingFace 免费层、Groq 免费层、（禁用的）OpenAI 付费
pub fn default_providers() -> Vec<ProviderSection> {
    vec![
        ProviderSection {
            id: "ollama-local".into(),
            kind: "ollama".into(),
            endpoint: Some("http://localhost:11434".into()),
            model: Some("llama3.1".into()),
            priority: 1,
            cost_class: CostClass::FreeLocal,
            enabled: true,
            api_key_env: None,
            supports_vision: true,
        },
        ProviderSection {
            id: "huggingface-free".into(),
            kind: "huggingface".into(),
            endpoint: Some("https://api-inference.huggingface.co".into()),
            model: Some("microsoft/DialoGPT-large".into()),
            priority: 2,
            cost_class: CostClass::FreeRemote,
            enabled: true,
            api_key_env: Some("HUGGINGFACE_API_KEY".into()),
            supports_vision: false,
        },
        ProviderSection {
            id: "groq-free".into(),
            kind: "groq".into(),
            endpoint: Some("https://api.groq.com/openai/v1".into()),
            model: Some("llama3-8b-8192".into()),
            priority: 3,
            cost_class: CostClass::FreeRemote,
            enabled: true,
            api_key_env: Some("GROQ_API_KEY".into()),
            supports_vision: false,
        },
        ProviderSection {
            id: "openai-paid".into(),
            kind: "openai".into(),
            endpoint: None,
            model: Some("gpt-4o-mini".into()),
            priority: 4,
            cost_class: CostClass::Paid,
            enabled: false,
            api_key_env: Some("OPENAI_API_KEY".into()),
            supports_vision: false,
        },
    ]
}

impl AppConfig {
    /// 实际生效的 Provider 列表
    pub fn effective_providers(&self) -> Vec<ProviderSection> {
        if self.providers.is_empty() {
            default_providers()
        } else {
            self.providers.clone()
        }
    }

    pub fn per_provider_timeout(&self) -> Duration {
        Duration::from_millis(self.router.per_provider_timeout_ms)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.quarantine.failure_threshold,
            base_backoff: Duration::from_millis(self.quarantine.base_backoff_ms),
            max_backoff: Duration::from_millis(self.quarantine.max_backoff_ms),
        }
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.memory
            .sqlite_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("interactions.db"))
    }

    /// 校验：Provider id 唯一、阈值在合法范围内
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = HashSet::new();
        for p in self.effective_providers() {
            if p.id.trim().is_empty() {
                return Err(RegistryError::Invalid("provider id must not be empty".into()));
            }
            if !seen.insert(p.id.clone()) {
                return Err(RegistryError::DuplicateProvider(p.id));
            }
        }
        if self.quarantine.failure_threshold == 0 {
            return Err(RegistryError::Invalid(
                "quarantine.failure_threshold must be >= 1".into(),
            ));
        }
        if self.quarantine.base_backoff_ms > self.quarantine.max_backoff_ms {
            return Err(RegistryError::Invalid(
                "quarantine.base_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.monitor.failure_rate_threshold)
            || !(0.0..=1.0).contains(&self.monitor.dominant_share)
        {
            return Err(RegistryError::Invalid(
                "monitor thresholds must be within [0, 1]".into(),
            ));
        }
        if self.router.per_provider_timeout_ms == 0 || self.monitor.interval_ms == 0 {
            return Err(RegistryError::Invalid(
                "timeouts and intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 OPENLLM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 OPENLLM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OPENLLM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
