//! 引擎构建器：由 AppConfig 统一装配记忆存储、注册表、健康追踪、Router、自愈巡检与工具门面
//!
//! CLI 与集成测试共用同一套装配逻辑；测试可注入自定义注册表与存储。
//! 没有任何启用的 Provider 时引擎照常构建，但不含 Router 与自愈巡检。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, MemoryBackend};
use crate::core::RouterError;
use crate::healing::{MonitorPolicy, SelfHealingMonitor};
use crate::llm::{HealthTracker, ProviderRegistry, Router, RouterPolicy};
use crate::memory::{InMemoryInteractionStore, InteractionStore, SqliteInteractionStore};
use crate::tools::{FacadeLimits, SafeFs, ToolFacade};

/// 装配完成的引擎；router 与 monitor 仅在至少一个 Provider 启用时存在
pub struct Engine {
    pub router: Option<Arc<Router>>,
    pub monitor: Option<Arc<SelfHealingMonitor>>,
    pub facade: Arc<ToolFacade>,
}

impl Engine {
    /// 启动后台巡检，token 取消时退出；没有巡检器时返回 None
    pub fn start_monitor(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.monitor
            .as_ref()
            .map(|monitor| Arc::clone(monitor).spawn(shutdown))
    }
}

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    registry: Option<ProviderRegistry>,
    memory: Option<Arc<dyn InteractionStore>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            memory: None,
        }
    }

    /// 使用现成的注册表（忽略配置中的 providers）
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 使用现成的记忆存储（忽略 memory.backend）
    pub fn with_memory(mut self, memory: Arc<dyn InteractionStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn router_policy(config: &AppConfig) -> RouterPolicy {
        RouterPolicy {
            per_provider_timeout: config.per_provider_timeout(),
        }
    }

    pub fn monitor_policy(config: &AppConfig) -> MonitorPolicy {
        let m = &config.monitor;
        MonitorPolicy {
            interval: Duration::from_millis(m.interval_ms),
            window: Duration::from_millis(m.window_ms),
            failure_rate_threshold: m.failure_rate_threshold,
            min_samples: m.min_samples,
            dominant_share: m.dominant_share,
            probe_timeout: Duration::from_millis(m.probe_timeout_ms),
        }
    }

    pub fn build(self) -> anyhow::Result<Engine> {
        let config = self.config;
        config.validate().context("Invalid configuration")?;

        let memory: Arc<dyn InteractionStore> = match self.memory {
            Some(memory) => memory,
            None => match config.memory.backend {
                MemoryBackend::Sqlite => {
                    let path = config.sqlite_path();
                    let store = SqliteInteractionStore::open(&path)
                        .with_context(|| format!("Failed to open interaction store at {}", path.display()))?;
                    tracing::info!(path = %path.display(), "Interaction store opened");
                    Arc::new(store)
                }
                MemoryBackend::Memory => Arc::new(InMemoryInteractionStore::new()),
            },
        };

        let registry = match self.registry {
            Some(registry) => registry,
            None => ProviderRegistry::from_config(&config.effective_providers())
                .context("Failed to build provider registry")?,
        };
        let registry = Arc::new(registry);
        let health = Arc::new(HealthTracker::new(config.health_policy()));

        let (router, monitor) = match Router::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&memory),
            Self::router_policy(&config),
        ) {
            Ok(router) => {
                let monitor = Arc::new(SelfHealingMonitor::new(
                    Arc::clone(&registry),
                    health,
                    Arc::clone(&memory),
                    Self::monitor_policy(&config),
                ));
                (Some(Arc::new(router)), Some(monitor))
            }
            Err(RouterError::NoProviderConfigured) => {
                tracing::warn!(
                    providers = registry.len(),
                    "No provider enabled; model tools are unavailable, file tools still work"
                );
                (None, None)
            }
            Err(e) => return Err(e).context("Router refused to start"),
        };

        let fs = SafeFs::new(
            &config.app.workspace_root,
            config.tools.max_file_bytes,
            &config.tools.blocked_extensions,
        )
        .with_context(|| {
            format!(
                "Failed to prepare workspace {}",
                config.app.workspace_root.display()
            )
        })?;
        let limits = FacadeLimits {
            max_image_bytes: config.tools.max_image_bytes,
            max_context_entries: config.memory.max_context_entries,
        };
        let facade = Arc::new(match &router {
            Some(router) => ToolFacade::new(Arc::clone(router), fs, limits),
            None => ToolFacade::without_router(memory, fs, limits),
        });

        tracing::info!(
            providers = registry.len(),
            enabled = registry.enabled_count(),
            "Engine ready"
        );
        Ok(Engine {
            router,
            monitor,
            facade,
        })
    }
}
