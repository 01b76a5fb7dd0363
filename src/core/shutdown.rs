//! 优雅关闭
//!
//! Ctrl+C / SIGTERM / `/quit` 触发同一个 CancellationToken：
//! - 后台巡检任务收到取消后退出循环
//! - 正在进行的 dispatch 不再推进到下一个候选
//! - 退出前并发等待已注册的收尾任务，整体受同一个宽限期约束

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C、quit 命令或输入结束
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：只记录第一次触发的原因
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 交给后台任务 / dispatch 的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；已触发过则忽略并返回 false
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            return false;
        }
        tracing::info!(reason = ?reason, "Shutdown requested");
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 都转成 shutdown 调用
    pub fn install_signal_handlers(&self) {
        let on_ctrl_c = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let on_term = self.clone();
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                        on_term.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
                }
            });
        }
    }
}

/// 关闭时需要执行的收尾任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &str;
}

/// 等待一个后台任务结束（如自愈巡检循环）
pub struct BackgroundTaskCleanup {
    name: String,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTaskCleanup {
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for BackgroundTaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 收尾结果汇总
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

/// 关闭协调器：持有关闭信号与收尾任务
pub struct ShutdownCoordinator {
    manager: ShutdownManager,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: ShutdownManager) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub fn manager(&self) -> &ShutdownManager {
        &self.manager
    }

    /// 并发执行全部收尾任务；每个任务最多等待 grace
    pub async fn run_cleanup(&self) -> CleanupReport {
        let grace = self.grace;
        let outcomes = join_all(self.tasks.iter().map(|task| async move {
            let result = tokio::time::timeout(grace, task.cleanup()).await;
            (task.name().to_string(), result)
        }))
        .await;

        let mut report = CleanupReport::default();
        for (name, result) in outcomes {
            match result {
                Ok(Ok(())) => report.completed.push(name),
                Ok(Err(e)) => {
                    tracing::warn!(task = %name, error = %e, "Cleanup task failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = %name, grace_ms = grace.as_millis() as u64, "Cleanup task timed out");
                    report.timed_out.push(name);
                }
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "Shutdown cleanup finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(manager.shutdown(ShutdownReason::Signal));
        assert!(!manager.shutdown(ShutdownReason::UserInitiated));
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(&ShutdownReason::Signal));
    }

    #[tokio::test]
    async fn test_cleanup_waits_for_background_task() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        let mut coordinator = ShutdownCoordinator::new(manager.clone());
        coordinator.register(BackgroundTaskCleanup::new("monitor", handle));
        manager.shutdown(ShutdownReason::UserInitiated);

        let report = coordinator.run_cleanup().await;
        assert_eq!(report.completed, vec!["monitor".to_string()]);
    }

    #[tokio::test]
    async fn test_stuck_task_times_out() {
        let handle = tokio::spawn(std::future::pending::<()>());
        let mut coordinator =
            ShutdownCoordinator::new(ShutdownManager::new()).with_grace(Duration::from_millis(20));
        coordinator.register(BackgroundTaskCleanup::new("stuck", handle));

        let report = coordinator.run_cleanup().await;
        assert_eq!(report.timed_out, vec!["stuck".to_string()]);
    }
}
