//! 优雅关闭
//!
//! 关闭顺序：先停心跳与回收任务（token 取消），再释放全部执行引擎，最后清空在线表并关闭通道。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::engine::ExecutionEngineFactory;
use crate::presence::PresenceManager;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 由宿主代码主动触发
    Requested,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根 token；后台任务应持有其 child_token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装 Ctrl+C / SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理步骤
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理，每步各自受超时约束
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            step_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 返回失败或超时的步骤数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(tasks = self.cleanup_tasks.len(), "Running cleanup tasks");
        let mut failures = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.step_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "Cleanup task completed"),
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(task = name, error = %e, "Cleanup task failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(
                        task = name,
                        timeout_ms = self.step_timeout.as_millis() as u64,
                        "Cleanup task timed out"
                    );
                }
            }
        }
        failures
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 释放工厂持有的全部执行引擎
pub struct EngineFactoryCleanup {
    factory: Arc<ExecutionEngineFactory>,
}

impl EngineFactoryCleanup {
    pub fn new(factory: Arc<ExecutionEngineFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for EngineFactoryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let released = self.factory.cleanup_all().await;
        tracing::info!(released, "Execution engines released");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EngineFactory"
    }
}

/// 关闭所有连接通道并清空在线表
pub struct PresenceCleanup {
    presence: Arc<PresenceManager>,
}

impl PresenceCleanup {
    pub fn new(presence: Arc<PresenceManager>) -> Self {
        Self { presence }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for PresenceCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let dropped = self.presence.clear_all().await;
        tracing::info!(dropped, "Presence table cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Presence"
    }
}

/// 运行 app 直到其结束或收到关闭信号，随后执行 cleanup
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let child = token.child_token();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Requested);
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_subscribers_see_reason() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::FatalError("disk".into()));
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::FatalError("disk".into()));
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct HangingCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for HangingCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Hanging"
        }
    }

    #[tokio::test]
    async fn test_coordinator_bounds_each_step() {
        let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_timeout(Duration::from_millis(20));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(HangingCleanup);
        coordinator.register(FlagCleanup { called: called.clone() });

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_presence_cleanup_clears_table() {
        use crate::presence::{ConnectionBinding, ConnectionId};

        let presence = Arc::new(PresenceManager::new(Default::default()));
        presence
            .register_connection(ConnectionId::from("c1"), ConnectionBinding::new("alice"), None)
            .await;
        PresenceCleanup::new(presence.clone()).cleanup().await.unwrap();
        assert_eq!(presence.connection_count().await, 0);
    }
}
