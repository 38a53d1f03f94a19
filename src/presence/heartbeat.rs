//! 后台心跳循环：定时 ping + 健康检查，定时清理陈旧连接

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::presence::{CleanupReport, PresenceManager};

/// 运行心跳循环直到 cancel 被触发
pub async fn run_heartbeat(presence: Arc<PresenceManager>, cancel: CancellationToken) {
    let sweeper = presence.clone();
    run_heartbeat_with(presence, cancel, move || {
        let presence = sweeper.clone();
        async move { presence.cleanup_stale_data().await }
    })
    .await
}

/// 同 `run_heartbeat`，清理节拍改为调用 `sweep`（上层据此释放被移除连接的会话）
pub async fn run_heartbeat_with<F, Fut>(presence: Arc<PresenceManager>, cancel: CancellationToken, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CleanupReport>,
{
    let config = presence.config().clone();
    let mut heartbeat_timer = tokio::time::interval(config.heartbeat_interval);
    heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup_timer = tokio::time::interval(config.cleanup_interval);
    cleanup_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // interval 的首个 tick 立即触发，跳过
    heartbeat_timer.tick().await;
    cleanup_timer.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Heartbeat loop stopped");
                break;
            }
            _ = heartbeat_timer.tick() => {
                let report = presence.heartbeat_round().await;
                tracing::debug!(
                    pinged = report.pinged,
                    failed = report.failed,
                    dead = report.dead,
                    "Heartbeat round finished"
                );
            }
            _ = cleanup_timer.tick() => {
                let report = sweep().await;
                if report.removed > 0 {
                    tracing::debug!(removed = report.removed, "Stale sweep finished");
                }
            }
        }
    }
}

pub fn spawn_heartbeat(presence: Arc<PresenceManager>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run_heartbeat(presence, cancel))
}
