//! 连接存活管理
//!
//! 单把 `tokio::sync::RwLock` 保护注册表；通道写入（ping / 关闭）一律在锁外进行。
//! 传输错误只转化为存活状态变化，不向上传播。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::PresenceSection;
use crate::core::ApiaryError;
use crate::gateway::{CommunicationChannel, GatewayMessage};
use crate::presence::{ConnectionBinding, ConnectionId, ConnectionRecord, ConnectionSnapshot};

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_missed_heartbeats: u32,
    pub cleanup_interval: Duration,
    pub dead_grace: Duration,
    pub max_connections_per_user: usize,
    pub eviction_timeout: Duration,
    pub eviction_poll: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::from(&PresenceSection::default())
    }
}

impl From<&PresenceSection> for PresenceConfig {
    fn from(section: &PresenceSection) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(section.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(section.heartbeat_timeout_secs),
            max_missed_heartbeats: section.max_missed_heartbeats.max(1),
            cleanup_interval: Duration::from_secs(section.cleanup_interval_secs.max(1)),
            dead_grace: Duration::from_secs(section.dead_grace_secs),
            max_connections_per_user: section.max_connections_per_user,
            eviction_timeout: Duration::from_secs(section.eviction_timeout_secs),
            eviction_poll: Duration::from_millis(section.eviction_poll_ms.max(1)),
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct PresenceCounters {
    pub registered: AtomicU64,
    pub unregistered: AtomicU64,
    pub pings_sent: AtomicU64,
    pub ping_failures: AtomicU64,
    pub pongs: AtomicU64,
    pub timeouts: AtomicU64,
    pub deaths: AtomicU64,
    pub resurrections: AtomicU64,
    pub cleaned: AtomicU64,
    pub clamped: AtomicU64,
    pub evicted: AtomicU64,
    pub rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 存活统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceStats {
    pub total_connections: usize,
    pub alive_connections: usize,
    pub dead_connections: usize,
    pub registered: u64,
    pub unregistered: u64,
    pub pings_sent: u64,
    pub ping_failures: u64,
    pub pongs_received: u64,
    pub heartbeat_timeouts: u64,
    pub deaths: u64,
    pub resurrections: u64,
    pub cleaned_up: u64,
    pub clamped_timestamps: u64,
    pub evicted: u64,
    pub admissions_rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Updated,
    /// 原为 DEAD，已复活
    Resurrected,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    /// 被钳回当前时间的未来时间戳数量
    pub clamped: usize,
    /// 被移除的连接，供上层释放对应会话
    pub removed_ids: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub failed: usize,
    pub dead: usize,
}

pub struct PresenceManager {
    pub(super) config: PresenceConfig,
    pub(super) connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
    pub(super) counters: PresenceCounters,
}

impl PresenceManager {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            counters: PresenceCounters::default(),
        }
    }

    pub fn from_config(section: &PresenceSection) -> Self {
        Self::new(PresenceConfig::from(section))
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// 注册连接（不做上限检查，见 `admit_connection`）；同 id 的旧记录被替换，其通道关闭
    pub async fn register_connection(
        &self,
        id: ConnectionId,
        binding: ConnectionBinding,
        channel: Option<Arc<dyn CommunicationChannel>>,
    ) {
        self.register_connection_at(id, binding, channel, Utc::now()).await
    }

    pub async fn register_connection_at(
        &self,
        id: ConnectionId,
        binding: ConnectionBinding,
        channel: Option<Arc<dyn CommunicationChannel>>,
        now: DateTime<Utc>,
    ) {
        let replaced = {
            let mut connections = self.connections.write().await;
            let record = ConnectionRecord::new(id.clone(), binding, channel, now);
            connections.insert(id.clone(), record)
        };
        bump(&self.counters.registered);
        tracing::debug!(connection_id = %id, "Connection registered");

        if let Some(old) = replaced.and_then(|r| r.channel) {
            old.close().await;
        }
    }

    /// 终态：移除记录并关闭通道
    pub async fn unregister_connection(&self, id: &str) -> Option<ConnectionSnapshot> {
        let removed = self.connections.write().await.remove(id)?;
        bump(&self.counters.unregistered);
        tracing::debug!(connection_id = id, user_id = removed.user_id(), "Connection unregistered");

        let snapshot = removed.snapshot();
        if let Some(channel) = removed.channel {
            channel.close().await;
        }
        Some(snapshot)
    }

    pub async fn bind_thread(&self, id: &str, thread_id: impl Into<String>) -> Result<(), ApiaryError> {
        let mut connections = self.connections.write().await;
        let record = connections
            .get_mut(id)
            .ok_or_else(|| ApiaryError::ConnectionNotFound(id.to_string()))?;
        record.binding.thread_id = Some(thread_id.into());
        Ok(())
    }

    /// 经给定通道发送 ping；写入失败则判死并返回 false
    pub async fn send_ping(&self, id: &str, channel: &dyn CommunicationChannel) -> bool {
        if !self.connections.read().await.contains_key(id) {
            return false;
        }

        let sent = channel.send(&GatewayMessage::ping()).await;
        let now = Utc::now();
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(id) else {
            return false;
        };

        match sent {
            Ok(()) => {
                record.on_ping_sent(now);
                bump(&self.counters.pings_sent);
                true
            }
            Err(e) => {
                let was_alive = record.is_alive;
                record.on_ping_failed(now);
                bump(&self.counters.ping_failures);
                if was_alive {
                    bump(&self.counters.deaths);
                }
                tracing::debug!(connection_id = id, error = %e, "Ping failed, connection marked dead");
                false
            }
        }
    }

    /// 通过连接自身的通道发送 ping
    pub async fn ping_connection(&self, id: &str) -> bool {
        let channel = self
            .connections
            .read()
            .await
            .get(id)
            .and_then(|r| r.channel.clone());
        match channel {
            Some(channel) => self.send_ping(id, channel.as_ref()).await,
            None => false,
        }
    }

    pub async fn record_pong(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(id) else {
            return false;
        };
        let was_dead = !record.is_alive;
        record.on_pong(Utc::now());
        bump(&self.counters.pongs);
        if was_dead {
            bump(&self.counters.resurrections);
        }
        true
    }

    pub async fn record_activity(&self, id: &str) -> ActivityOutcome {
        self.record_activity_at(id, Utc::now()).await
    }

    /// 记录指定时刻的活动；DEAD 连接在被清理前可借此复活
    pub async fn record_activity_at(&self, id: &str, at: DateTime<Utc>) -> ActivityOutcome {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(id) else {
            return ActivityOutcome::Unknown;
        };
        if record.on_activity(at) {
            bump(&self.counters.resurrections);
            tracing::info!(connection_id = id, user_id = record.user_id(), "Connection resurrected");
            ActivityOutcome::Resurrected
        } else {
            ActivityOutcome::Updated
        }
    }

    pub async fn check_connection_health(&self, id: &str) -> bool {
        self.check_connection_health_at(id, Utc::now()).await
    }

    /// 返回检查后的存活标志；未知连接视为不存活
    pub async fn check_connection_health_at(&self, id: &str, now: DateTime<Utc>) -> bool {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(id) else {
            return false;
        };
        self.apply_health_check(record, now)
    }

    fn apply_health_check(&self, record: &mut ConnectionRecord, now: DateTime<Utc>) -> bool {
        let was_alive = record.is_alive;
        let missed_before = record.missed_heartbeats;
        let alive = record.on_health_check(
            now,
            self.config.heartbeat_timeout,
            self.config.max_missed_heartbeats,
        );
        if record.missed_heartbeats > missed_before {
            bump(&self.counters.timeouts);
        }
        if was_alive && !alive {
            bump(&self.counters.deaths);
            tracing::debug!(
                connection_id = %record.id,
                missed = record.missed_heartbeats,
                "Connection marked dead after missed heartbeats"
            );
        }
        alive
    }

    /// 直接判死（例如事件推送失败）
    pub async fn mark_dead(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(id) else {
            return false;
        };
        if record.is_alive {
            bump(&self.counters.deaths);
        }
        record.mark_dead(Utc::now());
        true
    }

    pub async fn cleanup_stale_data(&self) -> CleanupReport {
        self.cleanup_stale_data_at(Utc::now()).await
    }

    /// 移除超过宽限期的 DEAD 连接，并把未来时间戳钳回 now
    pub async fn cleanup_stale_data_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let removed: Vec<ConnectionRecord> = {
            let mut connections = self.connections.write().await;
            for record in connections.values_mut() {
                if record.last_activity > now {
                    record.last_activity = now;
                    report.clamped += 1;
                }
            }
            let stale: Vec<ConnectionId> = connections
                .values()
                .filter(|r| r.is_stale(now, self.config.dead_grace))
                .map(|r| r.id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| connections.remove(id))
                .collect()
        };
        report.removed = removed.len();
        report.removed_ids = removed.iter().map(|r| r.id.clone()).collect();

        self.counters
            .cleaned
            .fetch_add(report.removed as u64, Ordering::Relaxed);
        self.counters
            .clamped
            .fetch_add(report.clamped as u64, Ordering::Relaxed);
        if report.removed > 0 || report.clamped > 0 {
            tracing::info!(
                removed = report.removed,
                clamped = report.clamped,
                "Stale presence data cleaned up"
            );
        }

        for channel in removed.into_iter().filter_map(|r| r.channel) {
            channel.close().await;
        }
        report
    }

    /// 一轮心跳：向所有存活连接发 ping，然后检查健康度
    pub async fn heartbeat_round(&self) -> HeartbeatReport {
        let targets: Vec<(ConnectionId, Arc<dyn CommunicationChannel>)> = self
            .connections
            .read()
            .await
            .values()
            .filter(|r| r.is_alive)
            .filter_map(|r| r.channel.clone().map(|c| (r.id.clone(), c)))
            .collect();

        let mut report = HeartbeatReport::default();
        let pings = targets
            .iter()
            .map(|(id, channel)| self.send_ping(id.as_str(), channel.as_ref()));
        for ok in futures_util::future::join_all(pings).await {
            report.pinged += 1;
            if !ok {
                report.failed += 1;
            }
        }

        let now = Utc::now();
        let mut connections = self.connections.write().await;
        for record in connections.values_mut() {
            if !self.apply_health_check(record, now) {
                report.dead += 1;
            }
        }
        report
    }

    pub async fn get_connection(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.connections.read().await.get(id).map(ConnectionRecord::snapshot)
    }

    pub async fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.user_id() == user_id)
            .map(ConnectionRecord::snapshot)
            .collect()
    }

    pub async fn connections_for_thread(&self, user_id: &str, thread_id: &str) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.user_id() == user_id && r.thread_id() == Some(thread_id))
            .map(ConnectionRecord::snapshot)
            .collect()
    }

    /// 该线程最近活跃的存活连接及其通道
    pub async fn live_channel_for_thread(
        &self,
        user_id: &str,
        thread_id: &str,
    ) -> Option<(ConnectionId, Arc<dyn CommunicationChannel>)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.is_alive && r.user_id() == user_id && r.thread_id() == Some(thread_id))
            .filter_map(|r| r.channel.clone().map(|c| (r.id.clone(), r.last_activity, c)))
            .max_by_key(|(_, at, _)| *at)
            .map(|(id, _, channel)| (id, channel))
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 关闭并移除全部连接（关闭流程使用）
    pub async fn clear_all(&self) -> usize {
        let drained: Vec<ConnectionRecord> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        let count = drained.len();
        for channel in drained.into_iter().filter_map(|r| r.channel) {
            channel.close().await;
        }
        count
    }

    pub async fn stats(&self) -> PresenceStats {
        let (total, alive) = {
            let connections = self.connections.read().await;
            (
                connections.len(),
                connections.values().filter(|r| r.is_alive).count(),
            )
        };
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PresenceStats {
            total_connections: total,
            alive_connections: alive,
            dead_connections: total - alive,
            registered: load(&self.counters.registered),
            unregistered: load(&self.counters.unregistered),
            pings_sent: load(&self.counters.pings_sent),
            ping_failures: load(&self.counters.ping_failures),
            pongs_received: load(&self.counters.pongs),
            heartbeat_timeouts: load(&self.counters.timeouts),
            deaths: load(&self.counters.deaths),
            resurrections: load(&self.counters.resurrections),
            cleaned_up: load(&self.counters.cleaned),
            clamped_timestamps: load(&self.counters.clamped),
            evicted: load(&self.counters.evicted),
            admissions_rejected: load(&self.counters.rejected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryChannel;

    fn manager() -> PresenceManager {
        PresenceManager::new(PresenceConfig {
            heartbeat_timeout: Duration::from_secs(60),
            max_missed_heartbeats: 2,
            dead_grace: Duration::from_secs(120),
            ..PresenceConfig::default()
        })
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let presence = manager();
        let channel = Arc::new(MemoryChannel::new("c1"));
        presence
            .register_connection(
                ConnectionId::from("c1"),
                ConnectionBinding::new("alice").with_thread("t1"),
                Some(channel.clone()),
            )
            .await;

        let snap = presence.get_connection("c1").await.unwrap();
        assert!(snap.is_alive);
        assert_eq!(snap.thread_id.as_deref(), Some("t1"));

        assert!(presence.unregister_connection("c1").await.is_some());
        assert!(presence.get_connection("c1").await.is_none());
        assert!(channel.is_closed());
        assert!(presence.unregister_connection("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_send_ping_failure_marks_dead() {
        let presence = manager();
        let channel = MemoryChannel::new("c1");
        presence
            .register_connection(ConnectionId::from("c1"), ConnectionBinding::new("alice"), None)
            .await;

        assert!(presence.send_ping("c1", &channel).await);
        assert!(presence.get_connection("c1").await.unwrap().ping_outstanding_since.is_some());

        channel.close().await;
        assert!(!presence.send_ping("c1", &channel).await);
        let snap = presence.get_connection("c1").await.unwrap();
        assert!(!snap.is_alive);

        let stats = presence.stats().await;
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(stats.ping_failures, 1);
        assert_eq!(stats.dead_connections, 1);
    }

    #[tokio::test]
    async fn test_health_check_at_kills_after_max_missed() {
        let presence = manager();
        let t0 = Utc::now();
        presence
            .register_connection_at(ConnectionId::from("c1"), ConnectionBinding::new("alice"), None, t0)
            .await;
        let later = t0 + chrono::Duration::seconds(90);

        assert!(presence.check_connection_health_at("c1", later).await);
        assert!(!presence.check_connection_health_at("c1", later).await);
        assert_eq!(presence.stats().await.heartbeat_timeouts, 2);
        assert!(!presence.check_connection_health_at("missing", later).await);
    }

    #[tokio::test]
    async fn test_cleanup_clamps_future_timestamps() {
        let presence = manager();
        let now = Utc::now();
        presence
            .register_connection_at(ConnectionId::from("c1"), ConnectionBinding::new("alice"), None, now)
            .await;
        presence
            .record_activity_at("c1", now + chrono::Duration::hours(2))
            .await;

        let report = presence.cleanup_stale_data_at(now).await;
        assert_eq!(
            report,
            CleanupReport {
                removed: 0,
                clamped: 1,
                removed_ids: Vec::new()
            }
        );
        assert_eq!(presence.get_connection("c1").await.unwrap().last_activity, now);
    }

    #[tokio::test]
    async fn test_live_channel_prefers_most_recent() {
        let presence = manager();
        let t0 = Utc::now();
        let old = Arc::new(MemoryChannel::new("old"));
        let new = Arc::new(MemoryChannel::new("new"));
        presence
            .register_connection_at(
                ConnectionId::from("old"),
                ConnectionBinding::new("alice").with_thread("t1"),
                Some(old),
                t0,
            )
            .await;
        presence
            .register_connection_at(
                ConnectionId::from("new"),
                ConnectionBinding::new("alice").with_thread("t1"),
                Some(new),
                t0 + chrono::Duration::seconds(1),
            )
            .await;

        let (id, _) = presence.live_channel_for_thread("alice", "t1").await.unwrap();
        assert_eq!(id.as_str(), "new");

        presence.mark_dead("new").await;
        let (id, _) = presence.live_channel_for_thread("alice", "t1").await.unwrap();
        assert_eq!(id.as_str(), "old");
        assert!(presence.live_channel_for_thread("bob", "t1").await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_round_pings_live_connections() {
        let presence = manager();
        let ok = Arc::new(MemoryChannel::new("ok"));
        let broken = Arc::new(MemoryChannel::new("broken"));
        broken.close().await;
        presence
            .register_connection(ConnectionId::from("ok"), ConnectionBinding::new("alice"), Some(ok.clone()))
            .await;
        presence
            .register_connection(ConnectionId::from("broken"), ConnectionBinding::new("bob"), Some(broken))
            .await;

        let report = presence.heartbeat_round().await;
        assert_eq!(report.pinged, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead, 1);
        assert_eq!(ok.kinds(), vec!["ping"]);
    }
}
