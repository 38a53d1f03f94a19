//! 每用户连接上限与限时紧急回收
//!
//! 到达上限时按「DEAD → WARNING → 陈旧」顺序回收最不健康的连接，健康连接从不被驱逐；
//! 整个接纳过程受 `eviction_timeout` 约束，超时以 Capacity 错误快速失败。

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::core::ApiaryError;
use crate::gateway::CommunicationChannel;
use crate::presence::{ConnectionBinding, ConnectionId, ConnectionRecord, ConnectionState, PresenceManager};

/// 接纳结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub connection_id: ConnectionId,
    /// 为腾出名额被驱逐的连接
    pub evicted: Vec<ConnectionId>,
    pub waited: Duration,
}

/// 回收优先级，越小越先被驱逐；None 表示不可驱逐
fn eviction_rank(record: &ConnectionRecord, now: DateTime<Utc>, stale_after: Duration) -> Option<u8> {
    let ping_overdue = record
        .ping_outstanding_since
        .map(|since| now.signed_duration_since(since).to_std().unwrap_or_default() > stale_after)
        .unwrap_or(false);
    match record.state {
        ConnectionState::Dead => Some(0),
        ConnectionState::Warning => Some(1),
        _ if ping_overdue || record.idle_for(now) > stale_after => Some(2),
        _ => None,
    }
}

impl PresenceManager {
    /// 在上限内注册连接；必要时紧急回收该用户最不健康的连接
    pub async fn admit_connection(
        &self,
        id: ConnectionId,
        binding: ConnectionBinding,
        channel: Option<Arc<dyn CommunicationChannel>>,
    ) -> Result<Admission, ApiaryError> {
        let cap = self.config.max_connections_per_user;
        let user_id = binding.user_id.clone();
        if cap == 0 {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ApiaryError::capacity(user_id, "connections are disabled (cap is 0)"));
        }

        let budget = self.config.eviction_timeout;
        match tokio::time::timeout(budget, self.admit_loop(id, binding, channel, cap)).await {
            Ok(admission) => Ok(admission),
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    user_id = %user_id,
                    cap,
                    budget_ms = budget.as_millis() as u64,
                    "Connection cap not satisfiable within eviction budget"
                );
                Err(ApiaryError::capacity(
                    user_id,
                    format!(
                        "{cap} healthy connections already open; no slot freed within {}ms",
                        budget.as_millis()
                    ),
                ))
            }
        }
    }

    async fn admit_loop(
        &self,
        id: ConnectionId,
        binding: ConnectionBinding,
        channel: Option<Arc<dyn CommunicationChannel>>,
        cap: usize,
    ) -> Admission {
        let started = Instant::now();
        let stale_after = self.config.heartbeat_timeout;
        let mut evicted = Vec::new();

        loop {
            let now = Utc::now();
            let victims: Vec<ConnectionRecord> = {
                let mut connections = self.connections.write().await;
                let own_count = connections
                    .values()
                    .filter(|r| r.user_id() == binding.user_id && r.id != id)
                    .count();

                if own_count < cap {
                    let record = ConnectionRecord::new(id.clone(), binding.clone(), channel.clone(), now);
                    let replaced = connections.insert(id.clone(), record);
                    drop(connections);
                    self.counters.registered.fetch_add(1, Ordering::Relaxed);
                    if let Some(old) = replaced.and_then(|r| r.channel) {
                        old.close().await;
                    }
                    return Admission {
                        connection_id: id,
                        evicted,
                        waited: started.elapsed(),
                    };
                }

                let mut own: Vec<&ConnectionRecord> = connections
                    .values()
                    .filter(|r| r.user_id() == binding.user_id && r.id != id)
                    .collect();
                own.sort_by(|a, b| {
                    eviction_rank(a, now, stale_after)
                        .cmp(&eviction_rank(b, now, stale_after))
                        .then(b.missed_heartbeats.cmp(&a.missed_heartbeats))
                        .then(a.last_activity.cmp(&b.last_activity))
                });
                let needed = own.len() + 1 - cap;
                let chosen: Vec<ConnectionId> = own
                    .iter()
                    .filter(|r| eviction_rank(r, now, stale_after).is_some())
                    .take(needed)
                    .map(|r| r.id.clone())
                    .collect();
                drop(own);

                chosen.iter().filter_map(|v| connections.remove(v)).collect()
            };

            if victims.is_empty() {
                tokio::time::sleep(self.config.eviction_poll).await;
                continue;
            }

            for record in victims {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    connection_id = %record.id,
                    user_id = record.user_id(),
                    state = ?record.state,
                    "Connection evicted to honour per-user cap"
                );
                evicted.push(record.id.clone());
                if let Some(channel) = record.channel {
                    channel.close().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryChannel;
    use crate::presence::PresenceConfig;

    fn manager(cap: usize, budget: Duration) -> PresenceManager {
        PresenceManager::new(PresenceConfig {
            max_connections_per_user: cap,
            eviction_timeout: budget,
            eviction_poll: Duration::from_millis(10),
            ..PresenceConfig::default()
        })
    }

    async fn admit(presence: &PresenceManager, id: &str, user: &str) -> Result<Admission, ApiaryError> {
        presence
            .admit_connection(ConnectionId::from(id), ConnectionBinding::new(user), None)
            .await
    }

    #[tokio::test]
    async fn test_admits_under_cap() {
        let presence = manager(2, Duration::from_millis(100));
        assert!(admit(&presence, "a1", "alice").await.unwrap().evicted.is_empty());
        assert!(admit(&presence, "a2", "alice").await.is_ok());
        // 其他用户不受影响
        assert!(admit(&presence, "b1", "bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_evicts_dead_before_warning() {
        let presence = manager(2, Duration::from_millis(200));
        admit(&presence, "a1", "alice").await.unwrap();
        admit(&presence, "a2", "alice").await.unwrap();
        presence.connections.write().await.get_mut("a1").unwrap().state = ConnectionState::Warning;
        presence.mark_dead("a2").await;

        let admission = admit(&presence, "a3", "alice").await.unwrap();
        assert_eq!(admission.evicted, vec![ConnectionId::from("a2")]);
        assert!(presence.get_connection("a1").await.is_some());
        assert_eq!(presence.stats().await.evicted, 1);
    }

    #[tokio::test]
    async fn test_healthy_connections_are_never_evicted() {
        let presence = manager(1, Duration::from_millis(80));
        let channel = Arc::new(MemoryChannel::new("a1"));
        presence
            .admit_connection(ConnectionId::from("a1"), ConnectionBinding::new("alice"), Some(channel.clone()))
            .await
            .unwrap();

        let started = Instant::now();
        let err = admit(&presence, "a2", "alice").await.unwrap_err();
        assert!(matches!(err, ApiaryError::Capacity { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!channel.is_closed());
        assert_eq!(presence.stats().await.admissions_rejected, 1);
    }

    #[tokio::test]
    async fn test_zero_cap_rejects_immediately() {
        let presence = manager(0, Duration::from_secs(30));
        let started = Instant::now();
        assert!(admit(&presence, "a1", "alice").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_waits_for_connection_to_die() {
        let presence = Arc::new(manager(1, Duration::from_secs(5)));
        admit(&presence, "a1", "alice").await.unwrap();

        let killer = {
            let presence = presence.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                presence.mark_dead("a1").await;
            })
        };

        let admission = admit(&presence, "a2", "alice").await.unwrap();
        killer.await.unwrap();
        assert_eq!(admission.evicted, vec![ConnectionId::from("a1")]);
        assert!(admission.waited >= Duration::from_millis(40));
    }
}
