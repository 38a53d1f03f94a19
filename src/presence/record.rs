//! 连接记录与存活状态转移
//!
//! 转移函数都是纯同步方法，由 PresenceManager 在写锁内调用。

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gateway::CommunicationChannel;

/// 连接标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 连接归属：用户与（可选）对话线程；线程↔连接关系只存在这里
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionBinding {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ConnectionBinding {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// 存活状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 已注册，尚未发出 ping
    Registered,
    /// ping 已发出，等待 pong
    Active,
    /// 最近一次 pong / 活动正常
    Healthy,
    /// 错过心跳
    Warning,
    /// 超时或写入失败，等待复活或清理
    Dead,
}

pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub binding: ConnectionBinding,
    pub state: ConnectionState,
    pub is_alive: bool,
    pub last_activity: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub ping_outstanding_since: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub died_at: Option<DateTime<Utc>>,
    pub resurrections: u64,
    pub channel: Option<Arc<dyn CommunicationChannel>>,
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    to.signed_duration_since(from).to_std().unwrap_or_default()
}

impl ConnectionRecord {
    pub fn new(
        id: ConnectionId,
        binding: ConnectionBinding,
        channel: Option<Arc<dyn CommunicationChannel>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            binding,
            state: ConnectionState::Registered,
            is_alive: true,
            last_activity: now,
            missed_heartbeats: 0,
            ping_outstanding_since: None,
            registered_at: now,
            died_at: None,
            resurrections: 0,
            channel,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.binding.user_id
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.binding.thread_id.as_deref()
    }

    pub fn on_ping_sent(&mut self, now: DateTime<Utc>) {
        if self.state != ConnectionState::Dead {
            self.ping_outstanding_since = Some(now);
            if self.state != ConnectionState::Warning {
                self.state = ConnectionState::Active;
            }
        }
    }

    pub fn on_ping_failed(&mut self, now: DateTime<Utc>) {
        self.mark_dead(now);
    }

    pub fn on_pong(&mut self, now: DateTime<Utc>) {
        if self.state == ConnectionState::Dead {
            self.resurrections += 1;
            self.died_at = None;
        }
        self.ping_outstanding_since = None;
        self.missed_heartbeats = 0;
        self.is_alive = true;
        self.state = ConnectionState::Healthy;
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// 记录一次活动；若原为 DEAD 则复活并返回 true
    pub fn on_activity(&mut self, at: DateTime<Utc>) -> bool {
        let resurrected = !self.is_alive;
        if resurrected {
            self.resurrections += 1;
            self.died_at = None;
        }
        self.is_alive = true;
        self.missed_heartbeats = 0;
        self.state = ConnectionState::Healthy;
        if at > self.last_activity {
            self.last_activity = at;
        }
        resurrected
    }

    /// 超过 timeout 未活动则累计一次错过；达到 max_missed 判死。返回当前存活标志
    pub fn on_health_check(&mut self, now: DateTime<Utc>, timeout: Duration, max_missed: u32) -> bool {
        if !self.is_alive {
            return false;
        }
        if elapsed(self.last_activity, now) > timeout {
            self.missed_heartbeats = self.missed_heartbeats.saturating_add(1);
            if self.missed_heartbeats >= max_missed.max(1) {
                self.mark_dead(now);
            } else {
                self.state = ConnectionState::Warning;
            }
        }
        self.is_alive
    }

    pub fn mark_dead(&mut self, now: DateTime<Utc>) {
        if self.state != ConnectionState::Dead {
            self.died_at = Some(now);
        }
        self.is_alive = false;
        self.state = ConnectionState::Dead;
        self.ping_outstanding_since = None;
    }

    /// DEAD 且最后活动早于宽限窗口
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        !self.is_alive && elapsed(self.last_activity, now) > grace
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_activity, now)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: self.id.clone(),
            user_id: self.binding.user_id.clone(),
            thread_id: self.binding.thread_id.clone(),
            state: self.state,
            is_alive: self.is_alive,
            last_activity: self.last_activity,
            missed_heartbeats: self.missed_heartbeats,
            ping_outstanding_since: self.ping_outstanding_since,
            registered_at: self.registered_at,
            died_at: self.died_at,
            resurrections: self.resurrections,
        }
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("binding", &self.binding)
            .field("state", &self.state)
            .field("is_alive", &self.is_alive)
            .field("missed_heartbeats", &self.missed_heartbeats)
            .finish_non_exhaustive()
    }
}

/// 对外暴露的只读快照（不含通道）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub state: ConnectionState,
    pub is_alive: bool,
    pub last_activity: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub ping_outstanding_since: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub died_at: Option<DateTime<Utc>>,
    pub resurrections: u64,
}
