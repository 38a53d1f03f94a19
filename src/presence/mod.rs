//! 连接存活（presence）管理：心跳、死亡判定与复活、每用户上限与紧急回收、陈旧数据清理

mod eviction;
mod heartbeat;
mod manager;
mod record;
mod routing;

pub use eviction::Admission;
pub use heartbeat::{run_heartbeat, run_heartbeat_with, spawn_heartbeat};
pub use manager::{
    ActivityOutcome, CleanupReport, HeartbeatReport, PresenceConfig, PresenceManager, PresenceStats,
};
pub use record::{ConnectionBinding, ConnectionId, ConnectionRecord, ConnectionSnapshot, ConnectionState};
pub use routing::{PresenceChannelSource, ThreadChannel};
