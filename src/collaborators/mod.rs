//! 外部协作者契约：认证、持久化、指标，以及各自的进程内实现

pub mod auth;
pub mod metrics;
pub mod persistence;

pub use auth::{AuthRequest, AuthenticationProvider, DevAuthenticator};
pub use metrics::{MemoryMetricsSink, MetricsSink, NoopMetricsSink, TracingMetricsSink};
pub use persistence::{MemoryPersistence, PersistenceProvider, RunRecord, StoredMessage};
