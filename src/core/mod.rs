//! 核心层：用户上下文、错误分类与恢复、优雅关闭

pub mod context;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use context::{UserContext, UserContextBuilder};
pub use error::{ApiaryError, StageError, TransportError};
pub use recovery::{Disposition, RecoveryEngine};
pub use shutdown::{
    EngineFactoryCleanup, PresenceCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
