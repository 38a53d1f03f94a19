//! 执行引擎与引擎工厂：每个用户一个隔离实例，无全局默认引擎

pub(crate) mod execution;
mod factory;

pub use execution::{EngineStats, EngineStatsSnapshot, ExecutionEngine, RunState, RunStatus};
pub use factory::{
    EnginePolicy, ExecutionEngineFactory, ExecutionEngineFactoryBuilder, FactoryConfig, FactoryMetrics,
};
