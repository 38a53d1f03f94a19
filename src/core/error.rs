//! 错误分类与传播策略
//!
//! 只有 Configuration / Capacity / InvalidContext / Unauthenticated 允许传播到请求边界；
//! 传输错误转换为连接存活状态变化，阶段错误与报告失败在编排层内被吸收为降级结果。

use thiserror::Error;

use crate::orchestration::Stage;

/// 通道写入失败（推送事件 / 发送 ping）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Channel buffer full: {0}")]
    Full(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    /// 线程当前没有任何存活的物理连接
    #[error("No live connection for thread {0}")]
    NoConnection(String),
}

/// 单个阶段执行失败：被捕获并记录到该阶段的结果槽，不中断计划
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("Stage {stage} failed: {message}")]
    Failed { stage: Stage, message: String },

    #[error("Stage {0} timed out after {1}s")]
    Timeout(Stage, u64),

    #[error("Stage {0} cancelled")]
    Cancelled(Stage),

    #[error("No handler registered for stage {0}")]
    MissingHandler(Stage),

    #[error("Stage {0} panicked")]
    Panicked(Stage),

    #[error("Stage {stage} produced invalid output: {message}")]
    InvalidOutput { stage: Stage, message: String },
}

impl StageError {
    pub fn failed(stage: Stage, message: impl Into<String>) -> Self {
        Self::Failed {
            stage,
            message: message.into(),
        }
    }
}

/// 底座统一错误类型
#[derive(Error, Debug)]
pub enum ApiaryError {
    /// 构造时缺少必需协作者；致命，立即失败
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 连接 / 引擎上限在有限时间回收后仍无法满足；不自动重试
    #[error("Capacity exceeded for user {user_id}: {detail}")]
    Capacity { user_id: String, detail: String },

    /// 入口处拒绝的畸形上下文（占位 ID、循环祖先链、跨用户父上下文）
    #[error("Invalid user context: {0}")]
    InvalidContext(String),

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    StageExecution(#[from] StageError),

    #[error("Reporting failed: {0}")]
    ReportingFailure(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Engine {0} is closed")]
    EngineClosed(String),
}

impl ApiaryError {
    pub fn capacity(user_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Capacity {
            user_id: user_id.into(),
            detail: detail.into(),
        }
    }

    /// 是否允许传播到请求边界
    pub fn propagates(&self) -> bool {
        matches!(
            self,
            ApiaryError::Configuration(_)
                | ApiaryError::Capacity { .. }
                | ApiaryError::InvalidContext(_)
                | ApiaryError::Unauthenticated(_)
        )
    }

    /// 下发给客户端的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApiaryError::Configuration(_) => "configuration_error",
            ApiaryError::Capacity { .. } => "capacity_exceeded",
            ApiaryError::InvalidContext(_) => "invalid_context",
            ApiaryError::Unauthenticated(_) => "unauthenticated",
            ApiaryError::Transport(_) => "transport_error",
            ApiaryError::StageExecution(_) => "stage_failed",
            ApiaryError::ReportingFailure(_) => "reporting_failed",
            ApiaryError::ConnectionNotFound(_) => "connection_not_found",
            ApiaryError::EngineClosed(_) => "engine_closed",
        }
    }
}
