//! 错误恢复引擎
//!
//! 根据 ApiaryError 类型返回 Disposition，供网关决定是上抛给调用方、降级吸收还是把连接判死。

use crate::core::{ApiaryError, TransportError};

/// 错误处置方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// 传播到请求边界，以 error 事件告知客户端
    Propagate { code: &'static str, message: String },
    /// 已被吸收为降级结果，仅记录
    Degrade(String),
    /// 通道不可写：转为连接存活状态变化
    MarkConnectionDead(String),
}

/// 错误 → 处置 的映射
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &ApiaryError) -> Disposition {
        match err {
            e if e.propagates() => Disposition::Propagate {
                code: e.code(),
                message: e.to_string(),
            },
            ApiaryError::Transport(TransportError::Closed(id))
            | ApiaryError::Transport(TransportError::NoConnection(id)) => {
                Disposition::MarkConnectionDead(id.clone())
            }
            ApiaryError::Transport(TransportError::Full(id)) => {
                Disposition::Degrade(format!("outbound buffer full on {id}"))
            }
            other => Disposition::Degrade(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageError;
    use crate::orchestration::Stage;

    #[test]
    fn test_recovery_capacity_propagates() {
        let engine = RecoveryEngine::new();
        match engine.handle(&ApiaryError::capacity("u1", "5 connections")) {
            Disposition::Propagate { code, message } => {
                assert_eq!(code, "capacity_exceeded");
                assert!(message.contains("u1"));
            }
            other => panic!("Expected Propagate, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_closed_channel_marks_dead() {
        let engine = RecoveryEngine::new();
        let err = ApiaryError::Transport(TransportError::Closed("conn_1".into()));
        assert_eq!(
            engine.handle(&err),
            Disposition::MarkConnectionDead("conn_1".into())
        );
    }

    #[test]
    fn test_recovery_stage_failure_degrades() {
        let engine = RecoveryEngine::new();
        let err = ApiaryError::StageExecution(StageError::Timeout(Stage::Data, 120));
        assert!(matches!(engine.handle(&err), Disposition::Degrade(_)));
    }

    #[test]
    fn test_recovery_full_buffer_degrades() {
        let engine = RecoveryEngine::new();
        let err = ApiaryError::Transport(TransportError::Full("conn_1".into()));
        assert!(matches!(engine.handle(&err), Disposition::Degrade(_)));
    }
}
