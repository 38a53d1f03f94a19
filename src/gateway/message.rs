//! 网关消息协议定义
//!
//! 入站：`{"type": ..., "payload": {...}}` 信封；出站：带元信息的 GatewayMessage，事件体以 `type` 标记。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::orchestration::{Report, ReportStatus, Stage, StageStatus, TriageResult};

/// 入站消息解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_message",
            ProtocolError::UnknownType(_) => "unknown_message_type",
        }
    }
}

/// 客户端发来的消息
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// 用户输入，触发一次执行
    UserMessage {
        content: String,
        thread_id: Option<String>,
        metadata: BTreeMap<String, String>,
    },
    /// 显式触发，可携带预先计算的分诊结果或阶段列表
    StartAgent {
        content: String,
        thread_id: Option<String>,
        triage: Option<TriageResult>,
        stages: Option<Vec<Stage>>,
    },
    /// 客户端心跳，由存活管理层直接应答
    Ping { timestamp: Option<u64> },
    /// 对服务端 ping 的应答
    Pong { timestamp: Option<u64> },
    /// 首帧认证
    Auth {
        token: Option<String>,
        user_id: String,
        thread_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct UserMessagePayload {
    content: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct StartAgentPayload {
    #[serde(default)]
    content: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    triage: Option<TriageResult>,
    #[serde(default)]
    stages: Option<Vec<Stage>>,
}

#[derive(Deserialize)]
struct HeartbeatPayload {
    #[serde(default)]
    timestamp: Option<u64>,
}

#[derive(Deserialize)]
struct AuthPayload {
    #[serde(default)]
    token: Option<String>,
    user_id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{kind}: {e}")))
}

impl InboundMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind = envelope.kind.as_str();

        match kind {
            "user_message" => {
                let p: UserMessagePayload = payload(kind, envelope.payload)?;
                Ok(InboundMessage::UserMessage {
                    content: p.content,
                    thread_id: p.thread_id,
                    metadata: p.metadata,
                })
            }
            "start_agent" => {
                let p: StartAgentPayload = payload(kind, envelope.payload)?;
                Ok(InboundMessage::StartAgent {
                    content: p.content,
                    thread_id: p.thread_id,
                    triage: p.triage,
                    stages: p.stages,
                })
            }
            "ping" => {
                let p: HeartbeatPayload = payload(kind, envelope.payload)?;
                Ok(InboundMessage::Ping {
                    timestamp: p.timestamp,
                })
            }
            "pong" => {
                let p: HeartbeatPayload = payload(kind, envelope.payload)?;
                Ok(InboundMessage::Pong {
                    timestamp: p.timestamp,
                })
            }
            "auth" => {
                let p: AuthPayload = payload(kind, envelope.payload)?;
                Ok(InboundMessage::Auth {
                    token: p.token,
                    user_id: p.user_id,
                    thread_id: p.thread_id,
                })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::UserMessage { .. } => "user_message",
            InboundMessage::StartAgent { .. } => "start_agent",
            InboundMessage::Ping { .. } => "ping",
            InboundMessage::Pong { .. } => "pong",
            InboundMessage::Auth { .. } => "auth",
        }
    }
}

/// 服务端推送的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished {
        connection_id: String,
        user_id: String,
        heartbeat_interval_secs: u64,
    },
    StageStarted {
        stage: Stage,
    },
    StageThinking {
        stage: Stage,
        content: String,
    },
    ToolExecuting {
        stage: Stage,
        tool_name: String,
        arguments: Value,
    },
    ToolCompleted {
        stage: Stage,
        tool_name: String,
        success: bool,
        summary: String,
    },
    StageCompleted {
        stage: Stage,
        status: StageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },
    AgentCompleted {
        status: ReportStatus,
        report: Report,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// 网关消息（带元信息的完整消息）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// 消息 ID
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// 消息内容
    pub message: ServerEvent,
    /// 时间戳（毫秒）
    pub timestamp: u64,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl GatewayMessage {
    pub fn new(message: ServerEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: None,
            run_id: None,
            message,
            timestamp: now_millis(),
        }
    }

    pub fn for_run(thread_id: &str, run_id: &str, message: ServerEvent) -> Self {
        Self {
            thread_id: Some(thread_id.to_string()),
            run_id: Some(run_id.to_string()),
            ..Self::new(message)
        }
    }

    pub fn error(code: &str, message: &str) -> Self {
        Self::new(ServerEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    pub fn ping() -> Self {
        Self::new(ServerEvent::Ping {
            timestamp: now_millis(),
        })
    }

    pub fn pong(timestamp: u64) -> Self {
        Self::new(ServerEvent::Pong { timestamp })
    }

    /// 事件类型名（日志与测试断言用）
    pub fn kind(&self) -> &'static str {
        match &self.message {
            ServerEvent::ConnectionEstablished { .. } => "connection_established",
            ServerEvent::StageStarted { .. } => "stage_started",
            ServerEvent::StageThinking { .. } => "stage_thinking",
            ServerEvent::ToolExecuting { .. } => "tool_executing",
            ServerEvent::ToolCompleted { .. } => "tool_completed",
            ServerEvent::StageCompleted { .. } => "stage_completed",
            ServerEvent::AgentCompleted { .. } => "agent_completed",
            ServerEvent::Ping { .. } => "ping",
            ServerEvent::Pong { .. } => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_message() {
        let msg = InboundMessage::parse(
            r#"{"type":"user_message","payload":{"content":"optimize cloud costs","thread_id":"t1"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::UserMessage {
                content: "optimize cloud costs".into(),
                thread_id: Some("t1".into()),
                metadata: BTreeMap::new(),
            }
        );
    }

    #[test]
    fn test_parse_ping_without_payload() {
        let msg = InboundMessage::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Ping { timestamp: None });
    }

    #[test]
    fn test_parse_start_agent_with_stages() {
        let msg = InboundMessage::parse(
            r#"{"type":"start_agent","payload":{"content":"x","stages":["DATA","REPORTING"]}}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::StartAgent { stages, .. } => {
                assert_eq!(stages, Some(vec![Stage::Data, Stage::Reporting]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"subscribe","payload":{}}"#),
            Err(ProtocolError::UnknownType(t)) if t == "subscribe"
        ));
        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundMessage::parse(r#"{"type":"user_message","payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_outbound_event_is_type_tagged() {
        let msg = GatewayMessage::for_run(
            "t1",
            "run_1",
            ServerEvent::StageStarted { stage: Stage::Data },
        );
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["message"]["type"], "stage_started");
        assert_eq!(json["message"]["stage"], "data");
        assert_eq!(json["run_id"], "run_1");
        assert_eq!(msg.kind(), "stage_started");
    }
}
