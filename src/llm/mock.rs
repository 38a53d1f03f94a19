//! Mock LLM 客户端（用于测试与本地运行，无需 API）
//!
//! 从 system 消息首行 `stage: <name>` 识别阶段，返回该阶段的固定 JSON；
//! 可指定若干阶段始终失败，用于演练降级路径。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：按阶段返回固定结构
#[derive(Debug, Default)]
pub struct MockLlmClient {
    failing: HashSet<String>,
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定阶段（如 "reporting"）总是返回错误
    pub fn failing_on(mut self, stage: impl Into<String>) -> Self {
        self.failing.insert(stage.into());
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

fn stage_of(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .and_then(|m| m.content.lines().next())
        .and_then(|line| line.strip_prefix("stage: "))
        .map(str::trim)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let request = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let stage = stage_of(messages).unwrap_or("unknown");
        if self.failing.contains(stage) {
            return Err(LlmError::ApiError(format!("mock failure for stage {stage}")));
        }

        let lower = request.to_lowercase();
        let body = match stage {
            "triage" => json!({
                "category": "general",
                "priority": "medium",
                "data_sufficiency": "sufficient",
                "intent": {
                    "primary_intent": request,
                    "secondary_intents": [],
                    "action_required": lower.contains("how") || lower.contains("what should"),
                },
                "confidence": 0.8,
            }),
            "data_helper" => json!({
                "questions": ["Which time range should be analysed?"],
                "insights": [format!("More context is needed for: {request}")],
            }),
            "data" => json!({
                "insights": [format!("Mock analysis of: {request}")],
            }),
            "optimization" => json!({
                "recommendations": ["Remove idle resources", "Right-size over-provisioned capacity"],
            }),
            "actions" => json!({
                "action_steps": ["Review the resource inventory", "Apply the recommended changes"],
            }),
            "reporting" => json!({
                "summary": format!("Report for: {request}"),
                "insights": [],
                "recommendations": [],
                "action_steps": [],
            }),
            _ => json!({ "text": format!("Echo from Mock: {request}") }),
        };

        Ok(body.to_string())
    }
}
