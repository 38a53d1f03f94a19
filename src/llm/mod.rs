//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError, Message, Role};

use crate::config::LlmSection;

/// 按 [llm] 段选择后端；未知 provider 回落到 Mock 并告警
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    match section.provider.as_str() {
        "openai" => Arc::new(OpenAiClient::new(
            section.base_url.as_deref(),
            &section.model,
            None,
            Duration::from_secs(section.request_timeout_secs),
        )),
        "mock" => Arc::new(MockLlmClient::new()),
        other => {
            tracing::warn!(provider = other, "Unknown LLM provider, using mock client");
            Arc::new(MockLlmClient::new())
        }
    }
}
