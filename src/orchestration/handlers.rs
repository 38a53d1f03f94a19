//! 默认阶段处理器：以阶段专属指令调用 LLM，解析 JSON 输出

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::core::StageError;
use crate::llm::{LlmClient, Message};
use crate::orchestration::{Stage, StageContext, StageHandler, StageRegistry};

const TOOL_NAME: &str = "llm.complete";

fn default_instruction(stage: Stage) -> &'static str {
    match stage {
        Stage::Triage => {
            "Classify the request. Reply with one JSON object: \
             {\"category\", \"priority\", \"data_sufficiency\": \"sufficient|partial|insufficient\", \
             \"intent\": {\"primary_intent\", \"secondary_intents\", \"action_required\"}, \"confidence\"}."
        }
        Stage::DataHelper => {
            "The available data is incomplete. Reply with JSON: {\"questions\": [...], \"insights\": [...]} \
             listing what is missing and what can already be said."
        }
        Stage::Data => "Analyse the relevant usage data. Reply with JSON: {\"insights\": [...]}.",
        Stage::Optimization => {
            "Propose optimizations based on the analysis so far. Reply with JSON: {\"recommendations\": [...]}."
        }
        Stage::Actions => "Turn the recommendations into concrete steps. Reply with JSON: {\"action_steps\": [...]}.",
        Stage::Reporting => {
            "Write the final report. Reply with JSON: {\"summary\", \"insights\", \"recommendations\", \"action_steps\"}."
        }
    }
}

/// 去掉 ```json 围栏；非 JSON 对象的文本包装成 {"text": ...}
pub fn parse_stage_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<Value>(unfenced) {
        Ok(value @ Value::Object(_)) => value,
        _ => {
            let start = unfenced.find('{');
            let end = unfenced.rfind('}');
            if let (Some(s), Some(e)) = (start, end) {
                if s < e {
                    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&unfenced[s..=e]) {
                        return value;
                    }
                }
            }
            json!({ "text": unfenced })
        }
    }
}

/// 以 LLM 完成阶段工作的处理器
pub struct LlmStageHandler {
    stage: Stage,
    llm: Arc<dyn LlmClient>,
    instruction: String,
}

impl LlmStageHandler {
    pub fn new(stage: Stage, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            stage,
            llm,
            instruction: default_instruction(stage).to_string(),
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    fn build_messages(&self, ctx: &StageContext<'_>) -> Vec<Message> {
        let mut messages = vec![
            Message::system(format!("stage: {}\n{}", self.stage, self.instruction)),
            Message::user(ctx.content),
        ];

        let mut context = Map::new();
        if let Some(triage) = ctx.triage {
            if let Ok(value) = serde_json::to_value(triage) {
                context.insert("triage".to_string(), value);
            }
        }
        for result in ctx.prior.iter().filter(|r| r.is_completed()) {
            if let Some(output) = &result.output {
                context.insert(result.stage.to_string(), output.clone());
            }
        }
        if !context.is_empty() {
            messages.push(Message::user(format!(
                "Results from earlier stages:\n{}",
                Value::Object(context)
            )));
        }
        messages
    }
}

#[async_trait]
impl StageHandler for LlmStageHandler {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<Value, StageError> {
        let messages = self.build_messages(ctx);
        ctx.observer
            .stage_thinking(self.stage, &format!("Working on {}", self.stage))
            .await;
        let input = json!({ "messages": messages.len() });
        ctx.observer.tool_executing(self.stage, TOOL_NAME, &input).await;

        match self.llm.complete(&messages).await {
            Ok(raw) => {
                ctx.observer
                    .tool_completed(self.stage, TOOL_NAME, true, &format!("{} chars", raw.len()))
                    .await;
                Ok(parse_stage_output(&raw))
            }
            Err(e) => {
                ctx.observer
                    .tool_completed(self.stage, TOOL_NAME, false, &e.to_string())
                    .await;
                Err(StageError::failed(self.stage, e.to_string()))
            }
        }
    }
}

/// 为全部阶段注册 LLM 处理器
pub fn default_registry(llm: Arc<dyn LlmClient>) -> StageRegistry {
    Stage::ALL.into_iter().fold(StageRegistry::new(), |registry, stage| {
        registry.with(Arc::new(LlmStageHandler::new(stage, llm.clone())))
    })
}
