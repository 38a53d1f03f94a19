//! 阶段定义、依赖声明与处理器注册表
//!
//! 阶段分发走「枚举标签 → 处理器 trait 对象」表，不依赖字符串匹配。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{StageError, UserContext};
use crate::orchestration::plan::TriageResult;

/// 处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(alias = "TRIAGE")]
    Triage,
    #[serde(alias = "DATA_HELPER")]
    DataHelper,
    #[serde(alias = "DATA")]
    Data,
    #[serde(alias = "OPTIMIZATION")]
    Optimization,
    #[serde(alias = "ACTIONS")]
    Actions,
    #[serde(alias = "REPORTING")]
    Reporting,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Triage,
        Stage::DataHelper,
        Stage::Data,
        Stage::Optimization,
        Stage::Actions,
        Stage::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Triage => "triage",
            Stage::DataHelper => "data_helper",
            Stage::Data => "data",
            Stage::Optimization => "optimization",
            Stage::Actions => "actions",
            Stage::Reporting => "reporting",
        }
    }

    /// 前置依赖声明；`optimization_requires_data` 为 true 时 DATA 升级为必需
    pub fn dependencies(&self, optimization_requires_data: bool) -> StageDependencies {
        match self {
            Stage::Triage | Stage::Reporting => StageDependencies::default(),
            Stage::DataHelper | Stage::Data => StageDependencies {
                required: vec![],
                optional: vec![Stage::Triage],
            },
            Stage::Optimization if optimization_requires_data => StageDependencies {
                required: vec![Stage::Data],
                optional: vec![Stage::Triage],
            },
            Stage::Optimization => StageDependencies {
                required: vec![],
                optional: vec![Stage::Data, Stage::Triage],
            },
            Stage::Actions => StageDependencies {
                required: vec![],
                optional: vec![Stage::Optimization, Stage::Data],
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// 阶段依赖：必需前置未完成则跳过；可选前置失败或缺席不影响执行
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageDependencies {
    pub required: Vec<Stage>,
    pub optional: Vec<Stage>,
}

impl StageDependencies {
    /// 返回第一个未满足的必需前置
    pub fn unmet<'a>(&self, results: impl IntoIterator<Item = &'a StageResult> + Clone) -> Option<Stage> {
        self.required.iter().copied().find(|req| {
            !results
                .clone()
                .into_iter()
                .any(|r| r.stage == *req && r.status == StageStatus::Completed)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
}

/// 单个阶段的执行结果，写入所属 run 的结果槽
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn completed(stage: Stage, output: Value, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failed(stage: Stage, error: &StageError, duration_ms: u64) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            duration_ms,
        }
    }

    pub fn skipped(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            duration_ms: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// 运行事件观察者：引擎借此把进度推送到通信通道
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn stage_started(&self, _stage: Stage) {}

    async fn stage_thinking(&self, _stage: Stage, _message: &str) {}

    async fn tool_executing(&self, _stage: Stage, _tool: &str, _input: &Value) {}

    async fn tool_completed(&self, _stage: Stage, _tool: &str, _success: bool, _summary: &str) {}

    async fn stage_finished(&self, _result: &StageResult) {}
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// 处理器看到的只读输入
pub struct StageContext<'a> {
    pub user: &'a UserContext,
    pub content: &'a str,
    pub triage: Option<&'a TriageResult>,
    /// 本次运行中已结束的阶段
    pub prior: &'a [StageResult],
    pub observer: &'a dyn RunObserver,
}

impl<'a> StageContext<'a> {
    pub fn run_id(&self) -> &str {
        self.user.run_id()
    }

    pub fn prior_output(&self, stage: Stage) -> Option<&Value> {
        self.prior
            .iter()
            .find(|r| r.stage == stage && r.is_completed())
            .and_then(|r| r.output.as_ref())
    }
}

/// 阶段处理器
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, ctx: &StageContext<'_>) -> Result<Value, StageError>;
}

/// 阶段 → 处理器 映射
#[derive(Clone, Default)]
pub struct StageRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按处理器声明的阶段注册，同阶段后注册者覆盖
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn with(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.handlers.contains_key(&stage)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().collect();
        stages.sort();
        f.debug_struct("StageRegistry").field("stages", &stages).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_and_display() {
        assert_eq!("DATA_HELPER".parse::<Stage>().unwrap(), Stage::DataHelper);
        assert_eq!("reporting".parse::<Stage>().unwrap(), Stage::Reporting);
        assert!("analysis".parse::<Stage>().is_err());
        assert_eq!(Stage::Optimization.to_string(), "optimization");
    }

    #[test]
    fn test_stage_serde_accepts_uppercase() {
        let stages: Vec<Stage> = serde_json::from_str(r#"["DATA", "actions", "REPORTING"]"#).unwrap();
        assert_eq!(stages, vec![Stage::Data, Stage::Actions, Stage::Reporting]);
        assert_eq!(serde_json::to_string(&Stage::DataHelper).unwrap(), "\"data_helper\"");
    }

    #[test]
    fn test_reporting_has_no_required_predecessor() {
        assert!(Stage::Reporting.dependencies(true).required.is_empty());
    }

    #[test]
    fn test_optimization_requires_data_when_hardened() {
        let failed_data = StageResult::failed(
            Stage::Data,
            &StageError::failed(Stage::Data, "boom"),
            3,
        );
        let results = [failed_data];
        assert_eq!(Stage::Optimization.dependencies(true).unmet(results.iter()), Some(Stage::Data));
        assert_eq!(Stage::Optimization.dependencies(false).unmet(results.iter()), None);
    }
}
