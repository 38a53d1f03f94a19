//! 最终报告与降级报告合成
//!
//! REPORTING 失败、输出不可解析或未被计划时，由已完成阶段的输出拼出最小报告；合成本身不会失败。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestration::{Stage, StageResult, StageStatus, TriageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Success,
    Fallback,
}

/// 一次运行的最终报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub status: ReportStatus,
    pub summary: String,
    pub category: String,
    pub priority: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub action_steps: Vec<String>,
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    #[serde(default)]
    pub failed_stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 从 JSON 值中取字符串列表：接受字符串数组、对象数组（取 text/title/description）或单个字符串
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(map) => ["text", "title", "description", "summary"]
                    .iter()
                    .find_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn first_list(output: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .map(|k| string_list(output.get(*k)))
        .find(|list| !list.is_empty())
        .unwrap_or_default()
}

fn stage_lists(results: &[StageResult]) -> (Vec<Stage>, Vec<Stage>) {
    let completed = results
        .iter()
        .filter(|r| r.status == StageStatus::Completed)
        .map(|r| r.stage)
        .collect();
    let failed = results
        .iter()
        .filter(|r| r.status == StageStatus::Failed)
        .map(|r| r.stage)
        .collect();
    (completed, failed)
}

fn label(triage: Option<&TriageResult>) -> (String, String) {
    let fallback = TriageResult::default();
    let triage = triage.unwrap_or(&fallback);
    let category = if triage.category.trim().is_empty() {
        fallback.category.clone()
    } else {
        triage.category.clone()
    };
    let priority = if triage.priority.trim().is_empty() {
        fallback.priority.clone()
    } else {
        triage.priority.clone()
    };
    (category, priority)
}

impl Report {
    /// 解析 REPORTING 阶段输出；summary 缺失或为空视为无效
    pub fn from_stage_output(
        output: &Value,
        triage: Option<&TriageResult>,
        results: &[StageResult],
    ) -> Result<Self, String> {
        let summary = output
            .get("summary")
            .or_else(|| output.get("text"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if summary.is_empty() {
            return Err("report has no summary".to_string());
        }

        let (category, priority) = label(triage);
        let (completed_stages, failed_stages) = stage_lists(results);
        Ok(Self {
            status: ReportStatus::Success,
            summary: summary.to_string(),
            category: output
                .get("category")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(category),
            priority: output
                .get("priority")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or(priority),
            insights: first_list(output, &["insights", "key_findings", "findings"]),
            recommendations: string_list(output.get("recommendations")),
            action_steps: first_list(output, &["action_steps", "actions", "steps"]),
            completed_stages,
            failed_stages,
            error: None,
        })
    }
}

/// 降级报告构建器
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackReportBuilder;

impl FallbackReportBuilder {
    pub fn build(triage: Option<&TriageResult>, results: &[StageResult], reason: &str) -> Report {
        let output_of = |stage: Stage| {
            results
                .iter()
                .find(|r| r.stage == stage && r.status == StageStatus::Completed)
                .and_then(|r| r.output.as_ref())
        };

        let mut insights = Vec::new();
        for stage in [Stage::Data, Stage::DataHelper] {
            if let Some(output) = output_of(stage) {
                insights.extend(first_list(output, &["insights", "findings", "key_findings", "text"]));
            }
        }
        let recommendations = output_of(Stage::Optimization)
            .map(|o| first_list(o, &["recommendations", "text"]))
            .unwrap_or_default();
        let action_steps = output_of(Stage::Actions)
            .map(|o| first_list(o, &["action_steps", "steps", "actions", "text"]))
            .unwrap_or_default();

        let (category, priority) = label(triage);
        let (completed_stages, failed_stages) = stage_lists(results);

        let summary = if completed_stages.is_empty() {
            format!(
                "We could not complete the full analysis for this {category} request. Please try again shortly."
            )
        } else {
            let names: Vec<&str> = completed_stages.iter().map(Stage::as_str).collect();
            format!(
                "Partial results for this {category} request (completed: {}). {} insight(s), {} recommendation(s) and {} action step(s) are available.",
                names.join(", "),
                insights.len(),
                recommendations.len(),
                action_steps.len()
            )
        };

        Report {
            status: ReportStatus::Fallback,
            summary,
            category,
            priority,
            insights,
            recommendations,
            action_steps,
            completed_stages,
            failed_stages,
            error: Some(reason.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageError;
    use serde_json::json;

    #[test]
    fn test_fallback_collects_stage_outputs() {
        let results = vec![
            StageResult::completed(Stage::Data, json!({"insights": ["compute is 70% of spend"]}), 5),
            StageResult::completed(
                Stage::Optimization,
                json!({"recommendations": [{"title": "Buy reserved instances"}]}),
                5,
            ),
            StageResult::failed(Stage::Actions, &StageError::failed(Stage::Actions, "boom"), 1),
        ];
        let triage = TriageResult {
            category: "cost".into(),
            priority: "high".into(),
            ..TriageResult::default()
        };
        let report = FallbackReportBuilder::build(Some(&triage), &results, "reporting failed");

        assert_eq!(report.status, ReportStatus::Fallback);
        assert_eq!(report.category, "cost");
        assert_eq!(report.priority, "high");
        assert_eq!(report.insights, vec!["compute is 70% of spend"]);
        assert_eq!(report.recommendations, vec!["Buy reserved instances"]);
        assert!(report.action_steps.is_empty());
        assert_eq!(report.completed_stages, vec![Stage::Data, Stage::Optimization]);
        assert_eq!(report.failed_stages, vec![Stage::Actions]);
        assert!(report.summary.contains("data, optimization"));
    }

    #[test]
    fn test_fallback_without_anything() {
        let report = FallbackReportBuilder::build(None, &[], "no stages");
        assert!(!report.summary.is_empty());
        assert_eq!(report.category, "general");
        assert_eq!(report.error.as_deref(), Some("no stages"));
    }

    #[test]
    fn test_report_requires_summary() {
        assert!(Report::from_stage_output(&json!({"insights": []}), None, &[]).is_err());
        let report = Report::from_stage_output(&json!({"text": "All good"}), None, &[]).unwrap();
        assert_eq!(report.summary, "All good");
        assert_eq!(report.status, ReportStatus::Success);
    }
}
