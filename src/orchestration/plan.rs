//! 分诊结果与动态阶段规划
//!
//! 规则顺序：显式阶段列表 → 无分诊 → 数据不足（含未知值）→ 关键词匹配；REPORTING 总在末尾。

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::KeywordSection;
use crate::core::ApiaryError;
use crate::orchestration::Stage;

/// 数据充分度；无法识别的取值归为 Unknown，按不足处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSufficiency {
    Sufficient,
    Partial,
    Insufficient,
    #[default]
    Unknown,
}

impl DataSufficiency {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSufficiency::Sufficient => "sufficient",
            DataSufficiency::Partial => "partial",
            DataSufficiency::Insufficient => "insufficient",
            DataSufficiency::Unknown => "unknown",
        }
    }

    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "sufficient" => DataSufficiency::Sufficient,
            "partial" => DataSufficiency::Partial,
            "insufficient" => DataSufficiency::Insufficient,
            _ => DataSufficiency::Unknown,
        }
    }
}

impl Serialize for DataSufficiency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataSufficiency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = Option::<String>::deserialize(deserializer)?;
        Ok(label
            .as_deref()
            .map(DataSufficiency::from_label)
            .unwrap_or_default())
    }
}

/// 分诊识别出的意图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intent {
    pub primary_intent: String,
    pub secondary_intents: Vec<String>,
    pub action_required: bool,
}

impl Intent {
    /// 用于关键词匹配的文本
    pub fn text(&self) -> String {
        let mut text = self.primary_intent.clone();
        for secondary in &self.secondary_intents {
            text.push('\n');
            text.push_str(secondary);
        }
        text
    }
}

/// TRIAGE 阶段的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageResult {
    pub category: String,
    pub priority: String,
    pub data_sufficiency: DataSufficiency,
    pub intent: Intent,
    /// 显式指定的阶段列表，存在时原样执行
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<Stage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Default for TriageResult {
    fn default() -> Self {
        Self {
            category: "general".to_string(),
            priority: "medium".to_string(),
            data_sufficiency: DataSufficiency::Unknown,
            intent: Intent::default(),
            stages: None,
            confidence: None,
        }
    }
}

impl TriageResult {
    pub fn sufficient(primary_intent: impl Into<String>) -> Self {
        Self {
            data_sufficiency: DataSufficiency::Sufficient,
            intent: Intent {
                primary_intent: primary_intent.into(),
                ..Intent::default()
            },
            ..Self::default()
        }
    }

    pub fn with_sufficiency(mut self, sufficiency: DataSufficiency) -> Self {
        self.data_sufficiency = sufficiency;
        self
    }

    pub fn with_action_required(mut self, action_required: bool) -> Self {
        self.intent.action_required = action_required;
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = Some(stages);
        self
    }
}

/// 计划来源（日志与事件中说明为何选择这些阶段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Explicit,
    NoTriage,
    InsufficientData,
    Keywords,
}

/// 有序阶段计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePlan {
    stages: Vec<Stage>,
    pub source: PlanSource,
}

impl StagePlan {
    pub fn new(stages: Vec<Stage>, source: PlanSource) -> Self {
        Self { stages, source }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

fn keyword_regex(keywords: &[String]) -> Result<Option<Regex>, ApiaryError> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&format!(r"(?i)\b(?:{})", alternatives.join("|")))
        .map(Some)
        .map_err(|e| ApiaryError::Configuration(format!("invalid keyword pattern: {e}")))
}

/// 关键词规划器：构造时一次性编译正则
#[derive(Debug, Clone)]
pub struct StagePlanner {
    analysis: Option<Regex>,
    optimization: Option<Regex>,
    actions: Option<Regex>,
}

impl StagePlanner {
    pub fn new(keywords: &KeywordSection) -> Result<Self, ApiaryError> {
        Ok(Self {
            analysis: keyword_regex(&keywords.analysis)?,
            optimization: keyword_regex(&keywords.optimization)?,
            actions: keyword_regex(&keywords.actions)?,
        })
    }

    pub fn determine_plan(&self, triage: Option<&TriageResult>) -> StagePlan {
        let Some(triage) = triage else {
            return StagePlan::new(vec![Stage::DataHelper, Stage::Reporting], PlanSource::NoTriage);
        };

        if let Some(stages) = triage.stages.as_ref().filter(|s| !s.is_empty()) {
            return StagePlan::new(stages.clone(), PlanSource::Explicit);
        }

        let data_stage = match triage.data_sufficiency {
            DataSufficiency::Sufficient => Stage::Data,
            DataSufficiency::Partial => Stage::DataHelper,
            DataSufficiency::Insufficient | DataSufficiency::Unknown => {
                return StagePlan::new(
                    vec![Stage::DataHelper, Stage::Reporting],
                    PlanSource::InsufficientData,
                );
            }
        };

        let text = triage.intent.text();
        let matches = |re: &Option<Regex>| re.as_ref().is_some_and(|re| re.is_match(&text));

        let mut stages = Vec::with_capacity(4);
        if matches(&self.analysis) {
            stages.push(data_stage);
        }
        if matches(&self.optimization) {
            stages.push(Stage::Optimization);
        }
        if triage.intent.action_required || matches(&self.actions) {
            stages.push(Stage::Actions);
        }
        stages.push(Stage::Reporting);

        StagePlan::new(stages, PlanSource::Keywords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> StagePlanner {
        StagePlanner::new(&KeywordSection::default()).unwrap()
    }

    #[test]
    fn test_no_triage_plan() {
        let plan = planner().determine_plan(None);
        assert_eq!(plan.stages(), &[Stage::DataHelper, Stage::Reporting]);
        assert_eq!(plan.source, PlanSource::NoTriage);
    }

    #[test]
    fn test_insufficient_and_unknown_sufficiency() {
        let p = planner();
        let insufficient = TriageResult::sufficient("optimize cloud costs")
            .with_sufficiency(DataSufficiency::Insufficient);
        assert_eq!(
            p.determine_plan(Some(&insufficient)).stages(),
            &[Stage::DataHelper, Stage::Reporting]
        );

        let unknown: TriageResult =
            serde_json::from_str(r#"{"data_sufficiency": "mostly", "intent": {"primary_intent": "analyze usage"}}"#)
                .unwrap();
        assert_eq!(unknown.data_sufficiency, DataSufficiency::Unknown);
        assert_eq!(p.determine_plan(Some(&unknown)).source, PlanSource::InsufficientData);
    }

    #[test]
    fn test_optimize_cloud_costs_with_action() {
        let triage = TriageResult::sufficient("optimize cloud costs").with_action_required(true);
        let plan = planner().determine_plan(Some(&triage));
        assert_eq!(
            plan.stages(),
            &[Stage::Data, Stage::Optimization, Stage::Actions, Stage::Reporting]
        );
    }

    #[test]
    fn test_partial_uses_data_helper() {
        let triage = TriageResult::sufficient("show usage trend").with_sufficiency(DataSufficiency::Partial);
        assert_eq!(
            planner().determine_plan(Some(&triage)).stages(),
            &[Stage::DataHelper, Stage::Reporting]
        );
    }

    #[test]
    fn test_no_keyword_match_reports_only() {
        let triage = TriageResult::sufficient("hello there");
        assert_eq!(planner().determine_plan(Some(&triage)).stages(), &[Stage::Reporting]);
    }

    #[test]
    fn test_action_keyword_without_flag() {
        let triage = TriageResult::sufficient("How do I set up alerts?");
        let plan = planner().determine_plan(Some(&triage));
        assert_eq!(plan.stages(), &[Stage::Actions, Stage::Reporting]);
    }

    #[test]
    fn test_explicit_stages_win() {
        let triage = TriageResult::sufficient("optimize cloud costs")
            .with_sufficiency(DataSufficiency::Insufficient)
            .with_stages(vec![Stage::Optimization]);
        let plan = planner().determine_plan(Some(&triage));
        assert_eq!(plan.stages(), &[Stage::Optimization]);
        assert_eq!(plan.source, PlanSource::Explicit);
    }

    #[test]
    fn test_custom_keywords() {
        let keywords = KeywordSection {
            analysis: vec!["inspect".into()],
            optimization: vec![],
            actions: vec![],
        };
        let p = StagePlanner::new(&keywords).unwrap();
        let triage = TriageResult::sufficient("Inspect cost spikes");
        assert_eq!(p.determine_plan(Some(&triage)).stages(), &[Stage::Data, Stage::Reporting]);
    }
}
