//! 编排控制器：分诊 → 规划 → 按序执行阶段 → 报告（失败则降级）
//!
//! 单个阶段的错误、超时、panic、缺少处理器都只写入该阶段的结果槽，后续阶段照常执行。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestrationSection;
use crate::core::{ApiaryError, StageError, UserContext};
use crate::orchestration::{
    FallbackReportBuilder, Report, RunObserver, Stage, StageContext, StagePlan, StagePlanner,
    StageRegistry, StageResult, StageStatus, TriageResult,
};

/// 一次执行请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub content: String,
    /// 预先计算的分诊结果，存在时跳过 TRIAGE
    #[serde(default)]
    pub triage: Option<TriageResult>,
    /// 调用方指定的阶段列表，原样执行
    #[serde(default)]
    pub stages: Option<Vec<Stage>>,
}

impl ExecutionRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_triage(mut self, triage: TriageResult) -> Self {
        self.triage = Some(triage);
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = Some(stages);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub stage_timeout: Duration,
    pub optimization_requires_data: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(120),
            optimization_requires_data: false,
        }
    }
}

impl From<&OrchestrationSection> for ControllerConfig {
    fn from(section: &OrchestrationSection) -> Self {
        Self {
            stage_timeout: Duration::from_secs(section.stage_timeout_secs.max(1)),
            optimization_requires_data: section.optimization_requires_data,
        }
    }
}

/// 一次编排的完整产出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    pub triage: Option<TriageResult>,
    pub plan: StagePlan,
    pub results: Vec<StageResult>,
    pub report: Report,
}

impl OrchestrationOutcome {
    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.results.iter().rev().find(|r| r.stage == stage)
    }
}

pub struct OrchestrationController {
    registry: StageRegistry,
    planner: StagePlanner,
    config: ControllerConfig,
}

impl OrchestrationController {
    pub fn new(registry: StageRegistry, planner: StagePlanner, config: ControllerConfig) -> Self {
        Self {
            registry,
            planner,
            config,
        }
    }

    pub fn from_config(section: &OrchestrationSection, registry: StageRegistry) -> Result<Self, ApiaryError> {
        let planner = StagePlanner::new(&section.keywords)?;
        Ok(Self::new(registry, planner, ControllerConfig::from(section)))
    }

    pub fn determine_plan(&self, triage: Option<&TriageResult>) -> StagePlan {
        self.planner.determine_plan(triage)
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        user: &UserContext,
        request: &ExecutionRequest,
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) -> OrchestrationOutcome {
        let mut results: Vec<StageResult> = Vec::new();

        let triage = match (&request.triage, &request.stages) {
            (triage, Some(stages)) if !stages.is_empty() => Some(
                triage
                    .clone()
                    .unwrap_or_default()
                    .with_stages(stages.clone()),
            ),
            (Some(triage), _) => Some(triage.clone()),
            _ if self.registry.contains(Stage::Triage) => {
                let result = self
                    .execute_stage(Stage::Triage, user, request, None, &results, observer, cancel)
                    .await;
                observer.stage_finished(&result).await;
                let parsed = result
                    .output
                    .as_ref()
                    .filter(|_| result.is_completed())
                    .and_then(|out| match serde_json::from_value::<TriageResult>(out.clone()) {
                        Ok(t) => Some(t),
                        Err(e) => {
                            tracing::warn!(run_id = user.run_id(), error = %e, "Unparsable triage output");
                            None
                        }
                    });
                results.push(result);
                parsed
            }
            _ => None,
        };

        let plan = self.determine_plan(triage.as_ref());
        tracing::info!(
            user_id = user.user_id(),
            run_id = user.run_id(),
            source = ?plan.source,
            stages = ?plan.stages(),
            "Stage plan determined"
        );

        for &stage in plan.stages() {
            let result = if cancel.is_cancelled() {
                StageResult::skipped(stage, "run cancelled")
            } else if stage == Stage::Triage && results.iter().any(|r| r.stage == Stage::Triage) {
                StageResult::skipped(stage, "triage already performed")
            } else if let Some(missing) = stage
                .dependencies(self.config.optimization_requires_data)
                .unmet(results.iter())
            {
                StageResult::skipped(stage, format!("required stage {missing} did not complete"))
            } else {
                let mut result = self
                    .execute_stage(stage, user, request, triage.as_ref(), &results, observer, cancel)
                    .await;
                if stage == Stage::Reporting && result.is_completed() {
                    if let Some(Err(reason)) = result
                        .output
                        .as_ref()
                        .map(|out| Report::from_stage_output(out, triage.as_ref(), &results))
                    {
                        let err = StageError::InvalidOutput {
                            stage,
                            message: reason,
                        };
                        result = StageResult::failed(stage, &err, result.duration_ms);
                    }
                }
                result
            };

            if result.status != StageStatus::Completed {
                tracing::warn!(
                    user_id = user.user_id(),
                    run_id = user.run_id(),
                    stage = %stage,
                    status = ?result.status,
                    error = result.error.as_deref().unwrap_or(""),
                    "Stage did not complete"
                );
            }
            observer.stage_finished(&result).await;
            results.push(result);
        }

        let report = self.build_report(&plan, triage.as_ref(), &results, cancel);

        OrchestrationOutcome {
            triage,
            plan,
            results,
            report,
        }
    }

    fn build_report(
        &self,
        plan: &StagePlan,
        triage: Option<&TriageResult>,
        results: &[StageResult],
        cancel: &CancellationToken,
    ) -> Report {
        let reporting = results
            .iter()
            .rev()
            .find(|r| r.stage == Stage::Reporting);

        let reason = match reporting {
            Some(r) if r.is_completed() => {
                let prior: Vec<StageResult> = results
                    .iter()
                    .filter(|p| p.stage != Stage::Reporting)
                    .cloned()
                    .collect();
                match r
                    .output
                    .as_ref()
                    .map(|out| Report::from_stage_output(out, triage, &prior))
                {
                    Some(Ok(mut report)) => {
                        report.completed_stages.push(Stage::Reporting);
                        return report;
                    }
                    Some(Err(reason)) => reason,
                    None => "reporting stage produced no output".to_string(),
                }
            }
            Some(r) => r
                .error
                .clone()
                .unwrap_or_else(|| "reporting stage did not complete".to_string()),
            None if cancel.is_cancelled() => "run cancelled".to_string(),
            None if !plan.contains(Stage::Reporting) => "reporting stage not planned".to_string(),
            None => "reporting stage did not run".to_string(),
        };

        tracing::warn!(reason = %reason, "Falling back to synthesized report");
        FallbackReportBuilder::build(triage, results, &reason)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_stage(
        &self,
        stage: Stage,
        user: &UserContext,
        request: &ExecutionRequest,
        triage: Option<&TriageResult>,
        prior: &[StageResult],
        observer: &dyn RunObserver,
        cancel: &CancellationToken,
    ) -> StageResult {
        observer.stage_started(stage).await;

        let Some(handler) = self.registry.get(stage) else {
            return StageResult::failed(stage, &StageError::MissingHandler(stage), 0);
        };

        let ctx = StageContext {
            user,
            content: &request.content,
            triage,
            prior,
            observer,
        };

        tracing::debug!(run_id = user.run_id(), stage = %stage, "Stage started");
        let started = Instant::now();
        let guarded = AssertUnwindSafe(handler.run(&ctx)).catch_unwind();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(StageError::Cancelled(stage)),
            res = tokio::time::timeout(self.config.stage_timeout, guarded) => match res {
                Err(_) => Err(StageError::Timeout(stage, self.config.stage_timeout.as_secs())),
                Ok(Err(_)) => Err(StageError::Panicked(stage)),
                Ok(Ok(result)) => result,
            },
        };
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                tracing::debug!(run_id = user.run_id(), stage = %stage, elapsed_ms = elapsed, "Stage completed");
                StageResult::completed(stage, output, elapsed)
            }
            Err(e) => StageResult::failed(stage, &e, elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeywordSection;
    use crate::orchestration::{NoopObserver, ReportStatus, StageHandler};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Fixed(Stage, Value);

    #[async_trait]
    impl StageHandler for Fixed {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn run(&self, _ctx: &StageContext<'_>) -> Result<Value, StageError> {
            Ok(self.1.clone())
        }
    }

    struct Failing(Stage);

    #[async_trait]
    impl StageHandler for Failing {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn run(&self, _ctx: &StageContext<'_>) -> Result<Value, StageError> {
            Err(StageError::failed(self.0, "unavailable"))
        }
    }

    struct Panicking(Stage);

    #[async_trait]
    impl StageHandler for Panicking {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn run(&self, _ctx: &StageContext<'_>) -> Result<Value, StageError> {
            panic!("handler bug")
        }
    }

    struct Slow(Stage);

    #[async_trait]
    impl StageHandler for Slow {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn run(&self, _ctx: &StageContext<'_>) -> Result<Value, StageError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!({}))
        }
    }

    fn controller(registry: StageRegistry, timeout: Duration) -> OrchestrationController {
        OrchestrationController::new(
            registry,
            StagePlanner::new(&KeywordSection::default()).unwrap(),
            ControllerConfig {
                stage_timeout: timeout,
                optimization_requires_data: false,
            },
        )
    }

    fn user() -> UserContext {
        UserContext::new("alice", "t1").unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_uses_reporting_output() {
        let registry = StageRegistry::new()
            .with(Arc::new(Fixed(
                Stage::Triage,
                json!({"category": "cost", "data_sufficiency": "sufficient", "intent": {"primary_intent": "optimize cloud costs"}}),
            )))
            .with(Arc::new(Fixed(Stage::Data, json!({"insights": ["a"]}))))
            .with(Arc::new(Fixed(Stage::Optimization, json!({"recommendations": ["b"]}))))
            .with(Arc::new(Fixed(Stage::Reporting, json!({"summary": "done", "insights": ["a"]}))));
        let c = controller(registry, Duration::from_secs(5));

        let outcome = c
            .run(&user(), &ExecutionRequest::new("optimize cloud costs"), &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome.plan.stages(), &[Stage::Data, Stage::Optimization, Stage::Reporting]);
        assert_eq!(outcome.report.status, ReportStatus::Success);
        assert_eq!(outcome.report.summary, "done");
        assert_eq!(outcome.report.category, "cost");
        assert_eq!(
            outcome.report.completed_stages,
            vec![Stage::Triage, Stage::Data, Stage::Optimization, Stage::Reporting]
        );
    }

    #[tokio::test]
    async fn test_failures_are_contained_and_fallback_used() {
        let registry = StageRegistry::new()
            .with(Arc::new(Failing(Stage::Data)))
            .with(Arc::new(Panicking(Stage::Optimization)))
            .with(Arc::new(Slow(Stage::Actions)))
            .with(Arc::new(Failing(Stage::Reporting)));
        let c = controller(registry, Duration::from_millis(50));
        let request = ExecutionRequest::new("optimize cloud costs")
            .with_triage(TriageResult::sufficient("optimize cloud costs").with_action_required(true));

        let outcome = c
            .run(&user(), &request, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome.results.len(), 4);
        assert!(outcome.results.iter().all(|r| r.status == StageStatus::Failed));
        assert!(outcome.result(Stage::Optimization).unwrap().error.as_deref().unwrap().contains("panicked"));
        assert!(outcome.result(Stage::Actions).unwrap().error.as_deref().unwrap().contains("timed out"));
        assert_eq!(outcome.report.status, ReportStatus::Fallback);
        assert!(!outcome.report.summary.is_empty());
    }

    #[tokio::test]
    async fn test_missing_handler_and_invalid_report() {
        let registry = StageRegistry::new().with(Arc::new(Fixed(Stage::Reporting, json!({"insights": []}))));
        let c = controller(registry, Duration::from_secs(1));
        let outcome = c
            .run(&user(), &ExecutionRequest::new("hi"), &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome.plan.stages(), &[Stage::DataHelper, Stage::Reporting]);
        assert!(outcome.result(Stage::DataHelper).unwrap().error.as_deref().unwrap().contains("No handler"));
        assert_eq!(outcome.result(Stage::Reporting).unwrap().status, StageStatus::Failed);
        assert_eq!(outcome.report.status, ReportStatus::Fallback);
    }

    #[tokio::test]
    async fn test_explicit_stage_list_without_reporting() {
        let registry = StageRegistry::new().with(Arc::new(Fixed(Stage::Data, json!({"insights": ["x"]}))));
        let c = controller(registry, Duration::from_secs(1));
        let request = ExecutionRequest::new("anything").with_stages(vec![Stage::Data]);
        let outcome = c
            .run(&user(), &request, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome.plan.stages(), &[Stage::Data]);
        assert_eq!(outcome.report.status, ReportStatus::Fallback);
        assert_eq!(outcome.report.insights, vec!["x"]);
        assert_eq!(outcome.report.error.as_deref(), Some("reporting stage not planned"));
    }

    #[tokio::test]
    async fn test_hardened_dependency_skips_optimization() {
        let registry = StageRegistry::new()
            .with(Arc::new(Failing(Stage::Data)))
            .with(Arc::new(Fixed(Stage::Optimization, json!({"recommendations": ["b"]}))))
            .with(Arc::new(Fixed(Stage::Reporting, json!({"summary": "ok"}))));
        let mut c = controller(registry, Duration::from_secs(1));
        c.config.optimization_requires_data = true;
        let request = ExecutionRequest::new("optimize cloud costs")
            .with_triage(TriageResult::sufficient("optimize cloud costs"));

        let outcome = c
            .run(&user(), &request, &NoopObserver, &CancellationToken::new())
            .await;

        assert_eq!(outcome.result(Stage::Optimization).unwrap().status, StageStatus::Skipped);
        assert_eq!(outcome.report.status, ReportStatus::Success);
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_remaining_stages() {
        let registry = StageRegistry::new()
            .with(Arc::new(Fixed(Stage::DataHelper, json!({}))))
            .with(Arc::new(Fixed(Stage::Reporting, json!({"summary": "ok"}))));
        let c = controller(registry, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = c
            .run(&user(), &ExecutionRequest::new("x"), &NoopObserver, &cancel)
            .await;
        assert!(outcome.results.iter().all(|r| r.status == StageStatus::Skipped));
        assert_eq!(outcome.report.status, ReportStatus::Fallback);
    }
}
