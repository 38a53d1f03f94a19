//! 动态阶段规划与降级报告集成测试

use std::sync::Arc;

use apiary::config::KeywordSection;
use apiary::core::{StageError, UserContext};
use apiary::llm::MockLlmClient;
use apiary::orchestration::{
    default_registry, ControllerConfig, DataSufficiency, ExecutionRequest, NoopObserver,
    OrchestrationController, ReportStatus, Stage, StageContext, StageHandler, StagePlanner,
    StageStatus, TriageResult,
};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn controller(llm: MockLlmClient) -> OrchestrationController {
    OrchestrationController::new(
        default_registry(Arc::new(llm)),
        StagePlanner::new(&KeywordSection::default()).unwrap(),
        ControllerConfig::default(),
    )
}

#[test]
fn test_no_triage_plans_data_helper_then_reporting() {
    let plan = controller(MockLlmClient::new()).determine_plan(None);
    assert_eq!(plan.stages(), &[Stage::DataHelper, Stage::Reporting]);
}

#[test]
fn test_cloud_cost_request_plans_full_pipeline() {
    let triage = TriageResult::sufficient("optimize cloud costs").with_action_required(true);
    let plan = controller(MockLlmClient::new()).determine_plan(Some(&triage));
    assert_eq!(
        plan.stages(),
        &[Stage::Data, Stage::Optimization, Stage::Actions, Stage::Reporting]
    );
}

#[test]
fn test_insufficient_data_never_plans_analysis() {
    let triage = TriageResult::sufficient("optimize cloud costs")
        .with_sufficiency(DataSufficiency::Insufficient)
        .with_action_required(true);
    let plan = controller(MockLlmClient::new()).determine_plan(Some(&triage));
    assert_eq!(plan.stages(), &[Stage::DataHelper, Stage::Reporting]);
}

#[tokio::test]
async fn test_all_stages_failing_yields_fallback_report() {
    let llm = MockLlmClient::new()
        .failing_on("data")
        .failing_on("optimization")
        .failing_on("actions")
        .failing_on("reporting");
    let controller = controller(llm);
    let user = UserContext::new("alice", "t1").unwrap();
    let triage = TriageResult::sufficient("optimize cloud costs").with_action_required(true);
    let request = ExecutionRequest::new("optimize cloud costs").with_triage(triage);

    let outcome = controller
        .run(&user, &request, &NoopObserver, &CancellationToken::new())
        .await;

    assert_eq!(outcome.report.status, ReportStatus::Fallback);
    assert!(!outcome.report.summary.trim().is_empty());
    for stage in [Stage::Data, Stage::Optimization, Stage::Actions, Stage::Reporting] {
        assert_eq!(outcome.result(stage).unwrap().status, StageStatus::Failed);
    }
}

struct SlowReporting;

#[async_trait]
impl StageHandler for SlowReporting {
    fn stage(&self) -> Stage {
        Stage::Reporting
    }

    async fn run(&self, _ctx: &StageContext<'_>) -> Result<Value, StageError> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_cancelled_run_still_reports() {
    let registry = default_registry(Arc::new(MockLlmClient::new())).with(Arc::new(SlowReporting));
    let controller = OrchestrationController::new(
        registry,
        StagePlanner::new(&KeywordSection::default()).unwrap(),
        ControllerConfig::default(),
    );
    let user = UserContext::new("alice", "t1").unwrap();
    let request = ExecutionRequest::new("hello").with_triage(TriageResult::sufficient("hello"));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = controller.run(&user, &request, &NoopObserver, &cancel).await;
    assert_eq!(outcome.report.status, ReportStatus::Fallback);
    assert!(!outcome.report.summary.is_empty());
}
