//! 动态阶段编排：分诊、规划、依赖门控、逐阶段执行与降级报告

pub mod controller;
pub mod fallback;
pub mod handlers;
pub mod plan;
pub mod stage;

pub use controller::{ControllerConfig, ExecutionRequest, OrchestrationController, OrchestrationOutcome};
pub use fallback::{FallbackReportBuilder, Report, ReportStatus};
pub use handlers::{default_registry, parse_stage_output, LlmStageHandler};
pub use plan::{DataSufficiency, Intent, PlanSource, StagePlan, StagePlanner, TriageResult};
pub use stage::{
    NoopObserver, RunObserver, Stage, StageContext, StageDependencies, StageHandler, StageRegistry,
    StageResult, StageStatus,
};
