//! 单用户执行引擎
//!
//! 每个引擎独占自己的 UserContext、运行表、统计与通道实例；引擎之间不共享任何可变状态。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::collaborators::{MetricsSink, PersistenceProvider, RunRecord};
use crate::core::{ApiaryError, UserContext};
use crate::gateway::{CommunicationChannel, GatewayMessage, ServerEvent};
use crate::llm::Role;
use crate::orchestration::{
    ExecutionRequest, OrchestrationController, Report, ReportStatus, RunObserver, Stage, StagePlan,
    StageResult, StageStatus, TriageResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 单次运行的状态槽
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub request_id: String,
    pub status: RunStatus,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub triage: Option<TriageResult>,
    pub plan: Option<StagePlan>,
    pub report: Option<Report>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn new(context: &UserContext) -> Self {
        Self {
            run_id: context.run_id().to_string(),
            request_id: context.request_id().to_string(),
            status: RunStatus::Pending,
            stage_results: BTreeMap::new(),
            triage: None,
            plan: None,
            report: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn report_status(&self) -> Option<ReportStatus> {
        self.report.as_ref().map(|r| r.status)
    }
}

/// 引擎计数器（每个引擎一份）
#[derive(Debug, Default)]
pub struct EngineStats {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    stage_failures: AtomicU64,
    fallback_reports: AtomicU64,
    events_sent: AtomicU64,
    delivery_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub stage_failures: u64,
    pub fallback_reports: u64,
    pub events_sent: u64,
    pub delivery_failures: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            runs_started: load(&self.runs_started),
            runs_completed: load(&self.runs_completed),
            runs_failed: load(&self.runs_failed),
            stage_failures: load(&self.stage_failures),
            fallback_reports: load(&self.fallback_reports),
            events_sent: load(&self.events_sent),
            delivery_failures: load(&self.delivery_failures),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// 引擎构造所需的协作者（由工厂注入）
pub(crate) struct EngineParts {
    pub context: UserContext,
    pub channel: Arc<dyn CommunicationChannel>,
    pub controller: Arc<OrchestrationController>,
    pub persistence: Arc<dyn PersistenceProvider>,
    pub metrics: Arc<dyn MetricsSink>,
    pub max_concurrent_runs: usize,
}

pub struct ExecutionEngine {
    id: String,
    context: UserContext,
    channel: RwLock<Option<Arc<dyn CommunicationChannel>>>,
    active_runs: Arc<RwLock<HashMap<String, RunState>>>,
    stats: Arc<EngineStats>,
    controller: Arc<OrchestrationController>,
    persistence: Arc<dyn PersistenceProvider>,
    metrics: Arc<dyn MetricsSink>,
    run_slots: Arc<Semaphore>,
    max_runs: usize,
    cancel: CancellationToken,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
}

impl ExecutionEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        let now = Utc::now();
        Self {
            id: format!("eng_{}", uuid::Uuid::new_v4().simple()),
            context: parts.context,
            channel: RwLock::new(Some(parts.channel)),
            active_runs: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(EngineStats::default()),
            controller: parts.controller,
            persistence: parts.persistence,
            metrics: parts.metrics,
            run_slots: Arc::new(Semaphore::new(parts.max_concurrent_runs.max(1))),
            max_runs: parts.max_concurrent_runs.max(1),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            created_at: now,
            last_active: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &UserContext {
        &self.context
    }

    pub fn user_id(&self) -> &str {
        self.context.user_id()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_active())
            .to_std()
            .unwrap_or_default()
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_active.lock() {
            *t = Utc::now();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 是否有运行占用并发槽
    pub fn is_busy(&self) -> bool {
        self.run_slots.available_permits() < self.max_runs
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn channel(&self) -> Option<Arc<dyn CommunicationChannel>> {
        self.channel.read().await.clone()
    }

    pub async fn get_run(&self, run_id: &str) -> Option<RunState> {
        self.active_runs.read().await.get(run_id).cloned()
    }

    pub async fn active_run_count(&self) -> usize {
        self.active_runs.read().await.len()
    }

    /// 结构上是否与另一引擎共享运行表、统计或通道实例（按指针比较）
    pub async fn shares_state_with(&self, other: &ExecutionEngine) -> bool {
        if Arc::ptr_eq(&self.active_runs, &other.active_runs) || Arc::ptr_eq(&self.stats, &other.stats) {
            return true;
        }
        match (self.channel().await, other.channel().await) {
            (Some(a), Some(b)) => std::ptr::eq(
                Arc::as_ptr(&a) as *const (),
                Arc::as_ptr(&b) as *const (),
            ),
            _ => false,
        }
    }

    /// 执行一次请求：派生新 run_id，委托编排控制器，逐阶段写入结果槽，返回最终状态
    pub async fn execute(&self, request: ExecutionRequest) -> Result<RunState, ApiaryError> {
        if self.is_closed() {
            return Err(ApiaryError::EngineClosed(self.id.clone()));
        }
        let _permit = self
            .run_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiaryError::EngineClosed(self.id.clone()))?;

        let run_ctx = self.context.child()?;
        let run_id = run_ctx.run_id().to_string();
        let started = Instant::now();
        self.touch();

        let mut slot = RunState::new(&run_ctx);
        slot.status = RunStatus::Running;
        self.active_runs.write().await.insert(run_id.clone(), slot);
        bump(&self.stats.runs_started);
        self.metrics.increment("engine.runs_started", 1);
        tracing::info!(
            engine_id = %self.id,
            user_id = run_ctx.user_id(),
            run_id = %run_id,
            "Run started"
        );

        if let Err(e) = self
            .persistence
            .append_message(run_ctx.thread_id(), Role::User, &request.content)
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to persist user message");
        }

        let cancel = self.cancel.child_token();
        let observer = EngineRunObserver {
            engine: self,
            thread_id: run_ctx.thread_id(),
            run_id: &run_id,
        };
        let outcome = self
            .controller
            .run(&run_ctx, &request, &observer, &cancel)
            .await;

        let mut state = self
            .active_runs
            .write()
            .await
            .remove(&run_id)
            .unwrap_or_else(|| RunState::new(&run_ctx));
        for result in &outcome.results {
            state.stage_results.insert(result.stage, result.clone());
        }
        state.status = if cancel.is_cancelled() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.triage = outcome.triage;
        state.plan = Some(outcome.plan);
        state.report = Some(outcome.report.clone());
        state.finished_at = Some(Utc::now());

        match state.status {
            RunStatus::Failed => bump(&self.stats.runs_failed),
            _ => bump(&self.stats.runs_completed),
        }
        if outcome.report.status == ReportStatus::Fallback {
            bump(&self.stats.fallback_reports);
            self.metrics.increment("engine.fallback_reports", 1);
        }
        self.metrics.timing("engine.run_duration", started.elapsed());

        self.emit(GatewayMessage::for_run(
            run_ctx.thread_id(),
            &run_id,
            ServerEvent::AgentCompleted {
                status: outcome.report.status,
                report: outcome.report.clone(),
            },
        ))
        .await;

        self.persist(&run_ctx, &state).await;
        self.touch();
        tracing::info!(
            engine_id = %self.id,
            run_id = %run_id,
            status = ?state.status,
            report = ?outcome.report.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(state)
    }

    async fn persist(&self, run_ctx: &UserContext, state: &RunState) {
        if let Some(report) = &state.report {
            if let Err(e) = self
                .persistence
                .append_message(run_ctx.thread_id(), Role::Assistant, &report.summary)
                .await
            {
                tracing::warn!(run_id = %state.run_id, error = %e, "Failed to persist report message");
            }
        }

        let record = RunRecord {
            run_id: state.run_id.clone(),
            request_id: state.request_id.clone(),
            user_id: run_ctx.user_id().to_string(),
            thread_id: run_ctx.thread_id().to_string(),
            engine_id: self.id.clone(),
            status: format!("{:?}", state.status).to_lowercase(),
            plan: state.plan.clone(),
            stage_results: state.stage_results.values().cloned().collect(),
            report: state.report.clone(),
            started_at: state.started_at,
            finished_at: state.finished_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = self.persistence.save_run(record).await {
            tracing::warn!(run_id = %state.run_id, error = %e, "Failed to persist run");
        }
    }

    /// 推送事件；失败只计数，不中断运行
    async fn emit(&self, message: GatewayMessage) {
        let Some(channel) = self.channel().await else {
            bump(&self.stats.delivery_failures);
            return;
        };
        match channel.send(&message).await {
            Ok(()) => bump(&self.stats.events_sent),
            Err(e) => {
                bump(&self.stats.delivery_failures);
                self.metrics.increment("engine.delivery_failures", 1);
                tracing::debug!(engine_id = %self.id, kind = message.kind(), error = %e, "Event delivery failed");
            }
        }
    }

    async fn record_stage(&self, run_id: &str, result: &StageResult) {
        if result.status == StageStatus::Failed {
            bump(&self.stats.stage_failures);
        }
        if let Some(state) = self.active_runs.write().await.get_mut(run_id) {
            state.stage_results.insert(result.stage, result.clone());
        }
    }

    /// 取消进行中的运行、释放运行表与通道；可重复调用
    pub async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        self.run_slots.close();
        let released = self.active_runs.write().await.drain().count();
        if let Some(channel) = self.channel.write().await.take() {
            channel.close().await;
        }
        tracing::info!(
            engine_id = %self.id,
            user_id = self.context.user_id(),
            released_runs = released,
            "Engine shut down"
        );
        true
    }
}

struct EngineRunObserver<'a> {
    engine: &'a ExecutionEngine,
    thread_id: &'a str,
    run_id: &'a str,
}

impl<'a> EngineRunObserver<'a> {
    async fn send(&self, event: ServerEvent) {
        self.engine
            .emit(GatewayMessage::for_run(self.thread_id, self.run_id, event))
            .await;
    }
}

#[async_trait]
impl<'a> RunObserver for EngineRunObserver<'a> {
    async fn stage_started(&self, stage: Stage) {
        self.send(ServerEvent::StageStarted { stage }).await;
    }

    async fn stage_thinking(&self, stage: Stage, message: &str) {
        self.send(ServerEvent::StageThinking {
            stage,
            content: message.to_string(),
        })
        .await;
    }

    async fn tool_executing(&self, stage: Stage, tool: &str, input: &Value) {
        self.send(ServerEvent::ToolExecuting {
            stage,
            tool_name: tool.to_string(),
            arguments: input.clone(),
        })
        .await;
    }

    async fn tool_completed(&self, stage: Stage, tool: &str, success: bool, summary: &str) {
        self.send(ServerEvent::ToolCompleted {
            stage,
            tool_name: tool.to_string(),
            success,
            summary: summary.to_string(),
        })
        .await;
    }

    async fn stage_finished(&self, result: &StageResult) {
        self.engine.record_stage(self.run_id, result).await;
        self.send(ServerEvent::StageCompleted {
            stage: result.stage,
            status: result.status,
            error: result.error.clone(),
            duration_ms: result.duration_ms,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryPersistence, NoopMetricsSink};
    use crate::config::KeywordSection;
    use crate::gateway::MemoryChannel;
    use crate::llm::MockLlmClient;
    use crate::orchestration::{default_registry, ControllerConfig, StagePlanner};

    fn engine(channel: Arc<MemoryChannel>, persistence: Arc<MemoryPersistence>) -> ExecutionEngine {
        let controller = OrchestrationController::new(
            default_registry(Arc::new(MockLlmClient::new())),
            StagePlanner::new(&KeywordSection::default()).unwrap(),
            ControllerConfig::default(),
        );
        ExecutionEngine::new(EngineParts {
            context: UserContext::new("alice", "t1").unwrap(),
            channel,
            controller: Arc::new(controller),
            persistence,
            metrics: Arc::new(NoopMetricsSink),
            max_concurrent_runs: 2,
        })
    }

    #[tokio::test]
    async fn test_execute_streams_events_and_persists() {
        let channel = Arc::new(MemoryChannel::new("c1"));
        let persistence = Arc::new(MemoryPersistence::new());
        let engine = engine(channel.clone(), persistence.clone());

        let state = engine
            .execute(ExecutionRequest::new("How do I optimize cloud costs?"))
            .await
            .unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_ne!(state.run_id, engine.context().run_id());
        assert!(state.stage_results.contains_key(&Stage::Triage));
        assert!(state.stage_results.contains_key(&Stage::Reporting));
        assert_eq!(state.report_status(), Some(ReportStatus::Success));
        assert_eq!(engine.active_run_count().await, 0);

        let kinds = channel.kinds();
        assert_eq!(kinds.first(), Some(&"stage_started"));
        assert_eq!(kinds.last(), Some(&"agent_completed"));
        assert!(kinds.contains(&"tool_executing"));

        let stats = engine.stats();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.delivery_failures, 0);
        assert_eq!(persistence.run_count().await, 1);
        assert_eq!(persistence.thread_history("t1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delivery_failures_do_not_fail_run() {
        let channel = Arc::new(MemoryChannel::new("c1"));
        channel.close().await;
        let engine = engine(channel, Arc::new(MemoryPersistence::new()));

        let state = engine.execute(ExecutionRequest::new("hello")).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(engine.stats().delivery_failures > 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_runs() {
        let channel = Arc::new(MemoryChannel::new("c1"));
        let engine = engine(channel.clone(), Arc::new(MemoryPersistence::new()));

        assert!(engine.shutdown().await);
        assert!(!engine.shutdown().await);
        assert!(engine.is_closed());
        assert!(channel.is_closed());
        assert!(engine.channel().await.is_none());
        assert!(matches!(
            engine.execute(ExecutionRequest::new("x")).await,
            Err(ApiaryError::EngineClosed(_))
        ));
    }
}
