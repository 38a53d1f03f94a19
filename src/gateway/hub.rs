//! Hub（中枢）：把认证、连接存活与执行引擎工厂接到一起
//!
//! 每条物理连接先经认证与上限接纳，之后的入站帧在这里分派：
//! ping/pong 由存活管理层就地处理，user_message / start_agent 交给该用户的执行引擎。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{AuthRequest, AuthenticationProvider, MetricsSink, NoopMetricsSink};
use crate::config::AppConfig;
use crate::core::{ApiaryError, Disposition, RecoveryEngine, ShutdownManager, ShutdownReason, UserContext};
use crate::engine::{ExecutionEngineFactory, FactoryConfig, RunState};
use crate::gateway::message::now_millis;
use crate::gateway::{CommunicationChannel, GatewayMessage, InboundMessage, ServerEvent};
use crate::llm::create_llm_from_config;
use crate::orchestration::{
    default_registry, ExecutionRequest, OrchestrationController, Stage, TriageResult,
};
use crate::presence::{
    run_heartbeat_with, CleanupReport, ConnectionBinding, ConnectionId, PresenceChannelSource, PresenceManager,
};

/// 入站帧的处理结果
#[derive(Debug)]
pub enum InboundDisposition {
    /// 在存活层处理完毕（ping / pong），未触达引擎
    Presence,
    /// 已派发到执行引擎
    Dispatched(JoinHandle<Result<RunState, ApiaryError>>),
    /// 已拒绝并向客户端回送 error 事件
    Rejected(String),
}

/// 已认证连接的会话信息；线程绑定只存在于存活记录中
struct Session {
    context: UserContext,
    channel: Arc<dyn CommunicationChannel>,
}

pub struct Hub {
    auth: Arc<dyn AuthenticationProvider>,
    presence: Arc<PresenceManager>,
    factory: Arc<ExecutionEngineFactory>,
    recovery: RecoveryEngine,
    metrics: Arc<dyn MetricsSink>,
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    shutdown: Arc<ShutdownManager>,
    sweep_interval: Duration,
}

impl Hub {
    pub fn new(
        auth: Arc<dyn AuthenticationProvider>,
        presence: Arc<PresenceManager>,
        factory: Arc<ExecutionEngineFactory>,
    ) -> Self {
        Self {
            auth,
            presence,
            factory,
            recovery: RecoveryEngine::new(),
            metrics: Arc::new(NoopMetricsSink),
            sessions: RwLock::new(HashMap::new()),
            shutdown: Arc::new(ShutdownManager::new()),
            sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownManager>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// 按配置装配：LLM → 阶段注册表 → 编排控制器 → 存活管理 → 引擎工厂
    pub fn from_config(
        config: &AppConfig,
        auth: Arc<dyn AuthenticationProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ApiaryError> {
        let llm = create_llm_from_config(&config.llm);
        let controller = Arc::new(OrchestrationController::from_config(
            &config.orchestration,
            default_registry(llm),
        )?);
        let presence = Arc::new(PresenceManager::from_config(&config.presence));
        let factory = ExecutionEngineFactory::builder()
            .config(FactoryConfig::try_from(&config.engine)?)
            .channel_source(Arc::new(PresenceChannelSource::new(presence.clone())))
            .controller(controller)
            .metrics(metrics.clone())
            .build()?;

        let mut hub = Self::new(auth, presence, Arc::new(factory)).with_metrics(metrics);
        hub.sweep_interval = Duration::from_secs(config.presence.cleanup_interval_secs.max(1));
        Ok(hub)
    }

    pub fn presence(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    pub fn factory(&self) -> &Arc<ExecutionEngineFactory> {
        &self.factory
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 认证并在每用户上限内接纳连接，随后下发 connection_established
    pub async fn connect(
        &self,
        request: &AuthRequest,
        channel: Arc<dyn CommunicationChannel>,
    ) -> Result<ConnectionId, ApiaryError> {
        let authed = self.auth.authenticate(request).await?;
        let connection_id = ConnectionId::generate();
        let context = UserContext::builder(authed.user_id(), authed.thread_id())
            .connection_id(connection_id.as_str())
            .metadata_map(authed.metadata().clone())
            .build()?;

        let binding = ConnectionBinding::new(context.user_id()).with_thread(context.thread_id());
        let admission = self
            .presence
            .admit_connection(connection_id.clone(), binding, Some(channel.clone()))
            .await?;
        if !admission.evicted.is_empty() {
            self.metrics
                .increment("hub.connections_evicted", admission.evicted.len() as u64);
            self.release_sessions(&admission.evicted).await;
        }

        self.sessions.write().await.insert(
            connection_id.clone(),
            Session {
                context: context.clone(),
                channel: channel.clone(),
            },
        );
        self.metrics.increment("hub.connections_accepted", 1);
        tracing::info!(
            connection_id = %connection_id,
            user_id = context.user_id(),
            evicted = admission.evicted.len(),
            "Connection accepted"
        );

        let welcome = GatewayMessage::new(ServerEvent::ConnectionEstablished {
            connection_id: connection_id.to_string(),
            user_id: context.user_id().to_string(),
            heartbeat_interval_secs: self.presence.config().heartbeat_interval.as_secs(),
        });
        if channel.send(&welcome).await.is_err() {
            self.presence.mark_dead(connection_id.as_str()).await;
        }
        Ok(connection_id)
    }

    /// 处理一条入站帧
    pub async fn handle_inbound(
        &self,
        connection_id: &ConnectionId,
        raw: &str,
    ) -> Result<InboundDisposition, ApiaryError> {
        let (context, channel) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(connection_id)
                .ok_or_else(|| ApiaryError::ConnectionNotFound(connection_id.to_string()))?;
            (session.context.clone(), session.channel.clone())
        };
        self.presence.record_activity(connection_id.as_str()).await;

        let message = match InboundMessage::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "Rejected inbound frame");
                self.reply(connection_id, &channel, GatewayMessage::error(e.code(), &e.to_string()))
                    .await;
                return Ok(InboundDisposition::Rejected(e.code().to_string()));
            }
        };

        match message {
            InboundMessage::Ping { timestamp } => {
                let pong = GatewayMessage::pong(timestamp.unwrap_or_else(now_millis));
                self.reply(connection_id, &channel, pong).await;
                Ok(InboundDisposition::Presence)
            }
            InboundMessage::Pong { .. } => {
                self.presence.record_pong(connection_id.as_str()).await;
                Ok(InboundDisposition::Presence)
            }
            InboundMessage::Auth { .. } => {
                self.reply(
                    connection_id,
                    &channel,
                    GatewayMessage::error("already_authenticated", "connection is already authenticated"),
                )
                .await;
                Ok(InboundDisposition::Rejected("already_authenticated".into()))
            }
            InboundMessage::UserMessage {
                content,
                thread_id,
                metadata,
            } => {
                let mut context_meta = context.metadata().clone();
                context_meta.extend(metadata);
                let request = ExecutionRequest::new(content);
                self.dispatch(connection_id, &channel, &context, thread_id, context_meta, request)
                    .await
            }
            InboundMessage::StartAgent {
                content,
                thread_id,
                triage,
                stages,
            } => {
                let request = start_request(content, triage, stages);
                self.dispatch(
                    connection_id,
                    &channel,
                    &context,
                    thread_id,
                    context.metadata().clone(),
                    request,
                )
                .await
            }
        }
    }

    async fn dispatch(
        &self,
        connection_id: &ConnectionId,
        channel: &Arc<dyn CommunicationChannel>,
        context: &UserContext,
        thread_id: Option<String>,
        metadata: BTreeMap<String, String>,
        request: ExecutionRequest,
    ) -> Result<InboundDisposition, ApiaryError> {
        let result = self
            .start_run(connection_id, context, thread_id, metadata, request)
            .await;
        match result {
            Ok(handle) => Ok(InboundDisposition::Dispatched(handle)),
            Err(e) => self.recover(connection_id, channel, e).await,
        }
    }

    async fn start_run(
        &self,
        connection_id: &ConnectionId,
        context: &UserContext,
        thread_id: Option<String>,
        metadata: BTreeMap<String, String>,
        request: ExecutionRequest,
    ) -> Result<JoinHandle<Result<RunState, ApiaryError>>, ApiaryError> {
        let bound_thread = self
            .presence
            .get_connection(connection_id.as_str())
            .await
            .and_then(|s| s.thread_id);
        let thread = thread_id
            .or(bound_thread)
            .unwrap_or_else(|| context.thread_id().to_string());
        self.presence.bind_thread(connection_id.as_str(), thread.clone()).await?;

        let run_context = UserContext::builder(context.user_id(), thread)
            .connection_id(connection_id.as_str())
            .metadata_map(metadata)
            .build()?;
        let engine = self.factory.get_or_create_for_user(&run_context).await?;
        self.metrics.increment("hub.runs_dispatched", 1);
        tracing::debug!(
            connection_id = %connection_id,
            engine_id = engine.id(),
            thread_id = run_context.thread_id(),
            "Dispatching run"
        );
        Ok(tokio::spawn(async move { engine.execute(request).await }))
    }

    async fn recover(
        &self,
        connection_id: &ConnectionId,
        channel: &Arc<dyn CommunicationChannel>,
        err: ApiaryError,
    ) -> Result<InboundDisposition, ApiaryError> {
        match self.recovery.handle(&err) {
            Disposition::Propagate { code, message } => {
                tracing::warn!(connection_id = %connection_id, code, error = %message, "Request rejected");
                self.reply(connection_id, channel, GatewayMessage::error(code, &message))
                    .await;
                Err(err)
            }
            Disposition::MarkConnectionDead(target) => {
                tracing::debug!(connection_id = %connection_id, target = %target, "Channel unusable");
                self.presence.mark_dead(connection_id.as_str()).await;
                Ok(InboundDisposition::Rejected(err.code().to_string()))
            }
            Disposition::Degrade(reason) => {
                tracing::warn!(connection_id = %connection_id, reason = %reason, "Request degraded");
                self.reply(connection_id, channel, GatewayMessage::error(err.code(), &reason))
                    .await;
                Ok(InboundDisposition::Rejected(err.code().to_string()))
            }
        }
    }

    /// 直接回送到该连接；写失败即判死
    async fn reply(
        &self,
        connection_id: &ConnectionId,
        channel: &Arc<dyn CommunicationChannel>,
        message: GatewayMessage,
    ) {
        if let Err(e) = channel.send(&message).await {
            tracing::debug!(connection_id = %connection_id, error = %e, "Reply failed");
            self.presence.mark_dead(connection_id.as_str()).await;
        }
    }

    /// 注销连接；该用户不再有任何连接时回收其全部引擎
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        let session = self.sessions.write().await.remove(connection_id);
        let snapshot = self.presence.unregister_connection(connection_id.as_str()).await;
        let Some(user_id) = session
            .map(|s| s.context.user_id().to_string())
            .or(snapshot.map(|s| s.user_id))
        else {
            return false;
        };

        if self.presence.connections_for_user(&user_id).await.is_empty() {
            let released = self.factory.cleanup_user_engines(&user_id).await;
            tracing::info!(user_id = %user_id, released, "Last connection closed, engines released");
        }
        tracing::info!(connection_id = %connection_id, user_id = %user_id, "Connection closed");
        true
    }

    /// 移除已被存活层丢弃的连接会话并关闭其传输；用户因此不再有连接时回收其引擎
    async fn release_sessions(&self, ids: &[ConnectionId]) -> usize {
        let released: Vec<Session> = {
            let mut sessions = self.sessions.write().await;
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut users = BTreeSet::new();
        for session in &released {
            session.channel.close().await;
            users.insert(session.context.user_id().to_string());
        }
        for user_id in users {
            if self.presence.connections_for_user(&user_id).await.is_empty() {
                let engines = self.factory.cleanup_user_engines(&user_id).await;
                tracing::info!(user_id = %user_id, engines, "No live connections left, engines released");
            }
        }
        if !released.is_empty() {
            tracing::debug!(sessions = released.len(), "Dropped sessions of removed connections");
        }
        released.len()
    }

    /// 清理陈旧的 DEAD 连接，并同步释放对应会话
    pub async fn sweep_stale_connections(&self) -> CleanupReport {
        self.sweep_stale_connections_at(Utc::now()).await
    }

    pub async fn sweep_stale_connections_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let report = self.presence.cleanup_stale_data_at(now).await;
        if !report.removed_ids.is_empty() {
            self.metrics
                .increment("hub.connections_swept", report.removed_ids.len() as u64);
            self.release_sessions(&report.removed_ids).await;
        }
        report
    }

    /// 启动心跳循环，随关闭信号停止；清理节拍走 `sweep_stale_connections`
    pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::downgrade(self);
        let token = self.shutdown.token().child_token();
        tokio::spawn(run_heartbeat_with(self.presence.clone(), token, move || {
            let hub = hub.clone();
            async move {
                match hub.upgrade() {
                    Some(hub) => hub.sweep_stale_connections().await,
                    None => CleanupReport::default(),
                }
            }
        }))
    }

    /// 启动空闲引擎回收循环
    pub fn start_engine_sweeper(&self) -> JoinHandle<()> {
        let factory = self.factory.clone();
        let token: CancellationToken = self.shutdown.token().child_token();
        tokio::spawn(factory.run_idle_sweeper(self.sweep_interval, token))
    }

    /// 停止后台任务，释放全部引擎与连接
    pub async fn shutdown(&self) {
        if !self.shutdown.is_shutdown() {
            self.shutdown.shutdown(ShutdownReason::Requested);
        }
        let engines = self.factory.cleanup_all().await;
        self.sessions.write().await.clear();
        let connections = self.presence.clear_all().await;
        tracing::info!(engines, connections, "Hub stopped");
    }
}

fn start_request(content: String, triage: Option<TriageResult>, stages: Option<Vec<Stage>>) -> ExecutionRequest {
    let mut request = ExecutionRequest::new(content);
    if let Some(triage) = triage {
        request = request.with_triage(triage);
    }
    if let Some(stages) = stages {
        request = request.with_stages(stages);
    }
    request
}
