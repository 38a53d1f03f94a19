//! 执行引擎工厂
//!
//! 每次创建都返回全新实例（新的运行表、统计与通道），不存在全局默认引擎；
//! 工厂自身的计数只属于该工厂实例。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{MemoryPersistence, MetricsSink, NoopMetricsSink, PersistenceProvider};
use crate::config::EngineSection;
use crate::core::{ApiaryError, UserContext};
use crate::engine::execution::EngineParts;
use crate::engine::ExecutionEngine;
use crate::gateway::ChannelSource;
use crate::orchestration::OrchestrationController;

/// 引擎发放策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePolicy {
    /// 同一用户同一线程复用存活引擎
    #[default]
    PerUser,
    /// 每个请求一个新引擎
    PerRequest,
}

impl FromStr for EnginePolicy {
    type Err = ApiaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_user" | "user" => Ok(EnginePolicy::PerUser),
            "per_request" | "request" => Ok(EnginePolicy::PerRequest),
            other => Err(ApiaryError::Configuration(format!("unknown engine policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FactoryConfig {
    pub policy: EnginePolicy,
    pub max_active_engines: usize,
    pub max_concurrent_runs: usize,
    pub idle_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            policy: EnginePolicy::PerUser,
            max_active_engines: 1000,
            max_concurrent_runs: 5,
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

impl TryFrom<&EngineSection> for FactoryConfig {
    type Error = ApiaryError;

    fn try_from(section: &EngineSection) -> Result<Self, Self::Error> {
        Ok(Self {
            policy: section.policy.parse()?,
            max_active_engines: section.max_active_engines,
            max_concurrent_runs: section.max_concurrent_runs,
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
        })
    }
}

/// 工厂指标快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryMetrics {
    pub factory_id: String,
    pub total_created: u64,
    pub active: usize,
    pub cleaned_up: u64,
    pub reused: u64,
    pub creation_failures: u64,
}

#[derive(Debug, Default)]
struct FactoryCounters {
    total_created: AtomicU64,
    cleaned_up: AtomicU64,
    reused: AtomicU64,
    creation_failures: AtomicU64,
}

pub struct ExecutionEngineFactory {
    id: String,
    config: FactoryConfig,
    channel_source: Arc<dyn ChannelSource>,
    controller: Arc<OrchestrationController>,
    persistence: Arc<dyn PersistenceProvider>,
    metrics: Arc<dyn MetricsSink>,
    engines: RwLock<HashMap<String, Arc<ExecutionEngine>>>,
    counters: FactoryCounters,
}

/// 工厂构建器；缺少通道来源或编排控制器时 build 失败
#[derive(Default)]
pub struct ExecutionEngineFactoryBuilder {
    config: FactoryConfig,
    channel_source: Option<Arc<dyn ChannelSource>>,
    controller: Option<Arc<OrchestrationController>>,
    persistence: Option<Arc<dyn PersistenceProvider>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ExecutionEngineFactoryBuilder {
    pub fn config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn channel_source(mut self, source: Arc<dyn ChannelSource>) -> Self {
        self.channel_source = Some(source);
        self
    }

    pub fn controller(mut self, controller: Arc<OrchestrationController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceProvider>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ExecutionEngineFactory, ApiaryError> {
        let channel_source = self
            .channel_source
            .ok_or_else(|| ApiaryError::Configuration("engine factory requires a channel source".into()))?;
        let controller = self.controller.ok_or_else(|| {
            ApiaryError::Configuration("engine factory requires an orchestration controller".into())
        })?;
        if self.config.max_active_engines == 0 {
            return Err(ApiaryError::Configuration("max_active_engines must be positive".into()));
        }
        if self.config.max_concurrent_runs == 0 {
            return Err(ApiaryError::Configuration("max_concurrent_runs must be positive".into()));
        }

        let factory = ExecutionEngineFactory {
            id: format!("fac_{}", uuid::Uuid::new_v4().simple()),
            config: self.config,
            channel_source,
            controller,
            persistence: self
                .persistence
                .unwrap_or_else(|| Arc::new(MemoryPersistence::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetricsSink)),
            engines: RwLock::new(HashMap::new()),
            counters: FactoryCounters::default(),
        };
        tracing::info!(
            factory_id = %factory.id,
            policy = ?factory.config.policy,
            max_active_engines = factory.config.max_active_engines,
            "Engine factory ready"
        );
        Ok(factory)
    }
}

impl ExecutionEngineFactory {
    pub fn builder() -> ExecutionEngineFactoryBuilder {
        ExecutionEngineFactoryBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// 为该上下文创建全新引擎；达到上限时返回 Capacity 错误
    pub async fn create_for_user(&self, context: &UserContext) -> Result<Arc<ExecutionEngine>, ApiaryError> {
        let mut engines = self.engines.write().await;
        self.create_locked(&mut engines, context)
    }

    /// 按策略复用或新建
    pub async fn get_or_create_for_user(&self, context: &UserContext) -> Result<Arc<ExecutionEngine>, ApiaryError> {
        let mut engines = self.engines.write().await;
        if self.config.policy == EnginePolicy::PerUser {
            let existing = engines.values().find(|e| {
                !e.is_closed()
                    && e.context().user_id() == context.user_id()
                    && e.context().thread_id() == context.thread_id()
            });
            if let Some(engine) = existing {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment("factory.engines_reused", 1);
                return Ok(engine.clone());
            }
        }
        self.create_locked(&mut engines, context)
    }

    fn create_locked(
        &self,
        engines: &mut HashMap<String, Arc<ExecutionEngine>>,
        context: &UserContext,
    ) -> Result<Arc<ExecutionEngine>, ApiaryError> {
        if engines.len() >= self.config.max_active_engines {
            self.counters.creation_failures.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment("factory.creation_failures", 1);
            tracing::warn!(
                factory_id = %self.id,
                user_id = context.user_id(),
                active = engines.len(),
                "Engine capacity reached"
            );
            return Err(ApiaryError::capacity(
                context.user_id(),
                format!("{} engines already active", engines.len()),
            ));
        }

        let engine = Arc::new(ExecutionEngine::new(EngineParts {
            context: context.clone(),
            channel: self.channel_source.open_channel(context),
            controller: self.controller.clone(),
            persistence: self.persistence.clone(),
            metrics: self.metrics.clone(),
            max_concurrent_runs: self.config.max_concurrent_runs,
        }));
        engines.insert(engine.id().to_string(), engine.clone());
        self.counters.total_created.fetch_add(1, Ordering::Relaxed);
        self.metrics.increment("factory.engines_created", 1);
        tracing::info!(
            factory_id = %self.id,
            engine_id = engine.id(),
            user_id = context.user_id(),
            thread_id = context.thread_id(),
            "Engine created"
        );
        Ok(engine)
    }

    pub async fn get_engine(&self, engine_id: &str) -> Option<Arc<ExecutionEngine>> {
        self.engines.read().await.get(engine_id).cloned()
    }

    pub async fn engines_for_user(&self, user_id: &str) -> Vec<Arc<ExecutionEngine>> {
        self.engines
            .read()
            .await
            .values()
            .filter(|e| e.user_id() == user_id)
            .cloned()
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.engines.read().await.len()
    }

    /// 释放引擎；已释放过的返回 false
    pub async fn cleanup_engine(&self, engine: &ExecutionEngine) -> bool {
        let removed = self.engines.write().await.remove(engine.id());
        engine.shutdown().await;
        match removed {
            Some(_) => {
                self.record_cleanup(1);
                true
            }
            None => false,
        }
    }

    pub async fn cleanup_user_engines(&self, user_id: &str) -> usize {
        self.remove_where(|e| e.user_id() == user_id).await
    }

    pub async fn cleanup_idle_engines(&self, max_idle: Duration) -> usize {
        self.cleanup_idle_engines_at(max_idle, Utc::now()).await
    }

    /// 以给定时刻判定空闲；运行中的引擎不回收
    pub async fn cleanup_idle_engines_at(&self, max_idle: Duration, now: DateTime<Utc>) -> usize {
        self.remove_where(|e| !e.is_busy() && e.idle_for(now) > max_idle)
            .await
    }

    pub async fn cleanup_all(&self) -> usize {
        self.remove_where(|_| true).await
    }

    async fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ExecutionEngine) -> bool,
    {
        let removed: Vec<Arc<ExecutionEngine>> = {
            let mut engines = self.engines.write().await;
            let ids: Vec<String> = engines
                .values()
                .filter(|e| {
                    let engine: &ExecutionEngine = e;
                    predicate(engine)
                })
                .map(|e| e.id().to_string())
                .collect();
            ids.iter().filter_map(|id| engines.remove(id)).collect()
        };
        for engine in &removed {
            engine.shutdown().await;
        }
        self.record_cleanup(removed.len());
        removed.len()
    }

    fn record_cleanup(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.counters
            .cleaned_up
            .fetch_add(count as u64, Ordering::Relaxed);
        self.metrics.increment("factory.engines_cleaned_up", count as u64);
        tracing::info!(factory_id = %self.id, count, "Engines cleaned up");
    }

    pub async fn get_factory_metrics(&self) -> FactoryMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FactoryMetrics {
            factory_id: self.id.clone(),
            total_created: load(&self.counters.total_created),
            active: self.engines.read().await.len(),
            cleaned_up: load(&self.counters.cleaned_up),
            reused: load(&self.counters.reused),
            creation_failures: load(&self.counters.creation_failures),
        }
    }

    /// 周期性回收空闲引擎，直到 cancel
    pub async fn run_idle_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {
                    let removed = self.cleanup_idle_engines(self.config.idle_timeout).await;
                    if removed > 0 {
                        tracing::info!(removed, "Idle engines reclaimed");
                    }
                }
            }
        }
    }
}
