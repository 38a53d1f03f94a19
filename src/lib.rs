//! Apiary - 多租户实时智能体编排底座
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 用户上下文、错误分类与恢复、优雅关闭
//! - **collaborators**: 认证 / 持久化 / 指标 协作者契约与进程内实现
//! - **engine**: 执行引擎工厂与每用户隔离的执行引擎
//! - **presence**: 连接心跳、死亡与复活、每用户上限与紧急回收
//! - **orchestration**: 分诊、动态阶段规划、逐阶段执行与降级报告
//! - **gateway**: 消息协议、通信通道、Hub 分派（feature `gateway` 附带 WebSocket 监听）
//! - **llm**: 阶段处理器调用的 LLM 客户端（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化

pub mod collaborators;
pub mod config;
pub mod core;
pub mod engine;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod orchestration;
pub mod presence;

pub use crate::core::{ApiaryError, UserContext};
pub use engine::{ExecutionEngine, ExecutionEngineFactory};
pub use gateway::Hub;
pub use orchestration::OrchestrationController;
pub use presence::PresenceManager;
