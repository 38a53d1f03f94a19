//! 底座配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `APIARY__*` 覆盖（双下划线表示嵌套，如 `APIARY__PRESENCE__MAX_CONNECTIONS_PER_USER=8`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [presence] 段：心跳节奏、死亡判定、每用户连接上限与紧急回收时限
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 距上次活动超过该时长视为一次错过的心跳
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// DEAD 连接在被物理清理前可被复活的宽限期
    #[serde(default = "default_dead_grace_secs")]
    pub dead_grace_secs: u64,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_eviction_timeout_secs")]
    pub eviction_timeout_secs: u64,
    #[serde(default = "default_eviction_poll_ms")]
    pub eviction_poll_ms: u64,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}

fn default_max_missed_heartbeats() -> u32 {
    2
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_dead_grace_secs() -> u64 {
    120
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_eviction_timeout_secs() -> u64 {
    30
}

fn default_eviction_poll_ms() -> u64 {
    250
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            dead_grace_secs: default_dead_grace_secs(),
            max_connections_per_user: default_max_connections_per_user(),
            eviction_timeout_secs: default_eviction_timeout_secs(),
            eviction_poll_ms: default_eviction_poll_ms(),
        }
    }
}

/// [engine] 段：引擎发放策略与容量
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// per_user（同用户同线程复用）/ per_request（每次新建）
    #[serde(default = "default_engine_policy")]
    pub policy: String,
    #[serde(default = "default_max_active_engines")]
    pub max_active_engines: usize,
    /// 单引擎并发运行数
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_engine_policy() -> String {
    "per_user".to_string()
}

fn default_max_active_engines() -> usize {
    1000
}

fn default_max_concurrent_runs() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    1800
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            policy: default_engine_policy(),
            max_active_engines: default_max_active_engines(),
            max_concurrent_runs: default_max_concurrent_runs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// [orchestration] 段：阶段超时、依赖硬化、意图关键词
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestrationSection {
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// 为 true 时 OPTIMIZATION 必须等 DATA 成功
    #[serde(default)]
    pub optimization_requires_data: bool,
    #[serde(default)]
    pub keywords: KeywordSection,
}

fn default_stage_timeout_secs() -> u64 {
    120
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            optimization_requires_data: false,
            keywords: KeywordSection::default(),
        }
    }
}

/// [orchestration.keywords] 段：按词首匹配、大小写不敏感
#[derive(Debug, Clone, Deserialize)]
pub struct KeywordSection {
    #[serde(default = "default_analysis_keywords")]
    pub analysis: Vec<String>,
    #[serde(default = "default_optimization_keywords")]
    pub optimization: Vec<String>,
    #[serde(default = "default_action_keywords")]
    pub actions: Vec<String>,
}

fn default_analysis_keywords() -> Vec<String> {
    [
        "analy", "usage", "data", "trend", "pattern", "metric", "cost", "spend",
        "consumption", "performance", "utiliz", "breakdown", "billing",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_optimization_keywords() -> Vec<String> {
    [
        "optimi", "cost", "efficien", "sav", "reduc", "cheap", "budget", "spend",
        "waste", "rightsiz", "latency", "throughput",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_action_keywords() -> Vec<String> {
    [
        "how to", "how do", "how can", "implement", "step", "action", "recommend",
        "guide", "configure", "set up", "setup", "fix", "what should",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for KeywordSection {
    fn default() -> Self {
        Self {
            analysis: default_analysis_keywords(),
            optimization: default_optimization_keywords(),
            actions: default_action_keywords(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [gateway] 段：监听地址与单连接发送缓冲
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:9100".to_string()
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 APIARY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 APIARY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("APIARY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
