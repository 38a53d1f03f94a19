//! 用户执行上下文：每个请求一份、入口创建、下游只读
//!
//! 构造时校验：拒绝占位 ID、跨用户父上下文以及出现环的祖先链。

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::ApiaryError;

/// 被视为「未初始化」的占位标识
const PLACEHOLDER_IDS: &[&str] = &[
    "none",
    "null",
    "undefined",
    "registry",
    "placeholder",
    "default",
    "temp",
];

const MAX_ID_LEN: usize = 256;

/// 祖先链最大深度
pub const MAX_ANCESTRY_DEPTH: usize = 64;

/// 不可变的用户上下文（身份 + 关联信息）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserContext {
    user_id: String,
    thread_id: String,
    run_id: String,
    request_id: String,
    connection_id: Option<String>,
    metadata: BTreeMap<String, String>,
    /// 派生出本上下文的各级 run_id，从最早到最近
    ancestry: Vec<String>,
    created_at: DateTime<Utc>,
}

impl UserContext {
    pub fn builder(user_id: impl Into<String>, thread_id: impl Into<String>) -> UserContextBuilder {
        UserContextBuilder::new(user_id, thread_id)
    }

    /// 生成 run_id / request_id 的最简构造
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Result<Self, ApiaryError> {
        Self::builder(user_id, thread_id).build()
    }

    /// 为新的一次运行派生子上下文：同一用户 / 线程 / 连接，新的 run_id 与 request_id
    pub fn child(&self) -> Result<Self, ApiaryError> {
        UserContextBuilder::new(self.user_id.clone(), self.thread_id.clone())
            .parent(self)
            .build()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn ancestry(&self) -> &[String] {
        &self.ancestry
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// UserContext 构建器；`build` 是唯一出口，校验在此完成
#[derive(Debug, Clone)]
pub struct UserContextBuilder {
    user_id: String,
    thread_id: String,
    run_id: Option<String>,
    request_id: Option<String>,
    connection_id: Option<String>,
    metadata: BTreeMap<String, String>,
    ancestry: Vec<String>,
    parent_user: Option<String>,
}

impl UserContextBuilder {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            run_id: None,
            request_id: None,
            connection_id: None,
            metadata: BTreeMap::new(),
            ancestry: Vec::new(),
            parent_user: None,
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata_map(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// 直接指定祖先链（例如从持久化记录还原）
    pub fn ancestry(mut self, ancestry: Vec<String>) -> Self {
        self.ancestry = ancestry;
        self
    }

    /// 从父上下文派生：继承连接与元数据，祖先链追加父 run_id
    pub fn parent(mut self, parent: &UserContext) -> Self {
        let mut ancestry = parent.ancestry.clone();
        ancestry.push(parent.run_id.clone());
        self.ancestry = ancestry;
        self.parent_user = Some(parent.user_id.clone());
        if self.connection_id.is_none() {
            self.connection_id = parent.connection_id.clone();
        }
        for (k, v) in &parent.metadata {
            self.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    pub fn build(self) -> Result<UserContext, ApiaryError> {
        validate_identifier("user_id", &self.user_id)?;
        validate_identifier("thread_id", &self.thread_id)?;

        let run_id = self
            .run_id
            .unwrap_or_else(|| format!("run_{}", uuid::Uuid::new_v4().simple()));
        let request_id = self
            .request_id
            .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple()));
        validate_identifier("run_id", &run_id)?;
        validate_identifier("request_id", &request_id)?;
        if let Some(conn) = &self.connection_id {
            validate_identifier("connection_id", conn)?;
        }

        if let Some(parent_user) = &self.parent_user {
            if parent_user != &self.user_id {
                return Err(ApiaryError::InvalidContext(format!(
                    "parent context belongs to user {parent_user}, not {}",
                    self.user_id
                )));
            }
        }

        validate_ancestry(&run_id, &self.ancestry)?;

        Ok(UserContext {
            user_id: self.user_id,
            thread_id: self.thread_id,
            run_id,
            request_id,
            connection_id: self.connection_id,
            metadata: self.metadata,
            ancestry: self.ancestry,
            created_at: Utc::now(),
        })
    }
}

fn validate_identifier(field: &str, value: &str) -> Result<(), ApiaryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiaryError::InvalidContext(format!("{field} is empty")));
    }
    if trimmed.len() != value.len() || value.chars().any(char::is_control) {
        return Err(ApiaryError::InvalidContext(format!(
            "{field} contains whitespace or control characters"
        )));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ApiaryError::InvalidContext(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    let lower = value.to_ascii_lowercase();
    if PLACEHOLDER_IDS.contains(&lower.as_str()) {
        return Err(ApiaryError::InvalidContext(format!(
            "{field} is a placeholder value '{value}'"
        )));
    }
    Ok(())
}

/// 祖先链必须无环：不含自身 run_id、无重复、深度有限
fn validate_ancestry(run_id: &str, ancestry: &[String]) -> Result<(), ApiaryError> {
    if ancestry.len() > MAX_ANCESTRY_DEPTH {
        return Err(ApiaryError::InvalidContext(format!(
            "ancestry depth {} exceeds {MAX_ANCESTRY_DEPTH}",
            ancestry.len()
        )));
    }
    let mut seen = HashSet::with_capacity(ancestry.len());
    for ancestor in ancestry {
        validate_identifier("ancestor run_id", ancestor)?;
        if ancestor == run_id {
            return Err(ApiaryError::InvalidContext(format!(
                "circular context: run {run_id} appears in its own ancestry"
            )));
        }
        if !seen.insert(ancestor.as_str()) {
            return Err(ApiaryError::InvalidContext(format!(
                "circular context: ancestor {ancestor} appears twice"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_generates_ids() {
        let ctx = UserContext::new("alice", "thread_1").unwrap();
        assert!(ctx.run_id().starts_with("run_"));
        assert!(ctx.request_id().starts_with("req_"));
        assert!(ctx.ancestry().is_empty());
    }

    #[test]
    fn test_rejects_placeholder_user() {
        for bad in ["", "None", "null", "registry", "  alice"] {
            let err = UserContext::new(bad, "thread_1").unwrap_err();
            assert!(matches!(err, ApiaryError::InvalidContext(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_child_extends_ancestry() {
        let root = UserContext::builder("alice", "t1")
            .connection_id("conn_1")
            .metadata("client", "web")
            .build()
            .unwrap();
        let child = root.child().unwrap();
        let grandchild = child.child().unwrap();

        assert_ne!(child.run_id(), root.run_id());
        assert_eq!(child.ancestry(), &[root.run_id().to_string()]);
        assert_eq!(grandchild.ancestry().len(), 2);
        assert_eq!(grandchild.connection_id(), Some("conn_1"));
        assert_eq!(grandchild.metadata_value("client"), Some("web"));
    }

    #[test]
    fn test_rejects_self_reference() {
        let err = UserContext::builder("alice", "t1")
            .run_id("run_a")
            .ancestry(vec!["run_root".into(), "run_a".into()])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn test_rejects_repeated_ancestor() {
        let err = UserContext::builder("alice", "t1")
            .ancestry(vec!["run_x".into(), "run_y".into(), "run_x".into()])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("appears twice"));
    }

    #[test]
    fn test_rejects_cross_user_parent() {
        let bob = UserContext::new("bob", "t1").unwrap();
        let err = UserContextBuilder::new("alice", "t1")
            .parent(&bob)
            .build()
            .unwrap_err();
        assert!(matches!(err, ApiaryError::InvalidContext(_)));
    }
}
