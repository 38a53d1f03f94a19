//! 认证协作者：把连接首帧的声明换成经过校验的 UserContext

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::{ApiaryError, UserContext};

/// 认证请求（来自 auth 帧或 HTTP 握手）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub token: Option<String>,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl AuthRequest {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// 认证接口；令牌签发与校验在外部完成
#[async_trait]
pub trait AuthenticationProvider: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserContext, ApiaryError>;
}

/// 开发用：信任声明的 user_id（可选要求固定 token）
#[derive(Debug, Default, Clone)]
pub struct DevAuthenticator {
    shared_token: Option<String>,
}

impl DevAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared_token(token: impl Into<String>) -> Self {
        Self {
            shared_token: Some(token.into()),
        }
    }
}

#[async_trait]
impl AuthenticationProvider for DevAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserContext, ApiaryError> {
        if let Some(expected) = &self.shared_token {
            if request.token.as_deref() != Some(expected.as_str()) {
                return Err(ApiaryError::Unauthenticated(format!(
                    "invalid token for user {}",
                    request.user_id
                )));
            }
        }
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| format!("thread_{}", uuid::Uuid::new_v4().simple()));
        UserContext::builder(request.user_id.clone(), thread_id)
            .metadata_map(request.metadata.clone())
            .build()
    }
}
