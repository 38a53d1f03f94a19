//! 持久化协作者：运行记录与对话消息的落盘接口
//!
//! 具体表结构在外部；进程内实现供测试与单机运行。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::llm::Role;
use crate::orchestration::{Report, StagePlan, StageResult};

/// 一次已结束运行的持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub request_id: String,
    pub user_id: String,
    pub thread_id: String,
    pub engine_id: String,
    pub status: String,
    pub plan: Option<StagePlan>,
    pub stage_results: Vec<StageResult>,
    pub report: Option<Report>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn save_run(&self, record: RunRecord) -> anyhow::Result<()>;

    async fn append_message(&self, thread_id: &str, role: Role, content: &str) -> anyhow::Result<()>;

    /// 最近 limit 条消息，按时间正序
    async fn thread_history(&self, thread_id: &str, limit: usize) -> anyhow::Result<Vec<StoredMessage>>;

    async fn runs_for_user(&self, user_id: &str) -> anyhow::Result<Vec<RunRecord>>;
}

/// 进程内持久化
#[derive(Default)]
pub struct MemoryPersistence {
    runs: RwLock<Vec<RunRecord>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryPersistence {
    async fn save_run(&self, record: RunRecord) -> anyhow::Result<()> {
        self.runs.write().await.push(record);
        Ok(())
    }

    async fn append_message(&self, thread_id: &str, role: Role, content: &str) -> anyhow::Result<()> {
        self.messages
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push(StoredMessage {
                role,
                content: content.to_string(),
                timestamp: Utc::now(),
            });
        Ok(())
    }

    async fn thread_history(&self, thread_id: &str, limit: usize) -> anyhow::Result<Vec<StoredMessage>> {
        let messages = self.messages.read().await;
        let history = messages.get(thread_id).map(Vec::as_slice).unwrap_or_default();
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].to_vec())
    }

    async fn runs_for_user(&self, user_id: &str) -> anyhow::Result<Vec<RunRecord>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_thread_history_keeps_latest() {
        let store = MemoryPersistence::new();
        for i in 0..5 {
            store
                .append_message("t1", Role::User, &format!("m{i}"))
                .await
                .unwrap();
        }
        let history = store.thread_history("t1", 2).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(store.thread_history("other", 10).await.unwrap().is_empty());
    }
}
