//! 线程级通道：发送时才解析该线程当前存活的物理连接
//!
//! 引擎持有的是逻辑通道，客户端重连后事件自动走新连接；写入失败的连接被判死。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{TransportError, UserContext};
use crate::gateway::{ChannelSource, CommunicationChannel, GatewayMessage};
use crate::presence::PresenceManager;

pub struct ThreadChannel {
    id: String,
    user_id: String,
    thread_id: String,
    presence: Arc<PresenceManager>,
    closed: AtomicBool,
}

impl ThreadChannel {
    pub fn new(presence: Arc<PresenceManager>, user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            id: format!("thread_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            presence,
            closed: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

#[async_trait]
impl CommunicationChannel for ThreadChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &GatewayMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.id.clone()));
        }
        let Some((connection_id, channel)) = self
            .presence
            .live_channel_for_thread(&self.user_id, &self.thread_id)
            .await
        else {
            return Err(TransportError::NoConnection(self.thread_id.clone()));
        };

        if let Err(e) = channel.send(message).await {
            tracing::debug!(
                connection_id = %connection_id,
                thread_id = %self.thread_id,
                error = %e,
                "Delivery failed, marking connection dead"
            );
            self.presence.mark_dead(connection_id.as_str()).await;
            return Err(e);
        }
        Ok(())
    }

    /// 只关闭逻辑通道；物理连接归存活管理层所有
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 为每个引擎打开一个新的 ThreadChannel
pub struct PresenceChannelSource {
    presence: Arc<PresenceManager>,
}

impl PresenceChannelSource {
    pub fn new(presence: Arc<PresenceManager>) -> Self {
        Self { presence }
    }
}

impl ChannelSource for PresenceChannelSource {
    fn open_channel(&self, context: &UserContext) -> Arc<dyn CommunicationChannel> {
        Arc::new(ThreadChannel::new(
            self.presence.clone(),
            context.user_id(),
            context.thread_id(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryChannel;
    use crate::presence::{ConnectionBinding, ConnectionId, PresenceConfig};

    #[tokio::test]
    async fn test_routes_to_live_connection_and_marks_failures() {
        let presence = Arc::new(PresenceManager::new(PresenceConfig::default()));
        let conn = Arc::new(MemoryChannel::new("c1"));
        presence
            .register_connection(
                ConnectionId::from("c1"),
                ConnectionBinding::new("alice").with_thread("t1"),
                Some(conn.clone()),
            )
            .await;

        let channel = ThreadChannel::new(presence.clone(), "alice", "t1");
        channel.send(&GatewayMessage::ping()).await.unwrap();
        assert_eq!(conn.kinds(), vec!["ping"]);

        conn.close().await;
        assert!(channel.send(&GatewayMessage::ping()).await.is_err());
        assert!(!presence.get_connection("c1").await.unwrap().is_alive);

        let err = channel.send(&GatewayMessage::ping()).await.unwrap_err();
        assert_eq!(err, TransportError::NoConnection("t1".into()));
    }

    #[tokio::test]
    async fn test_other_users_thread_is_not_reachable() {
        let presence = Arc::new(PresenceManager::new(PresenceConfig::default()));
        presence
            .register_connection(
                ConnectionId::from("c1"),
                ConnectionBinding::new("bob").with_thread("t1"),
                Some(Arc::new(MemoryChannel::new("c1"))),
            )
            .await;
        let channel = ThreadChannel::new(presence, "alice", "t1");
        assert!(channel.send(&GatewayMessage::ping()).await.is_err());
    }
}
