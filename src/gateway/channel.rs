//! 通信通道抽象：把事件推送到客户端的一条双向连接
//!
//! 物理传输（WebSocket 等）在网关之外实现；这里只定义写入契约与进程内实现。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{TransportError, UserContext};
use crate::gateway::GatewayMessage;

/// 一条可写的通信通道
#[async_trait]
pub trait CommunicationChannel: Send + Sync {
    fn channel_id(&self) -> &str;

    async fn send(&self, message: &GatewayMessage) -> Result<(), TransportError>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// 为每个新引擎提供独立通道实例
pub trait ChannelSource: Send + Sync {
    fn open_channel(&self, context: &UserContext) -> Arc<dyn CommunicationChannel>;
}

/// 基于有界 mpsc 的通道：序列化后投递给写循环（如 WebSocket 发送任务）
///
/// close 丢弃发送端，写循环排空后 `recv` 返回 None；读循环通过 `closed_signal` 感知关闭。
pub struct MpscChannel {
    id: String,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    closed: CancellationToken,
    dropped: AtomicU64,
}

impl MpscChannel {
    pub fn new(id: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                id: id.into(),
                tx: Mutex::new(Some(tx)),
                closed: CancellationToken::new(),
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// 因缓冲区满而丢弃的消息数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 通道关闭（本端 close 或写循环退出）时触发
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }

    fn shut(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.closed.cancel();
    }
}

#[async_trait]
impl CommunicationChannel for MpscChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &GatewayMessage) -> Result<(), TransportError> {
        let Some(tx) = self.sender().filter(|_| !self.closed.is_cancelled()) else {
            return Err(TransportError::Closed(self.id.clone()));
        };
        let text = message
            .to_json()
            .map_err(|e| TransportError::Serialize(e.to_string()))?;
        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                TransportError::Full(self.id.clone())
            }
            mpsc::error::TrySendError::Closed(_) => {
                self.shut();
                TransportError::Closed(self.id.clone())
            }
        })
    }

    async fn close(&self) {
        self.shut();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender().map_or(true, |tx| tx.is_closed())
    }
}

/// 进程内通道：记录所有写入的消息，关闭后写入失败
#[derive(Default)]
pub struct MemoryChannel {
    id: String,
    messages: Mutex<Vec<GatewayMessage>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<GatewayMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn take_messages(&self) -> Vec<GatewayMessage> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }

    /// 已写入消息的事件类型序列
    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages().iter().map(GatewayMessage::kind).collect()
    }
}

#[async_trait]
impl CommunicationChannel for MemoryChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, message: &GatewayMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.id.clone()));
        }
        self.messages
            .lock()
            .map_err(|_| TransportError::Closed(self.id.clone()))?
            .push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 每次 open_channel 新建一个 MemoryChannel，并保留引用供检查
#[derive(Default)]
pub struct MemoryChannelSource {
    opened: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<Arc<MemoryChannel>> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }
}

impl ChannelSource for MemoryChannelSource {
    fn open_channel(&self, context: &UserContext) -> Arc<dyn CommunicationChannel> {
        let channel = Arc::new(MemoryChannel::new(format!(
            "mem_{}_{}",
            context.user_id(),
            uuid::Uuid::new_v4().simple()
        )));
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(channel.clone());
        }
        channel
    }
}
