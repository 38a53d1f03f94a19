//! 网关：入站 / 出站消息协议、通信通道抽象与 Hub 分派
//!
//! - **message**：`{type, payload}` 入站帧与带 `type` 标签的出站事件
//! - **channel**：CommunicationChannel 契约，mpsc 与进程内实现
//! - **hub**：认证、连接接纳、ping/pong 与执行派发
//! - **ws**（feature `gateway`）：基于 tokio-tungstenite 的 WebSocket 监听

mod channel;
mod hub;
pub(crate) mod message;
#[cfg(feature = "gateway")]
mod ws;

pub use channel::{ChannelSource, CommunicationChannel, MemoryChannel, MemoryChannelSource, MpscChannel};
pub use hub::{Hub, InboundDisposition};
pub use message::{GatewayMessage, InboundMessage, ProtocolError, ServerEvent};
#[cfg(feature = "gateway")]
pub use ws::serve;
