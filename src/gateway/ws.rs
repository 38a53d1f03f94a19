//! WebSocket 接入：首帧必须是 auth，之后的文本帧交给 Hub 分派

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::collaborators::AuthRequest;
use crate::gateway::{CommunicationChannel, GatewayMessage, Hub, InboundMessage, MpscChannel};

/// 连接结束后等待写循环发出关闭帧的上限
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// 监听直到 cancel；单个连接的错误只记录，不影响监听
pub async fn serve(
    hub: Arc<Hub>,
    bind_addr: &str,
    outbound_buffer: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on ws://{}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let hub = Arc::clone(&hub);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(hub, stream, peer, outbound_buffer).await {
                                tracing::warn!(peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "Accept error"),
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    hub: Arc<Hub>,
    stream: TcpStream,
    peer: SocketAddr,
    outbound_buffer: usize,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (channel, mut rx) = MpscChannel::new(format!("ws_{}", peer), outbound_buffer);
    let closed = channel.closed_signal();
    let channel: Arc<dyn CommunicationChannel> = Arc::new(channel);
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let request = match ws_rx.next().await {
        Some(Ok(WsMessage::Text(text))) => match InboundMessage::parse(&text) {
            Ok(InboundMessage::Auth {
                token,
                user_id,
                thread_id,
            }) => AuthRequest {
                token,
                user_id,
                thread_id,
                ..AuthRequest::default()
            },
            _ => {
                let _ = channel
                    .send(&GatewayMessage::error("unauthenticated", "first frame must be auth"))
                    .await;
                channel.close().await;
                drop(channel);
                let _ = writer.await;
                return Ok(());
            }
        },
        _ => {
            writer.abort();
            return Ok(());
        }
    };

    let connection_id = match hub.connect(&request, channel.clone()).await {
        Ok(id) => id,
        Err(e) => {
            let _ = channel.send(&GatewayMessage::error(e.code(), &e.to_string())).await;
            channel.close().await;
            drop(channel);
            let _ = writer.await;
            return Ok(());
        }
    };
    tracing::info!(peer = %peer, connection_id = %connection_id, "WebSocket session started");

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => {
                tracing::info!(peer = %peer, connection_id = %connection_id, "Connection closed by gateway");
                break;
            }
            frame = ws_rx.next() => frame,
        };
        let Some(frame) = frame else { break };
        match frame {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) = hub.handle_inbound(&connection_id, &text).await {
                    tracing::debug!(connection_id = %connection_id, error = %e, "Inbound frame failed");
                }
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    hub.disconnect(&connection_id).await;
    channel.close().await;
    drop(channel);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    Ok(())
}
