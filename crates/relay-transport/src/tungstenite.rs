//! Network socket dialer using tokio-tungstenite.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error};

use crate::observer::CloseInfo;
use crate::traits::AdapterError;
use crate::websocket::{SocketDialer, SocketEvent, SocketLink, SocketSink, WebSocketConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

#[async_trait]
impl SocketDialer for TungsteniteDialer {
    async fn dial(&self, config: &WebSocketConfig) -> Result<SocketLink, AdapterError> {
        let (stream, _response) = connect_async(config.url.as_str()).await.map_err(|e| {
            error!("WebSocket handshake with {} failed: {}", config.url, e);
            AdapterError::ConnectFailed(e.to_string())
        })?;
        debug!("WebSocket handshake completed with {}", config.url);

        let (write, mut read) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Binary(data)) => SocketEvent::Message(Bytes::from(data)),
                    // For compatibility, treat text as binary
                    Ok(Message::Text(text)) => SocketEvent::Message(Bytes::from(text.into_bytes())),
                    Ok(Message::Pong(data)) => SocketEvent::Pong(Bytes::from(data)),
                    // Pings are answered by tungstenite itself
                    Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                    Ok(Message::Close(frame)) => {
                        debug!("Received close frame");
                        let info = match frame {
                            Some(frame) => {
                                CloseInfo::remote(Some(u16::from(frame.code)), frame.reason.to_string())
                            }
                            None => CloseInfo::remote(None, "close frame"),
                        };
                        let _ = tx.send(SocketEvent::Closed(info));
                        return;
                    }
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                        debug!("Connection closed");
                        let _ = tx.send(SocketEvent::Closed(CloseInfo::remote(None, "connection closed")));
                        return;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        let _ = tx.send(SocketEvent::Error(e.to_string()));
                        let _ = tx.send(SocketEvent::Closed(CloseInfo::remote(None, e.to_string())));
                        return;
                    }
                };
                if tx.send(event).is_err() {
                    return;
                }
            }

            debug!("WebSocket stream ended");
            let _ = tx.send(SocketEvent::Closed(CloseInfo::remote(None, "stream ended")));
        });

        let sink = TungsteniteSink {
            write: Mutex::new(write),
            in_flight: AtomicUsize::new(0),
            open: AtomicBool::new(true),
        };
        Ok(SocketLink {
            sink: Arc::new(sink),
            events: rx,
        })
    }
}

struct TungsteniteSink {
    write: Mutex<SplitSink<WsStream, Message>>,
    /// Bytes handed to `send` and not yet flushed.
    in_flight: AtomicUsize,
    open: AtomicBool,
}

#[async_trait]
impl SocketSink for TungsteniteSink {
    async fn send(&self, data: Bytes) -> Result<(), AdapterError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AdapterError::ConnectionClosed);
        }

        let len = data.len();
        self.in_flight.fetch_add(len, Ordering::SeqCst);
        let result = self
            .write
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await;
        self.in_flight.fetch_sub(len, Ordering::SeqCst);

        result.map_err(|e| AdapterError::SendFailed(e.to_string()))
    }

    async fn ping(&self, probe: Bytes) -> Result<(), AdapterError> {
        self.write
            .lock()
            .await
            .send(Message::Ping(probe.to_vec()))
            .await
            .map_err(|e| AdapterError::SendFailed(format!("ping failed: {}", e)))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.write
            .lock()
            .await
            .close()
            .await
            .map_err(|e| AdapterError::Other(format!("Failed to close: {}", e)))
    }

    fn buffered_amount(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}
