//! WebSocket transport.
//!
//! Frames travel as text messages. Binary messages are accepted when they hold
//! UTF-8, pings are answered by tungstenite itself, and a close frame or a socket
//! error ends the stream.
//!
//! The transport works over any byte stream, so a server can wrap the sockets it
//! accepts the same way a client wraps the ones it dials.

use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use futures::stream::SplitStream;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::transport;
use crate::transport::Dialer;
use crate::transport::Transport;

pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait::async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: String) -> transport::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| transport::Error::ConnectionLost(e.to_string()))
    }

    async fn recv(&self) -> transport::Result<Option<String>> {
        let mut stream = self.stream.lock().await;
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Ok(Some(text)),
                Ok(Message::Binary(data)) => {
                    return String::from_utf8(data)
                        .map(Some)
                        .map_err(|e| transport::Error::Io(format!("binary frame is not utf-8: {}", e)));
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "websocket closed by peer");
                    return Ok(None);
                }
                Ok(_) => continue,
                Err(e) => return Err(transport::Error::ConnectionLost(e.to_string())),
            }
        }
        Ok(None)
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "error while closing websocket");
        }
    }
}

/// Dials `ws://` and `wss://` urls.
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

#[async_trait::async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> transport::Result<Box<dyn Transport>> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| transport::Error::Dial(format!("{}: {}", url, e)))?;
        Ok(Box::new(WebSocketTransport::new(socket)))
    }
}
