//! WebSocket stream transport
//!
//! Binary WebSocket messages carry the chunked payload; pings and pongs
//! are handled inline and never surface to the session.

use std::io;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::buf::MultiBuffer;
use crate::error::TransportError;
use crate::net::Destination;

use super::StreamConnection;

/// WebSocket transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WsSettings {
    /// Request path presented during the handshake.
    pub path: String,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self { path: "/".into() }
    }
}

/// A WebSocket connection presented through the chunked transport
/// interface.
pub struct WsConnection<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WebSocketStream<S>>>,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a completed WebSocket handshake.
    #[must_use]
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
        }
    }
}

/// Dial a `ws://` endpoint for `dest`.
pub async fn dial(
    dest: &Destination,
    settings: &WsSettings,
) -> Result<
    WsConnection<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    TransportError,
> {
    let url = format!("ws://{}{}", dest.host_port(), settings.path);
    debug!("ws: dialing {}", url);
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(WsConnection::new(ws))
}

/// Run the server side of the handshake on an accepted TCP stream.
pub async fn accept(stream: TcpStream) -> Result<WsConnection<TcpStream>, TransportError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(WsConnection::new(ws))
}

fn ws_io_error(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

#[async_trait]
impl<S> StreamConnection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_chunk(&self) -> io::Result<Option<MultiBuffer>> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(MultiBuffer::from_bytes(&data)));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(MultiBuffer::from_bytes(text.as_bytes())));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(ws_io_error(err)),
            }
        }
    }

    async fn write_chunk(&self, data: MultiBuffer) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data.to_vec()))
            .await
            .map_err(ws_io_error)
    }

    async fn close(&self) -> io::Result<()> {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Address;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ws_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let server = accept(stream).await.unwrap();
            // echo one chunk back
            let chunk = server.read_chunk().await.unwrap().unwrap();
            server.write_chunk(chunk).await.unwrap();
            server.close().await.unwrap();
        });

        let dest = Destination::tcp(Address::from(addr.ip()), addr.port());
        let client = dial(&dest, &WsSettings::default()).await.unwrap();
        client
            .write_chunk(MultiBuffer::from_bytes(b"over websocket"))
            .await
            .unwrap();
        let reply = client.read_chunk().await.unwrap().unwrap();
        assert_eq!(reply.to_vec(), b"over websocket");
        assert!(client.read_chunk().await.unwrap().is_none());
    }
}
