//! Transport frames and the websocket dialer.
//!
//! A session talks to its transport through a split pair: a [`FrameSink`]
//! drained by the write loop and a [`FrameSource`] polled by the read loop.
//! [`WebSocketDialer`] produces that pair over `tokio-tungstenite`;
//! [`crate::pipe`] produces one in memory.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::error::{Error, Result};

/// Default Live API websocket endpoint.
pub const DEFAULT_WEBSOCKET_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Normal closure code.
pub const CLOSE_NORMAL: u16 = 1000;

/// A websocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub api_key: String,
}

impl Endpoint {
    /// The URL with the API key appended as the `key` query parameter.
    pub fn authorized_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::InvalidConfig(format!("invalid url {}: {}", self.url, e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url.into())
    }
}

/// Outbound half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Closes the transport gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Returns the next frame, or `None` once the transport is gone.
    ///
    /// Must be cancel-safe: the read loop races it against shutdown.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Opens transports.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials the Live API over a websocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let url = endpoint.authorized_url()?;
        debug!("Connecting to: {}", endpoint.url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::connection(format!("Failed to build request: {}", e)))?;
        request.headers_mut().insert(
            "User-Agent",
            http::HeaderValue::from_static(concat!("giztoy-gemini-live/", env!("CARGO_PKG_VERSION"))),
        );

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| match e {
            tungstenite::Error::Http(response) => Error::connection(format!(
                "handshake rejected: HTTP {}",
                response.status()
            )),
            other => Error::connection(format!("Failed to connect: {}", other)),
        })?;

        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink(write)), Box::new(WsSource(read))))
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                code: c.code.into(),
                reason: c.reason.into(),
            })),
        };
        self.0.send(msg).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.0.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(Error::WebSocket(e))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.as_str().to_string()))),
                Message::Binary(bytes) => return Some(Ok(Frame::Binary(bytes))),
                Message::Close(close) => {
                    debug!("WebSocket closed by server");
                    return Some(Ok(Frame::Close(close.map(|c| CloseFrame {
                        code: c.code.into(),
                        reason: c.reason.as_str().to_string(),
                    }))));
                }
                Message::Ping(data) => {
                    debug!("Received ping: {:?}", data);
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
