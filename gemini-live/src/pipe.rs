//! In-memory transport for testing.
//!
//! [`new_pipe`] returns a [`Dialer`] to hand to a client and the
//! [`PipeServer`] that accepts its connections. Each accepted [`PipeConn`]
//! sees every frame the client sends and can inject server frames, close the
//! connection, or drop it abruptly.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{ClientMessage, ServerMessage, decode_client, encode_server};
use crate::transport::{CLOSE_NORMAL, CloseFrame, Dialer, Endpoint, Frame, FrameSink, FrameSource};

/// Creates a connected dialer/server pair.
pub fn new_pipe() -> (PipeDialer, PipeServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(PipeShared::default()));
    let dialer = PipeDialer {
        accept_tx,
        shared: shared.clone(),
    };
    let server = PipeServer { accept_rx, shared };
    (dialer, server)
}

#[derive(Debug, Default)]
struct PipeShared {
    reject: Option<String>,
    dials: usize,
    last_endpoint: Option<Endpoint>,
}

/// Client side: dials in-memory connections.
#[derive(Debug, Clone)]
pub struct PipeDialer {
    accept_tx: mpsc::UnboundedSender<PipeConn>,
    shared: Arc<Mutex<PipeShared>>,
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        {
            let mut shared = self.shared.lock();
            shared.dials += 1;
            shared.last_endpoint = Some(endpoint.clone());
            if let Some(reason) = shared.reject.clone() {
                return Err(Error::connection(format!("handshake rejected: {}", reason)));
            }
        }

        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = mpsc::unbounded_channel();

        let conn = PipeConn {
            rx: up_rx,
            tx: Some(down_tx),
        };
        self.accept_tx
            .send(conn)
            .map_err(|_| Error::connection("pipe server is gone"))?;

        Ok((
            Box::new(PipeSink { tx: Some(up_tx) }),
            Box::new(PipeSource { rx: down_rx }),
        ))
    }
}

/// Server side: accepts connections from [`PipeDialer`].
#[derive(Debug)]
pub struct PipeServer {
    accept_rx: mpsc::UnboundedReceiver<PipeConn>,
    shared: Arc<Mutex<PipeShared>>,
}

impl PipeServer {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<PipeConn> {
        self.accept_rx.recv().await
    }

    /// Makes every following dial fail with a connection error.
    pub fn reject_with(&self, reason: impl Into<String>) {
        self.shared.lock().reject = Some(reason.into());
    }

    /// Accepts dials again.
    pub fn accept_dials(&self) {
        self.shared.lock().reject = None;
    }

    /// Number of dial attempts so far.
    pub fn dial_count(&self) -> usize {
        self.shared.lock().dials
    }

    /// Endpoint of the most recent dial.
    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.shared.lock().last_endpoint.clone()
    }
}

/// One accepted connection, seen from the server.
#[derive(Debug)]
pub struct PipeConn {
    rx: mpsc::UnboundedReceiver<Frame>,
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

impl PipeConn {
    /// Next frame from the client, or `None` once it hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// A frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Next client frame, decoded.
    ///
    /// Fails with [`Error::SessionClosed`] if the client closed or hung up.
    pub async fn recv_message(&mut self) -> Result<ClientMessage> {
        match self.rx.recv().await {
            Some(Frame::Close(_)) | None => Err(Error::SessionClosed),
            Some(frame) => decode_client(&frame),
        }
    }

    /// Sends a server message.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        self.send_frame(encode_server(msg)?)
    }

    /// Sends a raw frame, well-formed or not.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::SessionClosed)?;
        tx.send(frame).map_err(|_| Error::connection("pipe client is gone"))
    }

    /// Sends a close frame and stops sending.
    pub fn close(&mut self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.send_frame(Frame::Close(Some(CloseFrame::new(code, reason))))?;
        self.tx = None;
        Ok(())
    }
}

struct PipeSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::SessionClosed)?;
        tx.send(frame).map_err(|_| Error::connection("pipe server hung up"))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Frame::Close(Some(CloseFrame::new(CLOSE_NORMAL, ""))));
        }
        Ok(())
    }
}

struct PipeSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}
