//! Reliable control channel
//!
//! One request and one reply per TCP connection. Each frame is a `u32`
//! big-endian length followed by the packet wire bytes of a control message.
//!
//! ```text
//!   joiner                              host
//!     │ ── connect ───────────────────►  │
//!     │ ── [len][JOIN {origin}] ──────►  │  RequestHandler::handle
//!     │ ◄── [len][JOIN_REPLY {members}]  │
//!     │ ── close ─────────────────────►  │
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::SignalingConfig;
use crate::error::SignalingError;
use crate::packet::{ControlMessage, Packet};

/// Answers control requests on the server side
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: ControlMessage) -> ControlMessage;
}

/// Write one length-prefixed frame
pub async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    bytes: &[u8],
) -> Result<(), SignalingError> {
    let len = u32::try_from(bytes.len()).map_err(|_| SignalingError::FrameTooLarge(bytes.len()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame of at most `max_len` bytes
pub async fn read_frame(
    stream: &mut (impl AsyncReadExt + Unpin),
    max_len: usize,
) -> Result<Vec<u8>, SignalingError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(SignalingError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_message(
    stream: &mut (impl AsyncWriteExt + Unpin),
    message: &ControlMessage,
    scratch: &mut Packet,
) -> Result<(), SignalingError> {
    message.encode_into(scratch);
    write_frame(stream, scratch.as_bytes()).await
}

async fn read_message(
    stream: &mut (impl AsyncReadExt + Unpin),
    max_len: usize,
) -> Result<ControlMessage, SignalingError> {
    let frame = read_frame(stream, max_len).await?;
    Ok(ControlMessage::from_bytes(&frame)?)
}

/// Sends control requests and waits for the reply
#[derive(Debug, Clone)]
pub struct SignalingClient {
    timeout: Duration,
    max_frame_len: usize,
}

impl SignalingClient {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            max_frame_len: config.max_frame_len,
        }
    }

    /// Send `message` to `addr` and return its reply; the whole exchange,
    /// connect included, is bounded by the request timeout
    pub async fn request(
        &self,
        addr: SocketAddr,
        message: &ControlMessage,
    ) -> Result<ControlMessage, SignalingError> {
        match tokio::time::timeout(self.timeout, self.exchange(addr, message)).await {
            Ok(result) => result,
            Err(_) => Err(SignalingError::Timeout(addr)),
        }
    }

    async fn exchange(
        &self,
        addr: SocketAddr,
        message: &ControlMessage,
    ) -> Result<ControlMessage, SignalingError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SignalingError::Unreachable { addr, source })?;
        stream.set_nodelay(true)?;

        let mut scratch = Packet::default();
        write_message(&mut stream, message, &mut scratch).await?;
        tracing::debug!(peer = %addr, kind = ?message.kind(), "Sent control request");

        let reply = read_message(&mut stream, self.max_frame_len).await?;
        tracing::debug!(peer = %addr, kind = ?reply.kind(), "Received control reply");
        Ok(reply)
    }
}

/// Accept loop answering control requests with a [`RequestHandler`].
/// The loop runs on the tokio runtime until `shutdown` or drop.
pub struct SignalingServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl SignalingServer {
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        config: &SignalingConfig,
    ) -> Result<Self, SignalingError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SignalingError::Unreachable { addr, source })?;
        Self::serve(listener, handler, config)
    }

    /// Serve on an already bound listener; must be called inside a tokio runtime
    pub fn serve(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        config: &SignalingConfig,
    ) -> Result<Self, SignalingError> {
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Signaling server listening");

        let timeout = config.request_timeout();
        let max_frame_len = config.max_frame_len;
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let served = tokio::time::timeout(
                                timeout,
                                serve_connection(socket, handler, max_frame_len),
                            )
                            .await;
                            match served {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => tracing::debug!(%peer, error = %e, "Control request failed"),
                                Err(_) => tracing::debug!(%peer, "Control request timed out"),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept control connection");
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; requests already being served run to completion
    pub fn shutdown(&self) {
        if !self.accept_task.is_finished() {
            self.accept_task.abort();
            tracing::info!(addr = %self.local_addr, "Signaling server stopped");
        }
    }
}

impl Drop for SignalingServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    handler: Arc<dyn RequestHandler>,
    max_frame_len: usize,
) -> Result<(), SignalingError> {
    socket.set_nodelay(true)?;
    let request = read_message(&mut socket, max_frame_len).await?;
    // Handlers may tear down media threads and join them
    let reply = tokio::task::spawn_blocking(move || handler.handle(request))
        .await
        .map_err(std::io::Error::from)?;
    let mut scratch = Packet::default();
    write_message(&mut socket, &reply, &mut scratch).await
}
