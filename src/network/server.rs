//! TCP transport of the client gateway.

use crate::error::{ControlError, ControlResult};
use crate::network::gateway::Gateway;
use crate::network::messages::{ErrorMessage, Response};
use crate::network::session::SessionManager;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Longest request line a client may send, newline included.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Line-delimited JSON over TCP.
///
/// Each connection gets a [`ClientSession`](crate::network::session::ClientSession)
/// and a writer task; direct replies and results pushed by the scheduler go
/// through the same writer, one JSON object per line.
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Gateway,
    sessions: SessionManager,
    idle_timeout: Duration,
}

impl GatewayServer {
    /// Bind the listener. `idle_timeout` bounds one wait for client input.
    pub async fn bind(addr: &str, gateway: Gateway, idle_timeout: Duration) -> ControlResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            gateway,
            sessions: SessionManager::new(),
            idle_timeout,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry of connected clients.
    pub fn sessions(&self) -> SessionManager {
        self.sessions.clone()
    }

    /// Accept clients until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Gateway stopping");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let gateway = self.gateway.clone();
                            let sessions = self.sessions.clone();
                            let idle_timeout = self.idle_timeout;
                            let shutdown = shutdown.child_token();

                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_client(
                                        socket,
                                        addr,
                                        gateway,
                                        sessions,
                                        idle_timeout,
                                        shutdown,
                                    )
                                    .await
                                    {
                                        warn!("Client {} error: {}", addr, e);
                                    }
                                }
                                .instrument(info_span!("client", peer = %addr)),
                            );
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
            }
        }
    }
}

enum Inbound {
    Line,
    TooLong,
    Closed,
}

/// Read up to one newline into `buf`, at most `MAX_REQUEST_BYTES` in total.
///
/// Bytes already in `buf` count towards the limit, so a read interrupted by
/// the idle timeout resumes where it stopped.
async fn read_request(reader: &mut BufReader<OwnedReadHalf>, buf: &mut Vec<u8>) -> io::Result<Inbound> {
    let room = (MAX_REQUEST_BYTES + 1).saturating_sub(buf.len());
    let n = (&mut *reader).take(room as u64).read_until(b'\n', buf).await?;
    if buf.last() == Some(&b'\n') {
        Ok(Inbound::Line)
    } else if buf.len() > MAX_REQUEST_BYTES {
        Ok(Inbound::TooLong)
    } else if n == 0 {
        Ok(Inbound::Closed)
    } else {
        Ok(Inbound::Line)
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    gateway: Gateway,
    sessions: SessionManager,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let (reader, writer) = socket.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let session = sessions.create_session(Some(addr), Some(tx)).await;
    let writer = tokio::spawn(write_responses(writer, rx));
    let active = sessions.len().await;
    info!(session = %session.id, active = active, "Client connected");

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        let read = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            read = timeout(idle_timeout, read_request(&mut reader, &mut buf)) => read,
        };

        match read {
            Ok(Ok(Inbound::Line)) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                buf.clear();
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                let response = gateway.handle_line(line, &session).await;
                if !session.send(response) {
                    debug!("writer gone");
                    break;
                }
            }
            Ok(Ok(Inbound::TooLong)) => {
                let error = ControlError::Validation(format!(
                    "request exceeds {MAX_REQUEST_BYTES} bytes"
                ));
                warn!("{}", error);
                session.send(ErrorMessage::from_error(&error, None).into());
                break;
            }
            Ok(Ok(Inbound::Closed)) => {
                info!("Client disconnected");
                break;
            }
            Ok(Err(e)) => {
                warn!("Read error: {}", e);
                break;
            }
            Err(_) => {
                let idle = session.idle_for();
                debug!(idle_ms = idle.num_milliseconds(), "Client idle");
            }
        }
    }

    sessions.remove_session(&session.id).await;
    drop(session);

    match writer.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Serialize responses to the socket until every sender is gone.
async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Response>,
) -> io::Result<()> {
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response).map_err(io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    writer.shutdown().await
}
