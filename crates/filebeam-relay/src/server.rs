//! TCP listener and per-connection tasks

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::assets;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::FrameAssembler;
use crate::hub::{Hub, HubHandle};
use crate::relay::{ConnectionId, Relay};
use crate::{MAX_REQUEST_HEAD, REQUEST_HEAD_TIMEOUT_SECS};

/// Pause after an accept failure that is not the peer's doing
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bounds for polling an incomplete request head
const PEEK_DELAY_MIN: Duration = Duration::from_millis(5);
const PEEK_DELAY_MAX: Duration = Duration::from_millis(500);

/// A bound relay server
pub struct RelayServer {
    listener: TcpListener,
    public_dir: Arc<PathBuf>,
    hub: HubHandle,
}

impl RelayServer {
    /// Bind the listener and start the hub
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let addr = config.addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::from_bind(addr, e))?;

        Ok(Self {
            listener,
            public_dir: Arc::new(config.public_dir),
            hub: Hub::spawn(Relay::new()),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the hub behind this server
    pub fn hub(&self) -> HubHandle {
        self.hub.clone()
    }

    /// Accept connections forever
    pub async fn serve(self) {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Accept failures are
    /// logged and retried; they never stop the relay.
    pub async fn serve_with_shutdown<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.local_addr() {
            info!("Relay listening on {}", addr);
        }
        info!("Serving static files from {:?}", self.public_dir);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    return;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            let delay = accept_retry_delay(&e);
                            warn!("Accept failed: {}; retrying in {:?}", e, delay);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    };
                    let hub = self.hub.clone();
                    let public_dir = self.public_dir.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, hub, &public_dir).await {
                            debug!("Connection error from {}: {:?}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }
}

/// How long to wait before accepting again after `err`. A connection that
/// died before we got to it costs nothing; anything else (usually running
/// out of file descriptors) needs time for other connections to close.
fn accept_retry_delay(err: &io::Error) -> Duration {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => Duration::ZERO,
        _ => ACCEPT_BACKOFF,
    }
}

/// What the first bytes of a connection turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    WebSocket,
    Http,
    Closed,
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    hub: HubHandle,
    public_dir: &Path,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let kind = timeout(
        Duration::from_secs(REQUEST_HEAD_TIMEOUT_SECS),
        peek_request_kind(&stream),
    )
    .await??;

    match kind {
        RequestKind::Closed => Ok(()),
        RequestKind::Http => Ok(assets::serve_http(&mut stream, public_dir, &hub).await?),
        RequestKind::WebSocket => handle_websocket(stream, peer_addr, hub).await,
    }
}

async fn handle_websocket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: HubHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn = ConnectionId::generate().map_err(|e| io::Error::other(e.to_string()))?;
    debug!("New connection from {} as {}", peer_addr, conn);

    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    hub.connect(conn.clone(), outbox.clone());

    // Ends once both this task and the hub have dropped the outbox
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut frames = FrameAssembler::new();
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match frames.text(&text) {
                Ok(Some(inbound)) => hub.event(conn.clone(), inbound.event, inbound.payload),
                Ok(None) => {}
                Err(e) => warn!("Dropping frame from {}: {}", conn, e),
            },
            Ok(Message::Binary(bytes)) => match frames.binary(bytes) {
                Ok(Some(inbound)) => hub.event(conn.clone(), inbound.event, inbound.payload),
                Ok(None) => {}
                Err(e) => warn!("Dropping frame from {}: {}", conn, e),
            },
            Ok(Message::Ping(data)) => {
                let _ = outbox.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error from {}: {:?}", conn, e);
                break;
            }
        }
    }

    hub.disconnect(conn.clone());
    drop(outbox);
    let _ = writer.await;

    debug!("Connection closed: {}", conn);
    Ok(())
}

/// Peek at the request head without consuming it, so the WebSocket handshake
/// or the HTTP handler can still read it.
async fn peek_request_kind(stream: &TcpStream) -> io::Result<RequestKind> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    let mut delay = PEEK_DELAY_MIN;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(RequestKind::Closed);
        }

        if let Some(end) = head_end(&buf[..n]) {
            return Ok(if is_websocket_upgrade(&buf[..end]) {
                RequestKind::WebSocket
            } else {
                RequestKind::Http
            });
        }

        if n == buf.len() {
            return Ok(RequestKind::Http);
        }

        // Head not complete yet and peek does not wait for new bytes. Poll
        // quickly while data keeps arriving, slower once the client stalls.
        delay = if n > seen {
            PEEK_DELAY_MIN
        } else {
            next_peek_delay(delay)
        };
        seen = n;
        tokio::time::sleep(delay).await;
    }
}

fn next_peek_delay(delay: Duration) -> Duration {
    (delay * 2).min(PEEK_DELAY_MAX)
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Whether a request head asks for a WebSocket upgrade
fn is_websocket_upgrade(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().skip(1).any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("upgrade") && value.trim().eq_ignore_ascii_case("websocket")
    })
}
