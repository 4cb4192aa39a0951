//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use tandem_core::{ErrorCode, MemberId, ProtocolError};

use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::RoomRegistry;
use crate::relay::SignalRelay;

/// Signal server state
#[derive(Clone, Default)]
pub struct SignalServer {
    relay: SignalRelay,
}

impl SignalServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` and start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    /// Accept connections on an already-bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let relay = self.relay.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, relay).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        self.relay.registry()
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.registry().room_count()
    }

    /// Get connected member count (for monitoring)
    pub fn member_count(&self) -> usize {
        self.registry().member_count()
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    relay: SignalRelay,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to detect HTTP vs WebSocket
    let mut peek_buf = [0u8; 4];
    stream.peek(&mut peek_buf).await?;

    if &peek_buf == b"GET " && !is_websocket_upgrade(&stream).await? {
        let registry = relay.registry();
        return handle_http_request(&mut stream, registry.room_count(), registry.member_count())
            .await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (membership, mut outbox) = Membership::register(&relay)?;
    let member_id = membership.member_id.clone();
    debug!("New connection from {} as {}", peer_addr, member_id);

    let welcome = ServerMessage::Welcome {
        member_id: member_id.clone(),
    };
    if ws_sender.send(Message::Text(welcome.to_json()?)).await.is_err() {
        debug!("{} went away before the welcome", member_id);
        return Ok(());
    }

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => {
                        let err = ProtocolError::BinaryFrame(data.len());
                        let reply = ServerMessage::error(ErrorCode::from(&err), err.to_string());
                        if ws_sender.send(Message::Text(reply.to_json()?)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sender.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket error: {:?}", e);
                        break;
                    }
                };

                let reply = match ClientMessage::from_json(&text) {
                    Ok(request) => relay.handle(&member_id, request),
                    Err(e) => {
                        warn!("Invalid message from {}: {}", member_id, e);
                        Some(ServerMessage::error(ErrorCode::from(&e), e.to_string()))
                    }
                };

                if let Some(reply) = reply {
                    if ws_sender.send(Message::Text(reply.to_json()?)).await.is_err() {
                        break;
                    }
                }
            }

            Some(msg) = outbox.recv() => {
                if ws_sender.send(Message::Text(msg.to_json()?)).await.is_err() {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// A registered member for the lifetime of one WebSocket
///
/// Dropping it runs `leave_all` and removes the outbox, on every exit path.
struct Membership {
    relay: SignalRelay,
    member_id: MemberId,
}

impl Membership {
    fn register(
        relay: &SignalRelay,
    ) -> std::io::Result<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let (member_id, outbox) = relay.connect()?;
        let membership = Self {
            relay: relay.clone(),
            member_id,
        };
        Ok((membership, outbox))
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.relay.disconnect(&self.member_id);
        debug!("Connection closed: {}", self.member_id);
    }
}

/// Whether a GET request carries a WebSocket upgrade header
async fn is_websocket_upgrade(stream: &TcpStream) -> Result<bool, std::io::Error> {
    let mut buf = vec![0u8; 2048];
    let n = stream.peek(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
    Ok(head.contains("upgrade: websocket"))
}

/// Handle an HTTP request (for health checks)
async fn handle_http_request(
    stream: &mut TcpStream,
    room_count: usize,
    member_count: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Read the HTTP request
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Parse the request path
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let (status, body) = match path {
        "/health" => (
            "200 OK",
            serde_json::json!({"status": "healthy", "rooms": room_count, "members": member_count}),
        ),
        "/stats" => (
            "200 OK",
            serde_json::json!({"rooms": room_count, "members": member_count}),
        ),
        _ => ("404 Not Found", serde_json::json!({"error": "not found"})),
    };
    let body = body.to_string();

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
