//! Signaling transport: one message-oriented link between a client and the relay
//!
//! [`SignalTransport`] is the seam the reconnecting channel is built on. The
//! WebSocket implementation owns its own reconnection loop, which the channel
//! restarts after an unexpected drop and supervises separately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use tandem_core::RetryConfig;
use tandem_signal::{ClientMessage, ServerMessage};

use crate::channel::ChannelError;

/// Capacity of the transport event broadcast
const EVENT_CAPACITY: usize = 256;

/// Lifecycle and inbound traffic of a transport
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Link is up (initial open or a native reconnect)
    Connected,
    /// Link dropped without a local `close`
    Disconnected { reason: String },
    /// Decoded message from the relay
    Message(ServerMessage),
}

/// Bidirectional link to the relay
#[async_trait]
pub trait SignalTransport: Send + Sync + 'static {
    /// Open the link; resolves once connected
    async fn open(&self) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    /// Queue a message for the relay
    fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Reset and (re)start the transport's own reconnection loop
    fn restart_reconnect(&self);

    /// Close locally. No `Disconnected` event and no reconnection follow.
    async fn close(&self);
}

/// WebSocket transport (tokio-tungstenite)
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    url: Url,
    base_delay: Duration,
    max_delay: Duration,
    connected: AtomicBool,
    closed: AtomicBool,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: broadcast::Sender<TransportEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Create a transport for `url`; `retry` paces native reconnects
    pub fn new(url: &str, retry: &RetryConfig) -> Result<Self, ChannelError> {
        let url = Url::parse(url).map_err(|e| ChannelError::Transport(e.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(WsInner {
                url,
                base_delay: retry.base_delay(),
                max_delay: retry.max_delay(),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                outgoing: Mutex::new(None),
                events,
                pump: Mutex::new(None),
                reconnect: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl SignalTransport for WsTransport {
    async fn open(&self) -> Result<(), ChannelError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        debug!("Connecting to signal server: {}", self.inner.url);

        let (ws, _response) = connect_async(self.inner.url.as_str())
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        attach(&self.inner, ws);
        info!("Connected to signal server");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
        let json = msg
            .to_json()
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        let outgoing = self.inner.outgoing.lock();
        match outgoing.as_ref() {
            Some(tx) if self.is_connected() => tx
                .send(Message::Text(json))
                .map_err(|_| ChannelError::NotConnected),
            _ => Err(ChannelError::NotConnected),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn restart_reconnect(&self) {
        spawn_reconnect(&self.inner);
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);

        if let Some(task) = self.inner.reconnect.lock().take() {
            task.abort();
        }
        // dropping the sender lets the pump send a close frame and exit
        self.inner.outgoing.lock().take();
        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            if tokio::time::timeout(Duration::from_secs(1), pump).await.is_err() {
                debug!("WebSocket pump did not finish closing in time");
            }
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Wire a freshly connected socket into the transport
fn attach(inner: &Arc<WsInner>, ws: WsStream) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    *inner.outgoing.lock() = Some(tx);
    inner.connected.store(true, Ordering::SeqCst);
    let _ = inner.events.send(TransportEvent::Connected);

    let pump_inner = Arc::clone(inner);
    let pump = tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            break e.to_string();
                        }
                    }
                    None => {
                        // local close
                        let _ = sink.close().await;
                        return;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(msg) => {
                            let _ = pump_inner.events.send(TransportEvent::Message(msg));
                        }
                        Err(e) => warn!("Ignoring undecodable relay message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break "closed by relay".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                },
            }
        };
        on_lost(&pump_inner, reason);
    });

    if let Some(old) = inner.pump.lock().replace(pump) {
        old.abort();
    }
}

fn on_lost(inner: &Arc<WsInner>, reason: String) {
    inner.connected.store(false, Ordering::SeqCst);
    inner.outgoing.lock().take();

    if inner.closed.load(Ordering::SeqCst) {
        return;
    }
    warn!("Signal connection lost: {}", reason);
    let _ = inner.events.send(TransportEvent::Disconnected { reason });
}

/// Delay after a failed reconnect: doubled, capped at `max`
fn next_delay(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Native reconnection loop with exponential backoff, until connected or closed
///
/// Every restart begins again at the base delay.
fn spawn_reconnect(inner: &Arc<WsInner>) {
    let loop_inner = Arc::clone(inner);
    let task = tokio::spawn(async move {
        let mut attempt: u32 = 0;
        let mut delay = loop_inner.base_delay.min(loop_inner.max_delay);
        loop {
            tokio::time::sleep(delay).await;
            if loop_inner.closed.load(Ordering::SeqCst) {
                return;
            }
            if loop_inner.connected.load(Ordering::SeqCst) {
                return;
            }

            attempt += 1;
            debug!("Reconnecting to {} (attempt {})", loop_inner.url, attempt);
            match connect_async(loop_inner.url.as_str()).await {
                Ok((ws, _)) => {
                    if loop_inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    info!("Reconnected to signal server");
                    attach(&loop_inner, ws);
                    return;
                }
                Err(e) => {
                    delay = next_delay(delay, loop_inner.max_delay);
                    debug!("Reconnect failed: {}, next try in {:?}", e, delay);
                }
            }
        }
    });

    if let Some(old) = inner.reconnect.lock().replace(task) {
        old.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use tandem_signal::SignalServer;
    use tokio::net::TcpListener;

    fn retry(base_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
        }
    }

    async fn spawn_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = SignalServer::new().serve_listener(listener).await;
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            WsTransport::new("not a url", &retry(10, 100)),
            Err(ChannelError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = WsTransport::new("ws://127.0.0.1:9", &retry(10, 100)).unwrap();
        let err = transport
            .send(&ClientMessage::Ping { timestamp: 1 })
            .unwrap_err();
        assert_eq!(err, ChannelError::NotConnected);
    }

    #[tokio::test]
    async fn test_open_receives_welcome_and_pong() {
        let url = spawn_relay().await;
        let transport = WsTransport::new(&url, &retry(10, 100)).unwrap();
        let mut events = transport.subscribe();

        transport.open().await.unwrap();
        assert!(transport.is_connected());
        transport.send(&ClientMessage::Ping { timestamp: 42 }).unwrap();

        let mut saw_welcome = false;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Message(ServerMessage::Welcome { .. }) => saw_welcome = true,
                TransportEvent::Message(ServerMessage::Pong { timestamp }) => {
                    assert_eq!(timestamp, 42);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_welcome);

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_reconnect_delay_doubles_up_to_max() {
        let max = Duration::from_millis(400);
        let mut delay = Duration::from_millis(50);
        let mut seen = Vec::new();
        for _ in 0..5 {
            delay = next_delay(delay, max);
            seen.push(delay.as_millis());
        }
        assert_eq!(seen, vec![100, 200, 400, 400, 400]);
    }

    #[tokio::test]
    async fn test_reconnect_backs_off() {
        // accepts TCP, then drops it before the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let transport = WsTransport::new(&url, &retry(50, 1_000)).unwrap();
        transport.restart_reconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.close().await;

        // 50 + 100 + 200 + 400 ms puts the fifth try past one second
        let attempts = accepted.load(Ordering::SeqCst);
        assert!((2..=5).contains(&attempts), "attempts: {}", attempts);
        assert!(!transport.is_connected());
    }
}
