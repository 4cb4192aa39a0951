//! Reconnecting signaling channel
//!
//! Wraps a [`SignalTransport`] with connection state, request/ack correlation
//! and a supervisory retry budget. Recovery after an unexpected drop runs on
//! two tracks at once: the transport's own reconnection loop, and a poll that
//! counts attempts and gives up once the budget is spent. Whichever notices
//! the link back first marks the channel connected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_core::{ClientConfig, ErrorCode, MemberId, RetryBudget, RetryConfig};
use tandem_signal::{ClientMessage, ServerMessage};

use crate::transport::{SignalTransport, TransportEvent};

const EVENT_CAPACITY: usize = 256;

/// Outcome of a create/join request as acknowledged by the relay
pub type AckResult = Result<(), ErrorCode>;

/// Channel connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget spent; only an explicit `connect` leaves this state
    Failed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events re-broadcast to channel subscribers
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    StateChanged(ChannelState),
    /// Any relay message other than an ack
    Message(ServerMessage),
}

/// Channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("timed out connecting to the signal server")]
    ConnectionTimeout,

    #[error("signal channel is not connected")]
    NotConnected,

    #[error("signal server did not answer in time")]
    RequestTimeout,

    #[error("signal channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gave up reconnecting after {0} attempts")]
    RetriesExhausted(u32),
}

impl ChannelError {
    /// Wire-style code, when one applies
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ChannelError::ConnectionTimeout => Some(ErrorCode::ConnectionTimeout),
            _ => None,
        }
    }
}

/// Timeouts and retry policy for one channel
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl ChannelSettings {
    pub fn from_config(client: &ClientConfig, retry: &RetryConfig) -> Self {
        Self {
            connect_timeout: client.connect_timeout(),
            request_timeout: client.request_timeout(),
            retry: retry.clone(),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default(), &RetryConfig::default())
    }
}

/// Signaling channel with automatic reconnection
#[derive(Clone)]
pub struct ReconnectingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    transport: Arc<dyn SignalTransport>,
    settings: ChannelSettings,
    state: Mutex<ChannelState>,
    budget: Mutex<RetryBudget>,
    member_id: Mutex<Option<MemberId>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AckResult>>>,
    next_request_id: AtomicU64,
    events: broadcast::Sender<ChannelEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingChannel {
    pub fn new(transport: Arc<dyn SignalTransport>, settings: ChannelSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let budget = RetryBudget::from_config(&settings.retry);

        Self {
            inner: Arc::new(ChannelInner {
                transport,
                settings,
                state: Mutex::new(ChannelState::Disconnected),
                budget: Mutex::new(budget),
                member_id: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                events,
                listener: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the channel
    ///
    /// An attempt that does not finish within the connect timeout fails with
    /// [`ChannelError::ConnectionTimeout`] and is not retried here.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Connected {
            return Ok(());
        }
        self.inner.set_state(ChannelState::Connecting);
        self.spawn_listener();

        let opened =
            tokio::time::timeout(self.inner.settings.connect_timeout, self.inner.transport.open())
                .await;

        match opened {
            Ok(Ok(())) if self.inner.finish_connect() => {
                info!("Signal channel connected");
                Ok(())
            }
            Ok(Ok(())) => {
                warn!("Signal link dropped before the connect finished");
                self.abort_tasks();
                self.inner.transport.close().await;
                self.inner.set_state(ChannelState::Disconnected);
                Err(ChannelError::Closed)
            }
            Ok(Err(e)) => {
                warn!("Signal channel connect failed: {}", e);
                self.abort_tasks();
                self.inner.transport.close().await;
                self.inner.set_state(ChannelState::Disconnected);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Signal channel connect timed out after {:?}",
                    self.inner.settings.connect_timeout
                );
                self.abort_tasks();
                self.inner.transport.close().await;
                self.inner.set_state(ChannelState::Disconnected);
                Err(ChannelError::ConnectionTimeout)
            }
        }
    }

    /// Close the channel locally; no reconnection follows
    pub async fn disconnect(&self) {
        self.inner.set_state(ChannelState::Disconnected);
        self.abort_tasks();
        self.inner.fail_pending();
        self.inner.member_id.lock().take();
        self.inner.transport.close().await;
        debug!("Signal channel closed");
    }

    /// Send a message that expects no reply
    pub fn send(&self, msg: &ClientMessage) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Connected {
            return Err(ChannelError::NotConnected);
        }
        self.inner.transport.send(msg)
    }

    /// Send a request built around a fresh request id and await its ack
    pub async fn request<F>(&self, build: F) -> Result<AckResult, ChannelError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(&build(request_id)) {
            self.inner.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.settings.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // pending requests are dropped when the link goes down
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(ChannelError::RequestTimeout)
            }
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    /// Id the relay assigned on the current link
    pub fn member_id(&self) -> Option<MemberId> {
        self.inner.member_id.lock().clone()
    }

    /// Supervisory attempts recorded since the last successful connect
    pub fn retry_attempts(&self) -> u32 {
        self.inner.budget.lock().attempts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_listener(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let rx = self.inner.transport.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(listen(weak, rx)));
    }

    fn abort_tasks(&self) {
        if let Some(task) = self.inner.supervisor.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.listener.lock().take() {
            task.abort();
        }
    }
}

async fn listen(inner: Weak<ChannelInner>, mut rx: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Signal channel dropped {} transport events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_transport_event(event);
    }
}

impl ChannelInner {
    fn set_state(&self, next: ChannelState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            debug!("Signal channel {} -> {}", prev, next);
            let _ = self.events.send(ChannelEvent::StateChanged(next));
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// `Connecting -> Connected`, only if nothing moved the state meanwhile
    /// and the link is still up
    fn finish_connect(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Connecting || !self.transport.is_connected() {
                return false;
            }
            self.budget.lock().reset();
            *state = ChannelState::Connected;
        }
        debug!("Signal channel {} -> {}", ChannelState::Connecting, ChannelState::Connected);
        let _ = self.events.send(ChannelEvent::StateChanged(ChannelState::Connected));
        true
    }

    fn fail_pending(&self) {
        // dropping the senders wakes every waiter with `Closed`
        self.pending.lock().clear();
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(ServerMessage::Ack {
                request_id,
                ok,
                reason,
            }) => {
                let ack = if ok {
                    Ok(())
                } else {
                    Err(reason.unwrap_or(ErrorCode::InvalidMessage))
                };
                match self.pending.lock().remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(ack);
                    }
                    None => debug!("Ack for unknown request {}", request_id),
                }
            }
            TransportEvent::Message(msg) => {
                if let ServerMessage::Welcome { member_id } = &msg {
                    debug!("Relay assigned member id {}", member_id);
                    *self.member_id.lock() = Some(member_id.clone());
                }
                let _ = self.events.send(ChannelEvent::Message(msg));
            }
            TransportEvent::Disconnected { reason } => self.on_lost(reason),
            TransportEvent::Connected => {
                if let Some(task) = self.supervisor.lock().take() {
                    task.abort();
                }
                self.mark_reconnected();
            }
        }
    }

    fn on_lost(self: &Arc<Self>, reason: String) {
        match self.state() {
            ChannelState::Connected | ChannelState::Connecting => {}
            // already recovering, or closed on purpose
            _ => return,
        }
        warn!("Signal channel lost ({}), reconnecting", reason);

        self.set_state(ChannelState::Reconnecting);
        self.fail_pending();
        self.member_id.lock().take();
        self.transport.restart_reconnect();

        let weak = Arc::downgrade(self);
        let interval = self.budget.lock().base_delay();
        let task = tokio::spawn(supervise(weak, interval));
        if let Some(old) = self.supervisor.lock().replace(task) {
            old.abort();
        }
    }

    fn mark_reconnected(&self) {
        if self.state() != ChannelState::Reconnecting {
            return;
        }
        self.budget.lock().reset();
        self.set_state(ChannelState::Connected);
        info!("Signal channel reconnected");
    }
}

/// Supervisory poll while the channel is reconnecting
async fn supervise(inner: Weak<ChannelInner>, interval: Duration) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.state() != ChannelState::Reconnecting {
            return;
        }
        if inner.transport.is_connected() {
            inner.mark_reconnected();
            return;
        }

        let exhausted = {
            let mut budget = inner.budget.lock();
            budget.record_attempt();
            debug!(
                "Signal channel still down (attempt {}/{})",
                budget.attempts(),
                budget.max()
            );
            budget.is_exhausted()
        };
        if exhausted {
            let attempts = inner.budget.lock().attempts();
            warn!("{}", ChannelError::RetriesExhausted(attempts));
            inner.set_state(ChannelState::Failed);
            inner.transport.close().await;
            return;
        }
    }
}
