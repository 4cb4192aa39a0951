//! Call orchestration
//!
//! A [`ConnectionOrchestrator`] is a handle to a single actor task. The task
//! owns the media stream, the signaling channel and the peer session, and
//! every public call is a command on its mailbox. Call setup runs inside the
//! actor but stays interruptible: `end_call`, `handle_retry` and `shutdown`
//! drop an in-flight setup and tear down whatever it had acquired.
//!
//! The channel and the peer session each keep their own retry budget. The
//! actor coordinates them: peer retries are only scheduled while the channel
//! is connected and are cancelled whenever it drops, and a recovered channel
//! reruns the join handshake before renegotiating.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tandem_core::{Config, ConnectionStatus, ErrorCode, PeerSessionState, RetryConfig, RoomId, SignalKind};
use tandem_signal::{ClientMessage, ServerMessage};

use crate::channel::{ChannelError, ChannelEvent, ChannelSettings, ChannelState, ReconnectingChannel};
use crate::join::{JoinError, RoomJoinProtocol};
use crate::media::{LocalMedia, MediaError, MediaStream, TrackKind};
use crate::peer_session::{
    OutboundSignal, PeerError, PeerSession, PeerSessionEvent, PeerTransportFactory,
};
use crate::transport::SignalTransport;

/// Capabilities a call is built from
#[derive(Clone)]
pub struct CallDependencies {
    pub media: Arc<dyn LocalMedia>,
    pub transport: Arc<dyn SignalTransport>,
    pub peers: Arc<dyn PeerTransportFactory>,
}

/// Which room to use and which side of it we are
#[derive(Clone, Debug)]
pub struct CallParams {
    pub room_id: RoomId,
    /// The creator answers; the joiner makes the offer
    pub is_creator: bool,
}

/// Observable call state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallSnapshot {
    pub status: ConnectionStatus,
    /// Human-readable reason for the last failure
    pub error: Option<String>,
}

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("call setup was interrupted")]
    Cancelled,

    #[error("call has been shut down")]
    Stopped,
}

impl CallError {
    /// Message suitable for showing to the person on the call
    pub fn user_message(&self) -> String {
        match self {
            CallError::Media(e) => e.user_message(),
            CallError::Channel(e) => channel_message(e),
            CallError::Join(JoinError::Rejected(code)) => match code {
                ErrorCode::RoomFull => "This call already has two participants.".into(),
                ErrorCode::RoomNotFound => {
                    "The call was not found. Ask the other participant to start it first.".into()
                }
                ErrorCode::RoomAlreadyExists => "A call with this name is already running.".into(),
                other => format!("Could not join the call ({}).", other),
            },
            CallError::Join(JoinError::Channel(e)) => channel_message(e),
            CallError::Join(JoinError::Timeout) => "Timed out joining the call.".into(),
            CallError::Peer(e) => format!("Could not set up the connection: {}", e),
            CallError::Cancelled => "Call setup was cancelled.".into(),
            CallError::Stopped => "The call has ended.".into(),
        }
    }
}

fn channel_message(e: &ChannelError) -> String {
    match e {
        ChannelError::ConnectionTimeout => {
            "Could not reach the signaling server. Check your connection and try again.".into()
        }
        ChannelError::RetriesExhausted(_) => "Lost connection to the signaling server.".into(),
        other => format!("Signaling error: {}", other),
    }
}

const PEER_INTERRUPTED: &str = "Connection to the other participant was interrupted. Reconnecting...";
const PEER_LOST: &str = "Could not reconnect to the other participant.";

enum Command {
    Start(oneshot::Sender<Result<(), CallError>>),
    EndCall(oneshot::Sender<()>),
    Retry(oneshot::Sender<Result<(), CallError>>),
    SetTrack { kind: TrackKind, enabled: bool },
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Handle to a call actor
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CallSnapshot>,
}

impl ConnectionOrchestrator {
    /// Spawn the call actor on the current runtime. Nothing happens until `start`.
    pub fn spawn(config: &Config, params: CallParams, deps: CallDependencies) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallSnapshot::default());

        let actor = CallActor {
            commands: commands_rx,
            core: CallCore::new(config, params, deps, status_tx),
        };
        tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            status: status_rx,
        }
    }

    /// Acquire media, open the channel, join the room and set up the peer session
    ///
    /// A failure leaves the call `disconnected` with a user-facing message.
    pub async fn start(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.unwrap_or(Err(CallError::Stopped))
    }

    /// Tear everything down and return to `idle`
    pub async fn end_call(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::EndCall(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// `end_call`, wait for the settle delay, then `start` again
    pub async fn handle_retry(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Retry(tx))?;
        rx.await.unwrap_or(Err(CallError::Stopped))
    }

    /// Mute or unmute a local track; remembered across restarts
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        let _ = self.send(Command::SetTrack { kind, enabled });
    }

    /// End the call and stop the actor
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Shutdown(Some(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().status
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands.send(command).map_err(|_| CallError::Stopped)
    }
}

struct CallActor {
    commands: mpsc::UnboundedReceiver<Command>,
    core: CallCore,
}

impl CallActor {
    async fn run(mut self) {
        debug!(
            room = %self.core.params.room_id,
            creator = self.core.params.is_creator,
            "Call actor started"
        );

        loop {
            // outbound signals go out before any later event is handled
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let command = command.unwrap_or(Command::Shutdown(None));
                    if self.dispatch(command).await.is_break() {
                        break;
                    }
                }
                Some(signal) = self.core.outbound_rx.recv() => self.core.send_signal(signal),
                event = recv_channel_event(&mut self.core.channel_events) => match event {
                    Some(event) => self.core.on_channel_event(event).await,
                    None => self.core.channel_events = None,
                },
                event = next_session_event(&mut self.core.session) => {
                    self.core.on_session_event(event).await;
                }
                result = rejoin_finished(&mut self.core.rejoin) => {
                    self.core.rejoin = None;
                    self.core.on_rejoin(result).await;
                }
            }
        }

        debug!("Call actor stopped");
    }

    /// Run `first` and any command that interrupted it
    async fn dispatch(&mut self, first: Command) -> ControlFlow<()> {
        let mut next = Some(first);
        while let Some(command) = next.take() {
            next = match command {
                Command::Start(reply) => self.run_start(reply).await,
                Command::EndCall(reply) => {
                    self.core.end_call().await;
                    let _ = reply.send(());
                    None
                }
                Command::Retry(reply) => {
                    info!("Retrying call");
                    self.core.end_call().await;
                    match self.settle().await {
                        Ok(()) => self.run_start(reply).await,
                        Err(interrupt) => {
                            let _ = reply.send(Err(CallError::Cancelled));
                            Some(interrupt)
                        }
                    }
                }
                Command::SetTrack { kind, enabled } => {
                    self.core.set_track_enabled(kind, enabled);
                    None
                }
                Command::Shutdown(reply) => {
                    self.core.end_call().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return ControlFlow::Break(());
                }
            };
        }
        ControlFlow::Continue(())
    }

    /// Drive call setup while still listening to the mailbox
    ///
    /// Returns the command that interrupted setup, if any.
    async fn run_start(&mut self, reply: oneshot::Sender<Result<(), CallError>>) -> Option<Command> {
        let mut waiters = vec![reply];
        let mut deferred = Vec::new();
        let mut interrupt = None;

        let outcome = {
            let start = self.core.start();
            tokio::pin!(start);
            loop {
                tokio::select! {
                    result = &mut start => break Some(result),
                    command = self.commands.recv() => match command {
                        Some(Command::Start(extra)) => waiters.push(extra),
                        Some(Command::SetTrack { kind, enabled }) => deferred.push((kind, enabled)),
                        Some(other) => {
                            interrupt = Some(other);
                            break None;
                        }
                        None => {
                            interrupt = Some(Command::Shutdown(None));
                            break None;
                        }
                    },
                }
            }
        };

        let result = match outcome {
            Some(result) => result,
            None => {
                debug!("Call setup interrupted");
                self.core.teardown().await;
                Err(CallError::Cancelled)
            }
        };
        for (kind, enabled) in deferred {
            self.core.set_track_enabled(kind, enabled);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        interrupt
    }

    /// Wait out the settle delay; Err carries the command that cut it short
    async fn settle(&mut self) -> Result<(), Command> {
        let delay = tokio::time::sleep(self.core.settle_delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(Command::SetTrack { kind, enabled }) => {
                        self.core.set_track_enabled(kind, enabled);
                    }
                    Some(other) => return Err(other),
                    None => return Err(Command::Shutdown(None)),
                },
            }
        }
    }
}

/// Everything the actor owns besides its mailbox
struct CallCore {
    params: CallParams,
    deps: CallDependencies,
    join: RoomJoinProtocol,
    channel_settings: ChannelSettings,
    peer_retry: RetryConfig,
    settle_delay: Duration,
    status: watch::Sender<CallSnapshot>,

    media: Option<MediaStream>,
    tracks: HashMap<TrackKind, bool>,
    channel: Option<ReconnectingChannel>,
    channel_events: Option<broadcast::Receiver<ChannelEvent>>,
    channel_state: ChannelState,
    session: Option<PeerSession>,
    outbound_tx: mpsc::UnboundedSender<OutboundSignal>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundSignal>,
    rejoin: Option<JoinHandle<Result<(), JoinError>>>,
}

impl CallCore {
    fn new(
        config: &Config,
        params: CallParams,
        deps: CallDependencies,
        status: watch::Sender<CallSnapshot>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            params,
            deps,
            join: RoomJoinProtocol::new(&config.join, config.client.join_timeout()),
            channel_settings: ChannelSettings::from_config(&config.client, &config.channel_retry),
            peer_retry: config.peer_retry.clone(),
            settle_delay: config.client.settle_delay(),
            status,
            media: None,
            tracks: HashMap::new(),
            channel: None,
            channel_events: None,
            channel_state: ChannelState::Disconnected,
            session: None,
            outbound_tx,
            outbound_rx,
            rejoin: None,
        }
    }

    fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().status
    }

    fn set_status(&self, next: ConnectionStatus, error: Option<String>) {
        let current = self.current_status();
        if !current.can_transition_to(next) {
            warn!("Ignoring status change {} -> {}", current, next);
            return;
        }

        let changed = self.status.send_if_modified(|snapshot| {
            let changed = snapshot.status != next || snapshot.error != error;
            snapshot.status = next;
            snapshot.error = error;
            changed
        });
        if changed && current != next {
            info!(room = %self.params.room_id, "Call status {} -> {}", current, next);
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.current_status(),
            ConnectionStatus::Waiting | ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }

    async fn start(&mut self) -> Result<(), CallError> {
        if self.is_active() {
            debug!("Call already running");
            return Ok(());
        }
        // leftovers from a failed attempt
        self.teardown().await;
        self.set_status(ConnectionStatus::Waiting, None);

        match self.setup().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Call setup failed: {}", e);
                self.teardown().await;
                self.set_status(ConnectionStatus::Disconnected, Some(e.user_message()));
                Err(e)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), CallError> {
        let stream = self.deps.media.acquire().await?;
        for (kind, enabled) in &self.tracks {
            if stream.has_track(*kind) {
                self.deps.media.set_track_enabled(&stream, *kind, *enabled);
            }
        }
        self.media = Some(stream.clone());

        let channel = ReconnectingChannel::new(
            Arc::clone(&self.deps.transport),
            self.channel_settings.clone(),
        );
        self.channel_events = Some(channel.subscribe());
        self.channel_state = ChannelState::Disconnected;
        self.channel = Some(channel.clone());
        channel.connect().await?;

        self.join
            .run(&channel, &self.params.room_id, self.params.is_creator)
            .await?;

        let is_initiator = !self.params.is_creator;
        if is_initiator {
            self.set_status(ConnectionStatus::Connecting, None);
        }
        let session = self.session.insert(PeerSession::new(
            Arc::clone(&self.deps.peers),
            Some(stream),
            is_initiator,
            &self.peer_retry,
            self.outbound_tx.clone(),
        ));
        if is_initiator {
            session.create_offer().await?;
        }
        Ok(())
    }

    async fn end_call(&mut self) {
        self.teardown().await;
        self.set_status(ConnectionStatus::Idle, None);
    }

    /// Release session, channel and media, in that order
    async fn teardown(&mut self) {
        if let Some(task) = self.rejoin.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        if let Some(channel) = self.channel.take() {
            if channel.state() == ChannelState::Connected {
                let leave = ClientMessage::LeaveRoom {
                    room_id: self.params.room_id.clone(),
                };
                if let Err(e) = channel.send(&leave) {
                    debug!("Could not announce leave: {}", e);
                }
            }
            channel.disconnect().await;
        }
        self.channel_events = None;
        self.channel_state = ChannelState::Disconnected;
        while self.outbound_rx.try_recv().is_ok() {}

        if let Some(stream) = self.media.take() {
            self.deps.media.release(&stream).await;
        }
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        self.tracks.insert(kind, enabled);
        let Some(stream) = &self.media else {
            return;
        };
        if !stream.has_track(kind) {
            debug!("Stream has no {} track", kind);
            return;
        }
        debug!("{} track {}", kind, if enabled { "enabled" } else { "disabled" });
        self.deps.media.set_track_enabled(stream, kind, enabled);
    }

    fn send_signal(&self, signal: OutboundSignal) {
        let Some(channel) = &self.channel else {
            return;
        };
        let kind = signal.kind;
        let msg = ClientMessage::Signal {
            room_id: self.params.room_id.clone(),
            kind,
            payload: signal.payload,
        };
        if let Err(e) = channel.send(&msg) {
            debug!("Dropping outbound {}: {}", kind, e);
        }
    }

    /// Move to `connecting` when the call was idle-waiting or recovering
    fn begin_negotiation(&self) {
        if matches!(
            self.current_status(),
            ConnectionStatus::Waiting | ConnectionStatus::Disconnected
        ) {
            self.set_status(ConnectionStatus::Connecting, None);
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => self.on_channel_state(state).await,
            ChannelEvent::Message(msg) => self.on_relay_message(msg).await,
        }
    }

    async fn on_channel_state(&mut self, state: ChannelState) {
        let previous = std::mem::replace(&mut self.channel_state, state);
        match state {
            ChannelState::Reconnecting => {
                if let Some(session) = self.session.as_mut() {
                    session.cancel_pending_reconnect();
                }
                if let Some(task) = self.rejoin.take() {
                    task.abort();
                }
            }
            ChannelState::Connected if previous == ChannelState::Reconnecting => {
                info!("Signal channel back, rejoining {}", self.params.room_id);
                self.spawn_rejoin();
            }
            ChannelState::Failed => {
                let attempts = self
                    .channel
                    .as_ref()
                    .map_or(0, ReconnectingChannel::retry_attempts);
                let error = CallError::Channel(ChannelError::RetriesExhausted(attempts));
                warn!("{}", error);
                self.drop_signaling().await;
                self.set_status(ConnectionStatus::Disconnected, Some(error.user_message()));
            }
            _ => {}
        }
    }

    async fn on_relay_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Signal {
                from,
                kind,
                payload,
            } => {
                debug!("Received {} from {}", kind, from);
                self.on_signal(kind, payload).await;
            }
            ServerMessage::PeerJoined { member_id } => {
                info!("Peer {} joined {}", member_id, self.params.room_id);
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if !session.is_initiator() {
                    self.begin_negotiation();
                    return;
                }
                session.cancel_pending_reconnect();
                session.reset_retries();
                let restarted = session.reconnect(true).await;
                match restarted {
                    Ok(()) => self.begin_negotiation(),
                    Err(e) => warn!("Could not renegotiate with new peer: {}", e),
                }
            }
            ServerMessage::PeerLeft { member_id } => {
                info!("Peer {} left {}", member_id, self.params.room_id);
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.close().await;
                session.reset_retries();
                self.set_status(ConnectionStatus::Waiting, None);
            }
            ServerMessage::Error { code, message } => {
                warn!("Relay rejected a message: {} ({})", message, code);
            }
            other => debug!("Ignoring relay message {:?}", other),
        }
    }

    async fn on_signal(&mut self, kind: SignalKind, payload: serde_json::Value) {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {}: no peer session", kind);
            return;
        };

        match kind {
            SignalKind::Offer => {
                // the offer is the renegotiation
                session.cancel_pending_reconnect();
                match session.handle_offer(payload).await {
                    Ok(()) => self.begin_negotiation(),
                    Err(e) => warn!("Failed to handle offer: {}", e),
                }
            }
            SignalKind::Answer => {
                if let Err(e) = session.handle_answer(payload).await {
                    warn!("Failed to handle answer: {}", e);
                }
            }
            SignalKind::IceCandidate => session.handle_ice_candidate(payload).await,
        }
    }

    async fn on_session_event(&mut self, event: PeerSessionEvent) {
        let channel_up = self.channel_state == ChannelState::Connected;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            PeerSessionEvent::StateChanged(PeerSessionState::Connected) => {
                self.set_status(ConnectionStatus::Connected, None);
            }
            PeerSessionEvent::StateChanged(state) if state.is_unhealthy() => {
                warn!("Peer session {:?}", state);
                if !channel_up {
                    // retried once the channel has recovered and rejoined
                    self.set_status(
                        ConnectionStatus::Disconnected,
                        Some(PEER_INTERRUPTED.into()),
                    );
                    return;
                }
                if session.attempt_reconnection() {
                    self.set_status(
                        ConnectionStatus::Disconnected,
                        Some(PEER_INTERRUPTED.into()),
                    );
                } else {
                    session.close().await;
                    self.set_status(ConnectionStatus::Disconnected, Some(PEER_LOST.into()));
                }
            }
            PeerSessionEvent::StateChanged(_) => {}
            PeerSessionEvent::ReconnectDue => {
                if !channel_up {
                    debug!("Skipping peer reconnect while the channel is down");
                    return;
                }
                let is_initiator = session.is_initiator();
                match session.reconnect(is_initiator).await {
                    Ok(()) => self.begin_negotiation(),
                    Err(e) => {
                        warn!("Peer reconnect failed: {}", e);
                        if !session.attempt_reconnection() {
                            session.close().await;
                            self.set_status(
                                ConnectionStatus::Disconnected,
                                Some(PEER_LOST.into()),
                            );
                        }
                    }
                }
            }
        }
    }

    fn spawn_rejoin(&mut self) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        let protocol = self.join.clone();
        let room = self.params.room_id.clone();
        let is_creator = self.params.is_creator;

        let task = tokio::spawn(async move { protocol.run(&channel, &room, is_creator).await });
        if let Some(old) = self.rejoin.replace(task) {
            old.abort();
        }
    }

    async fn on_rejoin(&mut self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            let error = CallError::from(e);
            warn!("Rejoin after reconnect failed: {}", error);
            self.drop_signaling().await;
            self.set_status(ConnectionStatus::Disconnected, Some(error.user_message()));
            return;
        }

        info!("Rejoined {}", self.params.room_id);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        // the relay saw us leave, so the peer has dropped its session too
        session.close().await;
        session.reset_retries();
        let initiator = session.is_initiator();
        self.set_status(ConnectionStatus::Waiting, None);

        if !initiator {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            match session.reconnect(true).await {
                Ok(()) => self.begin_negotiation(),
                Err(e) => warn!("Could not renegotiate after rejoin: {}", e),
            }
        }
    }

    /// Give up on signaling but keep media until the call is ended or retried
    async fn drop_signaling(&mut self) {
        if let Some(task) = self.rejoin.take() {
            task.abort();
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.disconnect().await;
        }
        self.channel_events = None;
        self.channel_state = ChannelState::Disconnected;
    }
}

async fn recv_channel_event(
    events: &mut Option<broadcast::Receiver<ChannelEvent>>,
) -> Option<ChannelEvent> {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Call actor missed {} channel events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn next_session_event(session: &mut Option<PeerSession>) -> PeerSessionEvent {
    match session.as_mut() {
        Some(session) => session.next_event().await,
        None => std::future::pending().await,
    }
}

async fn rejoin_finished(task: &mut Option<JoinHandle<Result<(), JoinError>>>) -> Result<(), JoinError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(JoinError::Channel(ChannelError::Transport(e.to_string()))),
    }
}
