//! Peer session state machine
//!
//! Owns at most one live peer transport at a time. Every transport is created
//! with a sink tagged by a generation number; discarding a transport bumps the
//! generation, so late notifications from it are dropped in [`PeerSession::next_event`].
//! Renegotiation always builds a fresh transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::{PeerSessionState, RetryBudget, RetryConfig, SignalKind};

use crate::media::MediaStream;

/// Notification raised by a peer transport
#[derive(Clone, Debug, PartialEq)]
pub enum PeerTransportEvent {
    StateChanged(PeerSessionState),
    /// Locally gathered ICE candidate, to be relayed to the peer
    LocalCandidate(Value),
}

/// Where a peer transport reports its events
#[derive(Clone, Debug)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerTransportEvent)>,
}

impl PeerEventSink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the owning session is gone
    pub fn emit(&self, event: PeerTransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Peer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("operation not allowed for the {0} role")]
    WrongRole(&'static str),

    #[error("no active peer session")]
    NoSession,

    #[error("peer transport error: {0}")]
    Transport(String),
}

/// One negotiated peer-to-peer media transport
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<Value, PeerError>;

    /// Answer the remote offer already applied with `set_remote_description`
    async fn create_answer(&self) -> Result<Value, PeerError>;

    async fn set_remote_description(&self, description: Value) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError>;

    async fn close(&self);
}

/// Builds peer transports bound to the local media
pub trait PeerTransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        media: Option<&MediaStream>,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError>;
}

/// Negotiation message for the remote peer
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundSignal {
    pub kind: SignalKind,
    pub payload: Value,
}

/// What [`PeerSession::next_event`] reports to its owner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSessionEvent {
    StateChanged(PeerSessionState),
    /// A deferred reconnect scheduled by `attempt_reconnection` is due
    ReconnectDue,
}

pub struct PeerSession {
    factory: Arc<dyn PeerTransportFactory>,
    media: Option<MediaStream>,
    is_initiator: bool,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    transport: Option<Box<dyn PeerTransport>>,
    generation: u64,
    state: PeerSessionState,
    budget: RetryBudget,
    reconnect_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<(u64, PeerTransportEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, PeerTransportEvent)>,
}

impl PeerSession {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        media: Option<MediaStream>,
        is_initiator: bool,
        retry: &RetryConfig,
        outbound: mpsc::UnboundedSender<OutboundSignal>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            media,
            is_initiator,
            outbound,
            transport: None,
            generation: 0,
            state: PeerSessionState::New,
            budget: RetryBudget::from_config(retry),
            reconnect_at: None,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> PeerSessionState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.budget.attempts()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Initiator: create the transport if needed and send an offer
    pub async fn create_offer(&mut self) -> Result<(), PeerError> {
        if !self.is_initiator {
            return Err(PeerError::WrongRole("responder"));
        }
        if self.transport.is_none() || self.state == PeerSessionState::Closed {
            self.replace_transport().await?;
        }

        let offer = self.current()?.create_offer().await?;
        self.set_state(PeerSessionState::Connecting);
        self.emit(SignalKind::Offer, offer);
        debug!("Sent offer (generation {})", self.generation);
        Ok(())
    }

    /// Responder: apply a remote offer and answer it
    ///
    /// An offer for a session that has already left `New` renegotiates on a
    /// fresh transport.
    pub async fn handle_offer(&mut self, payload: Value) -> Result<(), PeerError> {
        if self.is_initiator {
            return Err(PeerError::WrongRole("initiator"));
        }
        if self.transport.is_none() || self.state != PeerSessionState::New {
            self.replace_transport().await?;
        }

        let transport = self.current()?;
        transport.set_remote_description(payload).await?;
        let answer = transport.create_answer().await?;
        self.set_state(PeerSessionState::Connecting);
        self.emit(SignalKind::Answer, answer);
        debug!("Sent answer (generation {})", self.generation);
        Ok(())
    }

    pub async fn handle_answer(&mut self, payload: Value) -> Result<(), PeerError> {
        self.current()?.set_remote_description(payload).await
    }

    /// Apply a remote candidate; failures are only logged
    pub async fn handle_ice_candidate(&mut self, payload: Value) {
        let Ok(transport) = self.current() else {
            debug!("Dropping ICE candidate: no active session");
            return;
        };
        if let Err(e) = transport.add_ice_candidate(payload).await {
            warn!("Failed to add ICE candidate: {}", e);
        }
    }

    /// Discard the current transport and start over; the initiator offers at once
    pub async fn reconnect(&mut self, is_initiator: bool) -> Result<(), PeerError> {
        self.is_initiator = is_initiator;
        self.reconnect_at = None;
        self.replace_transport().await?;
        info!(
            "Peer session restarted (generation {}, initiator: {})",
            self.generation, is_initiator
        );

        if is_initiator {
            self.create_offer().await?;
        }
        Ok(())
    }

    /// Schedule one deferred reconnect with exponential backoff
    ///
    /// Returns false once the retry budget is exhausted.
    pub fn attempt_reconnection(&mut self) -> bool {
        match self.budget.next_delay() {
            Some(delay) => {
                info!(
                    "Peer reconnect {}/{} in {:?}",
                    self.budget.attempts(),
                    self.budget.max(),
                    delay
                );
                self.reconnect_at = Some(Instant::now() + delay);
                true
            }
            None => {
                warn!("Peer reconnect budget exhausted");
                false
            }
        }
    }

    pub fn cancel_pending_reconnect(&mut self) {
        if self.reconnect_at.take().is_some() {
            debug!("Cancelled pending peer reconnect");
        }
    }

    pub fn reset_retries(&mut self) {
        self.budget.reset();
    }

    /// Close the current transport; later events from it are ignored
    pub async fn close(&mut self) {
        self.reconnect_at = None;
        self.generation += 1;
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.state = PeerSessionState::Closed;
    }

    /// Wait for the next state change or a due reconnect
    ///
    /// Local candidates are forwarded as `ice-candidate` signals on the way.
    /// Cancel safe.
    pub async fn next_event(&mut self) -> PeerSessionEvent {
        loop {
            let deadline = self.reconnect_at;
            tokio::select! {
                Some((generation, event)) = self.events_rx.recv() => {
                    if generation != self.generation {
                        debug!("Ignoring event from discarded session {}", generation);
                        continue;
                    }
                    match event {
                        PeerTransportEvent::LocalCandidate(candidate) => {
                            self.emit(SignalKind::IceCandidate, candidate);
                        }
                        PeerTransportEvent::StateChanged(next) => {
                            if self.apply_state(next) {
                                return PeerSessionEvent::StateChanged(next);
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.reconnect_at = None;
                    return PeerSessionEvent::ReconnectDue;
                }
            }
        }
    }

    async fn replace_transport(&mut self) -> Result<(), PeerError> {
        if let Some(old) = self.transport.take() {
            old.close().await;
        }
        self.generation += 1;
        self.state = PeerSessionState::New;

        let sink = PeerEventSink {
            generation: self.generation,
            tx: self.events_tx.clone(),
        };
        self.transport = Some(self.factory.create(self.media.as_ref(), sink)?);
        Ok(())
    }

    fn current(&self) -> Result<&dyn PeerTransport, PeerError> {
        match &self.transport {
            Some(transport) if self.state != PeerSessionState::Closed => Ok(transport.as_ref()),
            _ => Err(PeerError::NoSession),
        }
    }

    fn apply_state(&mut self, next: PeerSessionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            debug!("Ignoring peer transition {:?} -> {:?}", self.state, next);
            return false;
        }
        self.set_state(next);
        if next == PeerSessionState::Connected {
            self.budget.reset();
            self.reconnect_at = None;
        }
        true
    }

    fn set_state(&mut self, next: PeerSessionState) {
        if self.state != next {
            debug!("Peer session {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn emit(&self, kind: SignalKind, payload: Value) {
        if self.outbound.send(OutboundSignal { kind, payload }).is_err() {
            debug!("Dropping outbound {}: receiver gone", kind);
        }
    }
}
