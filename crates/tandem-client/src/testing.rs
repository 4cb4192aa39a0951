//! In-memory media and peer transport fakes for unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use tandem_core::PeerSessionState;

use crate::media::{LocalMedia, MediaError, MediaStream, TrackKind};
use crate::peer_session::{
    PeerError, PeerEventSink, PeerTransport, PeerTransportEvent, PeerTransportFactory,
};

/// Test-side view of one fake transport
#[derive(Clone)]
pub struct FakePeerHandle {
    sink: PeerEventSink,
    closed: Arc<AtomicBool>,
    remote: Arc<Mutex<Vec<Value>>>,
}

impl FakePeerHandle {
    pub fn emit(&self, event: PeerTransportEvent) {
        self.sink.emit(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_descriptions(&self) -> Vec<Value> {
        self.remote.lock().clone()
    }
}

struct FakePeerTransport {
    handle: FakePeerHandle,
    auto_connect: bool,
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        Ok(json!({"type": "offer", "sdp": format!("offer-{}", self.handle.sink.generation())}))
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        if self.auto_connect {
            self.handle
                .emit(PeerTransportEvent::StateChanged(PeerSessionState::Connected));
        }
        Ok(json!({"type": "answer", "sdp": format!("answer-{}", self.handle.sink.generation())}))
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), PeerError> {
        let is_answer = description["type"] == "answer";
        self.handle.remote.lock().push(description);
        if is_answer && self.auto_connect {
            self.handle
                .emit(PeerTransportEvent::StateChanged(PeerSessionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        if candidate.is_null() {
            return Err(PeerError::Transport("empty candidate".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.handle.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory that records every transport it builds
#[derive(Default)]
pub struct FakePeerFactory {
    transports: Mutex<Vec<FakePeerHandle>>,
    auto_connect: bool,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transports report `connected` as soon as negotiation completes
    pub fn auto_connecting() -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(Vec::new()),
            auto_connect: true,
        })
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn transport(&self, index: usize) -> FakePeerHandle {
        self.transports.lock()[index].clone()
    }

    pub fn latest(&self) -> FakePeerHandle {
        let transports = self.transports.lock();
        transports[transports.len() - 1].clone()
    }
}

impl PeerTransportFactory for FakePeerFactory {
    fn create(
        &self,
        _media: Option<&MediaStream>,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        let handle = FakePeerHandle {
            sink,
            closed: Arc::new(AtomicBool::new(false)),
            remote: Arc::new(Mutex::new(Vec::new())),
        };
        self.transports.lock().push(handle.clone());
        Ok(Box::new(FakePeerTransport {
            handle,
            auto_connect: self.auto_connect,
        }))
    }
}

/// Media source with a scripted outcome
#[derive(Default)]
pub struct FakeMedia {
    failure: Mutex<Option<MediaError>>,
    audio_only: bool,
    acquired: AtomicU32,
    released: AtomicU32,
    toggles: Mutex<Vec<(TrackKind, bool)>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        let media = Self::default();
        *media.failure.lock() = Some(error);
        Arc::new(media)
    }

    /// Capture device without a camera
    pub fn audio_only() -> Arc<Self> {
        Arc::new(Self {
            audio_only: true,
            ..Self::default()
        })
    }

    pub fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u32 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn toggles(&self) -> Vec<(TrackKind, bool)> {
        self.toggles.lock().clone()
    }
}

#[async_trait]
impl LocalMedia for FakeMedia {
    async fn acquire(&self) -> Result<MediaStream, MediaError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let tracks = if self.audio_only {
            vec![TrackKind::Audio]
        } else {
            vec![TrackKind::Audio, TrackKind::Video]
        };
        Ok(MediaStream::new(format!("stream-{}", n), tracks))
    }

    async fn release(&self, _stream: &MediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn set_track_enabled(&self, _stream: &MediaStream, kind: TrackKind, enabled: bool) {
        self.toggles.lock().push((kind, enabled));
    }
}
