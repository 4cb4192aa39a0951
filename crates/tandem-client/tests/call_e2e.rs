//! End-to-end call setup against a real relay on an ephemeral port

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use tandem_client::{
    CallDependencies, CallError, CallParams, CallSnapshot, ConnectionOrchestrator, JoinError,
    LocalMedia, MediaError, MediaStream, PeerError, PeerEventSink, PeerTransport,
    PeerTransportEvent, PeerTransportFactory, TrackKind, WsTransport,
};
use tandem_core::{Config, ConnectionStatus, ErrorCode, PeerSessionState, RoomId};
use tandem_signal::SignalServer;

const WAIT: Duration = Duration::from_secs(5);

struct NullMedia;

#[async_trait]
impl LocalMedia for NullMedia {
    async fn acquire(&self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new("null", vec![TrackKind::Audio, TrackKind::Video]))
    }

    async fn release(&self, _stream: &MediaStream) {}

    fn set_track_enabled(&self, _stream: &MediaStream, _kind: TrackKind, _enabled: bool) {}
}

/// Reports `connected` once its side of the offer/answer exchange is done
struct InstantPeer {
    sink: PeerEventSink,
}

#[async_trait]
impl PeerTransport for InstantPeer {
    async fn create_offer(&self) -> Result<Value, PeerError> {
        self.sink
            .emit(PeerTransportEvent::LocalCandidate(json!({"candidate": "host"})));
        Ok(json!({"type": "offer"}))
    }

    async fn create_answer(&self) -> Result<Value, PeerError> {
        self.sink
            .emit(PeerTransportEvent::StateChanged(PeerSessionState::Connected));
        Ok(json!({"type": "answer"}))
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), PeerError> {
        if description["type"] == "answer" {
            self.sink
                .emit(PeerTransportEvent::StateChanged(PeerSessionState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: Value) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct InstantPeers {
    created: AtomicU32,
}

impl PeerTransportFactory for InstantPeers {
    fn create(
        &self,
        _media: Option<&MediaStream>,
        sink: PeerEventSink,
    ) -> Result<Box<dyn PeerTransport>, PeerError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InstantPeer { sink }))
    }
}

async fn spawn_relay() -> (SignalServer, String) {
    let server = SignalServer::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.serve_listener(listener).await;
    });
    (server, format!("ws://{}", addr))
}

fn call(url: &str, room: &str, is_creator: bool) -> ConnectionOrchestrator {
    let mut config = Config::default();
    config.client.signal_url = url.to_string();
    config.join.base_delay_ms = 100;
    config.client.settle_delay_ms = 50;

    let transport = WsTransport::new(url, &config.channel_retry).unwrap();
    ConnectionOrchestrator::spawn(
        &config,
        CallParams {
            room_id: RoomId::from(room),
            is_creator,
        },
        CallDependencies {
            media: Arc::new(NullMedia),
            transport: Arc::new(transport),
            peers: Arc::new(InstantPeers::default()),
        },
    )
}

async fn wait_for(call: &ConnectionOrchestrator, status: ConnectionStatus) -> CallSnapshot {
    let mut rx = call.watch();
    let waited = tokio::time::timeout(WAIT, rx.wait_for(|s| s.status == status)).await;
    match waited {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("timed out waiting for {}, at {:?}", status, call.snapshot()),
    }
}

#[tokio::test]
async fn test_creator_and_joiner_connect() {
    let (server, url) = spawn_relay().await;
    let a = call(&url, "r1", true);
    let b = call(&url, "r1", false);

    a.start().await.unwrap();
    assert_eq!(a.status(), ConnectionStatus::Waiting);
    b.start().await.unwrap();

    wait_for(&a, ConnectionStatus::Connected).await;
    wait_for(&b, ConnectionStatus::Connected).await;
    assert_eq!(server.room_count(), 1);

    b.end_call().await;
    assert_eq!(b.status(), ConnectionStatus::Idle);
    wait_for(&a, ConnectionStatus::Waiting).await;

    a.shutdown().await;
}

#[tokio::test]
async fn test_joiner_before_creator() {
    let (_server, url) = spawn_relay().await;
    let a = call(&url, "r2", true);
    let b = call(&url, "r2", false);

    let joining = {
        let b = b.clone();
        tokio::spawn(async move { b.start().await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    a.start().await.unwrap();

    joining.await.unwrap().unwrap();
    wait_for(&a, ConnectionStatus::Connected).await;
    wait_for(&b, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_third_member_is_rejected() {
    let (server, url) = spawn_relay().await;
    let a = call(&url, "r3", true);
    let b = call(&url, "r3", false);
    let c = call(&url, "r3", false);

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(&b, ConnectionStatus::Connected).await;

    let err = c.start().await.unwrap_err();
    assert_eq!(err, CallError::Join(JoinError::Rejected(ErrorCode::RoomFull)));

    let snapshot = c.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.error, Some(err.user_message()));
    assert_eq!(server.registry().members(&RoomId::from("r3")).unwrap().len(), 2);
}

#[tokio::test]
async fn test_retry_after_peer_returns() {
    let (_server, url) = spawn_relay().await;
    let a = call(&url, "r4", true);
    let b = call(&url, "r4", false);

    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_for(&a, ConnectionStatus::Connected).await;

    b.end_call().await;
    wait_for(&a, ConnectionStatus::Waiting).await;

    // the joiner comes back and offers again
    b.handle_retry().await.unwrap();
    wait_for(&a, ConnectionStatus::Connected).await;
    wait_for(&b, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_unreachable_relay_reports_disconnected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let a = call(&url, "r5", true);
    let err = a.start().await.unwrap_err();

    assert!(matches!(err, CallError::Channel(_)));
    let snapshot = a.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.error.is_some());
}
