use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wavecall_core::config::MediaConfig;
use wavecall_core::models::SdpType;
use wavecall_core::peer::{OfferOptions, PeerEvent, PeerEvents};
use wavecall_core::*;

/// Peer that reports `connected` as soon as both descriptions are in place.
struct LoopbackPeer {
    events: PeerEvents,
    candidates: Arc<AtomicUsize>,
}

impl LoopbackPeer {
    fn announce_candidate(&self, host: &str) {
        let _ = self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 {} 50000 typ host", host),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_track(&self, _track: &MediaTrack) -> Result<()> {
        Ok(())
    }

    async fn replace_track(&self, _old_track_id: &str, _track: &MediaTrack) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self, _options: OfferOptions) -> Result<SessionDescription> {
        self.announce_candidate("10.0.0.1");
        Ok(SessionDescription::offer("v=0 caller"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.announce_candidate("10.0.0.2");
        let _ = self.events.send(PeerEvent::StateChanged(PeerState::Connected));
        Ok(SessionDescription::answer("v=0 callee"))
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let _ = self
            .events
            .send(PeerEvent::RemoteTrack(MediaTrack::remote("remote-audio", MediaKind::Audio)));
        if description.sdp_type == SdpType::Answer {
            let _ = self.events.send(PeerEvent::StateChanged(PeerState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<()> {
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackFactory {
    candidates: Arc<AtomicUsize>,
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create(&self, _ice: &IceConfig, events: PeerEvents) -> Result<Arc<dyn PeerConnection>> {
        Ok(Arc::new(LoopbackPeer {
            events,
            candidates: Arc::clone(&self.candidates),
        }))
    }
}

fn client(user: &str, hub: &MemorySignalHub, store: &Arc<SqliteCallStore>, peers: &Arc<LoopbackFactory>) -> CallClient {
    CallClient::new(CallDeps {
        auth: Arc::new(StaticAuth::signed_in(user)),
        store: store.clone(),
        signals: Arc::new(hub.clone()),
        media: Arc::new(DeviceInventory::default()),
        peers: peers.clone(),
        ice: IceConfig::stun_only(),
        media_config: MediaConfig::default(),
    })
}

async fn next_matching(events: &mut CallEvents, mut pred: impl FnMut(&CallEvent) -> bool) -> CallEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for call event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_video_call_round_trip() {
    let hub = MemorySignalHub::new();
    let store = Arc::new(SqliteCallStore::in_memory().unwrap());
    let peers = Arc::new(LoopbackFactory::default());

    let alice = client("U1", &hub, &store, &peers);
    let bob = client("U2", &hub, &store, &peers);

    let mut incoming = bob.watch_incoming().await.unwrap();
    let (caller, mut caller_events) = alice.start_call("U2", CallType::Video).await.unwrap();

    let call = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.call_id, caller.call_id());
    assert_eq!(call.caller_id, "U1");
    assert_eq!(call.call_type, CallType::Video);

    let (callee, mut callee_events) = bob.answer_call(&call).await.unwrap();

    next_matching(&mut caller_events, |e| matches!(e, CallEvent::PhaseChanged(CallPhase::Answered))).await;
    next_matching(&mut callee_events, |e| matches!(e, CallEvent::PhaseChanged(CallPhase::Answered))).await;
    assert!(caller.is_connected());
    assert!(callee.is_connected());

    let record = store.get(caller.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert!(record.answered_at.is_some());

    let history = hub.history(caller.call_id());
    assert_eq!(history.iter().filter(|s| s.signal_type() == SignalType::Offer).count(), 1);
    assert_eq!(history.iter().filter(|s| s.signal_type() == SignalType::Answer).count(), 1);

    let summary = caller.end_call().await;
    assert_eq!(summary.reason, EndReason::LocalHangup);

    let ended = next_matching(&mut callee_events, |e| matches!(e, CallEvent::Ended(_))).await;
    match ended {
        CallEvent::Ended(summary) => {
            assert_eq!(summary.reason, EndReason::RemoteHangup("hangup".to_string()));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    assert!(callee.is_ended());
    assert!(!callee.is_connected());
    assert_eq!(hub.subscriber_count(caller.call_id()), 0);

    let record = store.get(caller.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.ended_at.is_some());
    assert!(peers.candidates.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_rejected_call_ends_caller() {
    let hub = MemorySignalHub::new();
    let store = Arc::new(SqliteCallStore::in_memory().unwrap());
    let peers = Arc::new(LoopbackFactory::default());

    let alice = client("U1", &hub, &store, &peers);
    let bob = client("U2", &hub, &store, &peers);

    let mut incoming = bob.watch_incoming().await.unwrap();
    let (caller, mut caller_events) = alice.start_call("U2", CallType::Audio).await.unwrap();
    let call = incoming.recv().await.unwrap();

    bob.reject_call(&call).await.unwrap();

    let ended = next_matching(&mut caller_events, |e| matches!(e, CallEvent::Ended(_))).await;
    match ended {
        CallEvent::Ended(summary) => {
            assert_eq!(summary.status, CallStatus::Rejected);
            assert_eq!(summary.duration_seconds, 0);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let record = store.get(caller.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Rejected);
}

#[tokio::test]
async fn test_unanswered_call_stays_initiated() {
    let hub = MemorySignalHub::new();
    let store = Arc::new(SqliteCallStore::in_memory().unwrap());
    let peers = Arc::new(LoopbackFactory::default());
    let alice = client("U1", &hub, &store, &peers);

    let (caller, _events) = alice.start_call("U2", CallType::Audio).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let record = store.get(caller.call_id()).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Initiated);
    assert_eq!(caller.phase(), CallPhase::Calling);
}
