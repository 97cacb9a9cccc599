//! Call session: one object per call owning its peer connection, media,
//! signaling subscription and timer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::auth::AuthProvider;
use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::ice::IceConfig;
use crate::media::{FacingMode, LocalStream, MediaDevices, MediaKind, MediaRequest, RemoteStream};
use crate::models::{
    call_duration_seconds, make_call_id, CallRecord, CallRecordUpdate, CallStatus, CallType,
    IceCandidate, IncomingCall, SessionDescription, Signal, SignalPayload,
};
use crate::peer::{OfferOptions, PeerConnection, PeerEvent, PeerFactory, PeerState};
use crate::signaling::{SignalTransport, SubscriptionHandle};
use crate::store::CallStore;
use crate::timer::CallTimer;

/// Collaborators shared by every call of one client.
#[derive(Clone)]
pub struct CallDeps {
    pub auth: Arc<dyn AuthProvider>,
    pub store: Arc<dyn CallStore>,
    pub signals: Arc<dyn SignalTransport>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub ice: IceConfig,
    pub media_config: MediaConfig,
}

// ============================================================================
// Phases, events, reasons
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    Answered,
    Ended,
}

impl CallPhase {
    /// Record status persisted on entering this phase.
    pub fn status(self) -> Option<CallStatus> {
        match self {
            CallPhase::Idle => None,
            CallPhase::Calling => Some(CallStatus::Initiated),
            CallPhase::Ringing => Some(CallStatus::Ringing),
            CallPhase::Answered => Some(CallStatus::Answered),
            CallPhase::Ended => Some(CallStatus::Ended),
        }
    }

    pub fn can_advance_to(self, next: CallPhase) -> bool {
        match (self, next) {
            (CallPhase::Ended, _) => false,
            (_, CallPhase::Ended) => true,
            (CallPhase::Idle, CallPhase::Calling | CallPhase::Ringing) => true,
            (CallPhase::Calling | CallPhase::Ringing, CallPhase::Answered) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Calling => "calling",
            CallPhase::Ringing => "ringing",
            CallPhase::Answered => "answered",
            CallPhase::Ended => "ended",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup(String),
    Rejected,
    Connection(PeerState),
    MediaFailure,
    Error(String),
}

impl EndReason {
    /// Value of `reason` in the `call_end` signal.
    pub fn signal_reason(&self) -> String {
        match self {
            EndReason::LocalHangup => "hangup".to_string(),
            EndReason::RemoteHangup(reason) => reason.clone(),
            EndReason::Rejected => "rejected".to_string(),
            EndReason::Connection(state) => state.as_str().to_string(),
            EndReason::MediaFailure => "media_failure".to_string(),
            EndReason::Error(_) => "error".to_string(),
        }
    }

    pub fn status(&self) -> CallStatus {
        match self {
            EndReason::Rejected => CallStatus::Rejected,
            EndReason::RemoteHangup(reason) if reason == "rejected" => CallStatus::Rejected,
            EndReason::MediaFailure | EndReason::Error(_) => CallStatus::Failed,
            _ => CallStatus::Ended,
        }
    }

    fn notifies_remote(&self) -> bool {
        !matches!(self, EndReason::RemoteHangup(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub call_id: String,
    pub reason: EndReason,
    pub status: CallStatus,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    ConnectionState(PeerState),
    RemoteStream(RemoteStream),
    Duration(u64),
    /// User-facing message, e.g. a denied device.
    Alert(String),
    Ended(CallSummary),
}

pub type CallEvents = mpsc::UnboundedReceiver<CallEvent>;

// ============================================================================
// Session
// ============================================================================

struct SessionState {
    phase: CallPhase,
    peer: Option<Arc<dyn PeerConnection>>,
    local_stream: LocalStream,
    remote_stream: RemoteStream,
    subscription: Option<SubscriptionHandle>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    offer_handled: bool,
    connected: bool,
    answered_at: Option<DateTime<Utc>>,
    timer: Option<CallTimer>,
    summary: Option<CallSummary>,
}

struct SessionInner {
    deps: CallDeps,
    call_id: String,
    local_user_id: String,
    remote_user_id: String,
    call_type: CallType,
    role: CallRole,
    started_at: DateTime<Utc>,
    epoch: watch::Sender<u64>,
    events: mpsc::UnboundedSender<CallEvent>,
    state: Mutex<SessionState>,
}

/// Handle to one call. Clones refer to the same call.
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    fn new(
        deps: CallDeps,
        call_id: String,
        local_user_id: String,
        remote_user_id: String,
        call_type: CallType,
        role: CallRole,
        started_at: DateTime<Utc>,
    ) -> (Self, CallEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (epoch, _) = watch::channel(0u64);

        let inner = SessionInner {
            deps,
            call_id,
            local_user_id,
            remote_user_id,
            call_type,
            role,
            started_at,
            epoch,
            events,
            state: Mutex::new(SessionState {
                phase: CallPhase::Idle,
                peer: None,
                local_stream: LocalStream::default(),
                remote_stream: RemoteStream::default(),
                subscription: None,
                pending_candidates: Vec::new(),
                remote_description_set: false,
                offer_handled: false,
                connected: false,
                answered_at: None,
                timer: None,
                summary: None,
            }),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Places a call to `receiver_id`.
    pub async fn start(deps: CallDeps, receiver_id: &str, call_type: CallType) -> Result<(Self, CallEvents)> {
        let receiver_id = receiver_id.trim();
        if receiver_id.is_empty() {
            return Err(Error::InvalidReceiver);
        }

        let user_id = deps
            .auth
            .current_user_id()
            .await?
            .ok_or(Error::NotAuthenticated)?;

        let now = Utc::now();
        let call_id = make_call_id(&user_id, receiver_id, now);
        let record = CallRecord::initiated(&call_id, &user_id, receiver_id, call_type, now);
        deps.store.create(&record).await?;

        tracing::info!("Starting {} call {} to {}", call_type, call_id, receiver_id);

        let (session, events) = Self::new(
            deps,
            call_id,
            user_id,
            receiver_id.to_string(),
            call_type,
            CallRole::Caller,
            now,
        );
        session.inner.advance(CallPhase::Calling)?;

        if let Err(e) = session.inner.setup_caller().await {
            session.inner.abort(&e).await;
            return Err(e);
        }
        Ok((session, events))
    }

    /// Picks up `incoming` on the callee side.
    pub async fn answer(deps: CallDeps, incoming: &IncomingCall) -> Result<(Self, CallEvents)> {
        let user_id = deps
            .auth
            .current_user_id()
            .await?
            .ok_or(Error::NotAuthenticated)?;

        tracing::info!("Answering call {} from {}", incoming.call_id, incoming.caller_id);

        let (session, events) = Self::new(
            deps,
            incoming.call_id.clone(),
            user_id,
            incoming.caller_id.clone(),
            incoming.call_type,
            CallRole::Callee,
            Utc::now(),
        );
        session.inner.advance(CallPhase::Ringing)?;

        if let Err(e) = session.inner.setup_callee().await {
            session.inner.abort(&e).await;
            return Err(e);
        }
        Ok((session, events))
    }

    /// Declines `incoming` without acquiring media.
    pub async fn reject(deps: &CallDeps, incoming: &IncomingCall) -> Result<()> {
        let user_id = deps
            .auth
            .current_user_id()
            .await?
            .ok_or(Error::NotAuthenticated)?;

        deps.store
            .update(
                &incoming.call_id,
                &CallRecordUpdate::finished(CallStatus::Rejected, Utc::now(), 0),
            )
            .await?;

        let signal = Signal::new(
            &incoming.call_id,
            &user_id,
            &incoming.caller_id,
            SignalPayload::Hangup {
                reason: EndReason::Rejected.signal_reason(),
            },
        );
        if let Err(e) = deps.signals.send(&signal).await {
            tracing::warn!("Failed to send rejection for {}: {}", incoming.call_id, e);
        }

        tracing::info!("Rejected call {}", incoming.call_id);
        Ok(())
    }

    /// Hangs up. Safe to call from any phase and more than once; later calls
    /// return the summary of the first.
    pub async fn end_call(&self) -> CallSummary {
        self.inner.end(EndReason::LocalHangup).await
    }

    /// Flips the microphone. Returns `true` when now muted.
    pub fn toggle_mute(&self) -> Result<bool> {
        let state = self.inner.state.lock();
        let track = state
            .local_stream
            .first(MediaKind::Audio)
            .ok_or(Error::NoTrack("audio"))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        Ok(!enabled)
    }

    /// Flips the outgoing video. Returns `true` when video is now off.
    pub fn toggle_video(&self) -> Result<bool> {
        let state = self.inner.state.lock();
        let track = state
            .local_stream
            .first(MediaKind::Video)
            .ok_or(Error::NoTrack("video"))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        Ok(!enabled)
    }

    /// Swaps front and back camera in place, without renegotiation.
    pub async fn switch_camera(&self) -> Result<FacingMode> {
        let inner = &self.inner;
        if inner.call_type == CallType::Screen {
            return Err(Error::Unsupported("camera switch during screen share".to_string()));
        }

        let epoch = inner.current_epoch();
        let (current, peer) = {
            let state = inner.state.lock();
            if state.summary.is_some() {
                return Err(Error::CallEnded(inner.call_id.clone()));
            }
            let current = state
                .local_stream
                .first(MediaKind::Video)
                .cloned()
                .ok_or(Error::NoTrack("video"))?;
            (current, state.peer.clone())
        };

        let next = current.facing().unwrap_or(FacingMode::User).opposite();
        current.stop();

        let request = MediaRequest::camera_only(inner.deps.media_config.camera(next));
        let acquired = inner.deps.media.acquire(&request).await?;
        let replacement = acquired
            .first(MediaKind::Video)
            .cloned()
            .ok_or(Error::NoTrack("video"))?;
        replacement.set_enabled(current.is_enabled());

        if !inner.is_current(epoch) {
            replacement.stop();
            return Err(Error::CallEnded(inner.call_id.clone()));
        }

        if let Some(peer) = peer {
            if let Err(e) = peer.replace_track(current.id(), &replacement).await {
                replacement.stop();
                return Err(e);
            }
        }

        let facing = replacement.facing().unwrap_or(next);
        {
            // finish() stops the stream under this lock, so the check and the
            // swap cannot interleave with it.
            let mut state = inner.state.lock();
            if state.summary.is_some() || !inner.is_current(epoch) {
                replacement.stop();
                return Err(Error::CallEnded(inner.call_id.clone()));
            }
            state.local_stream.replace(current.id(), replacement);
        }
        tracing::debug!("Switched camera to {:?} on {}", facing, inner.call_id);
        Ok(facing)
    }

    pub fn call_id(&self) -> &str {
        &self.inner.call_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user_id
    }

    pub fn remote_user_id(&self) -> &str {
        &self.inner.remote_user_id
    }

    pub fn call_type(&self) -> CallType {
        self.inner.call_type
    }

    pub fn role(&self) -> CallRole {
        self.inner.role
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn phase(&self) -> CallPhase {
        self.inner.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().summary.is_some()
    }

    pub fn summary(&self) -> Option<CallSummary> {
        self.inner.state.lock().summary.clone()
    }

    pub fn local_stream(&self) -> LocalStream {
        self.inner.state.lock().local_stream.clone()
    }

    pub fn remote_stream(&self) -> RemoteStream {
        self.inner.state.lock().remote_stream.clone()
    }

    pub fn has_subscription(&self) -> bool {
        self.inner
            .state
            .lock()
            .subscription
            .as_ref()
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Seconds counted since `connected`; 0 before and after.
    pub fn elapsed_seconds(&self) -> u64 {
        self.inner
            .state
            .lock()
            .timer
            .as_ref()
            .map(|t| t.elapsed())
            .unwrap_or(0)
    }
}

impl SessionInner {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    fn advance(&self, next: CallPhase) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.phase.can_advance_to(next) {
                return Err(Error::InvalidTransition {
                    from: state.phase.to_string(),
                    to: next.to_string(),
                });
            }
            state.phase = next;
        }
        self.emit(CallEvent::PhaseChanged(next));
        Ok(())
    }

    async fn acquire_media(&self) -> Result<LocalStream> {
        let camera = self.deps.media_config.camera(FacingMode::User);
        let request = MediaRequest::for_call_with(self.call_type, camera);
        self.deps.media.acquire(&request).await
    }

    /// Media, peer connection and local tracks.
    async fn prepare_peer(self: &Arc<Self>) -> Result<mpsc::UnboundedReceiver<PeerEvent>> {
        let stream = self.acquire_media().await?;

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = match self.deps.peers.create(&self.deps.ice, peer_tx).await {
            Ok(peer) => peer,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock();
            state.local_stream = stream.clone();
            state.peer = Some(Arc::clone(&peer));
        }

        for track in stream.tracks() {
            peer.add_track(track).await?;
        }
        Ok(peer_rx)
    }

    async fn setup_caller(self: &Arc<Self>) -> Result<()> {
        let peer_events = self.prepare_peer().await?;

        let subscription = self
            .deps
            .signals
            .subscribe(&self.call_id, &self.local_user_id)
            .await?;
        let (inbox, handle) = subscription.into_parts();
        self.state.lock().subscription = Some(handle);
        self.spawn_pump(inbox, peer_events, Vec::new());

        let peer = self.peer().ok_or_else(|| Error::CallEnded(self.call_id.clone()))?;
        let description = peer
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: self.call_type.wants_video(),
            })
            .await?;

        self.send(SignalPayload::Offer {
            description,
            call_type: self.call_type,
        })
        .await;
        Ok(())
    }

    async fn setup_callee(self: &Arc<Self>) -> Result<()> {
        self.deps
            .store
            .update(&self.call_id, &CallRecordUpdate::status(CallStatus::Ringing))
            .await?;

        let peer_events = self.prepare_peer().await?;

        let subscription = self
            .deps
            .signals
            .subscribe(&self.call_id, &self.local_user_id)
            .await?;
        let (inbox, handle) = subscription.into_parts();
        self.state.lock().subscription = Some(handle);

        let backlog = match self
            .deps
            .signals
            .fetch_pending(&self.call_id, &self.local_user_id)
            .await
        {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!("Could not load pending signals for {}: {}", self.call_id, e);
                Vec::new()
            }
        };

        self.spawn_pump(inbox, peer_events, backlog);
        Ok(())
    }

    async fn abort(&self, error: &Error) {
        let reason = match error {
            Error::MediaAccess { device, .. } => {
                self.emit(CallEvent::Alert(device.alert_message().to_string()));
                EndReason::MediaFailure
            }
            other => EndReason::Error(other.to_string()),
        };
        tracing::error!("Call {} aborted: {}", self.call_id, error);
        self.end(reason).await;
    }

    fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.state.lock().peer.clone()
    }

    async fn send(&self, payload: SignalPayload) {
        let signal = Signal::new(&self.call_id, &self.local_user_id, &self.remote_user_id, payload);
        if let Err(e) = self.deps.signals.send(&signal).await {
            tracing::warn!(
                "Failed to send {} for {}: {}",
                signal.signal_type().as_str(),
                self.call_id,
                e
            );
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Signal>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        backlog: Vec<Signal>,
    ) {
        // Weak so that dropping the last handle tears the call down.
        let session = Arc::downgrade(self);
        let call_id = self.call_id.clone();
        let mut epoch = self.epoch.subscribe();

        tokio::spawn(async move {
            let started_under = *epoch.borrow_and_update();

            for signal in backlog {
                let Some(inner) = session.upgrade() else { return };
                if !inner.is_current(started_under) {
                    return;
                }
                inner.handle_signal(signal).await;
            }

            loop {
                tokio::select! {
                    biased;
                    changed = epoch.changed() => {
                        if changed.is_err() || *epoch.borrow() != started_under {
                            break;
                        }
                    }
                    Some(signal) = inbox.recv() => match session.upgrade() {
                        Some(inner) => inner.handle_signal(signal).await,
                        None => break,
                    },
                    Some(event) = peer_events.recv() => match session.upgrade() {
                        Some(inner) => inner.handle_peer_event(event).await,
                        None => break,
                    },
                    else => break,
                }
            }
            tracing::debug!("Signal pump for {} stopped", call_id);
        });
    }

    async fn handle_signal(&self, signal: Signal) {
        if signal.call_id != self.call_id || signal.from_user_id == self.local_user_id {
            return;
        }
        tracing::debug!("Received {} for {}", signal.signal_type().as_str(), self.call_id);

        match signal.payload {
            SignalPayload::Offer { description, .. } => self.handle_offer(description).await,
            SignalPayload::Answer { description } => self.handle_answer(description).await,
            SignalPayload::IceCandidate { candidate } => self.handle_remote_candidate(candidate).await,
            SignalPayload::Hangup { reason } => {
                tracing::info!("Remote ended call {}: {}", self.call_id, reason);
                self.end(EndReason::RemoteHangup(reason)).await;
            }
        }
    }

    async fn handle_offer(&self, description: SessionDescription) {
        if self.role != CallRole::Callee {
            tracing::debug!("Ignoring offer on the calling side of {}", self.call_id);
            return;
        }

        let epoch = self.current_epoch();
        let peer = {
            let mut state = self.state.lock();
            if state.offer_handled {
                tracing::debug!("Ignoring repeated offer for {}", self.call_id);
                return;
            }
            state.offer_handled = true;
            match state.peer.clone() {
                Some(peer) => peer,
                None => return,
            }
        };

        if let Err(e) = peer.set_remote_description(&description).await {
            self.fail(e).await;
            return;
        }
        if !self.is_current(epoch) {
            return;
        }
        self.state.lock().remote_description_set = true;
        self.flush_candidates(&peer).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(e).await;
                return;
            }
        };
        if !self.is_current(epoch) {
            return;
        }
        self.send(SignalPayload::Answer { description: answer }).await;
    }

    async fn handle_answer(&self, description: SessionDescription) {
        if self.role != CallRole::Caller {
            tracing::debug!("Ignoring answer on the answering side of {}", self.call_id);
            return;
        }

        let epoch = self.current_epoch();
        let peer = {
            let mut state = self.state.lock();
            if state.remote_description_set {
                tracing::debug!("Ignoring repeated answer for {}", self.call_id);
                return;
            }
            state.remote_description_set = true;
            match state.peer.clone() {
                Some(peer) => peer,
                None => return,
            }
        };

        if let Err(e) = peer.set_remote_description(&description).await {
            self.fail(e).await;
            return;
        }
        if !self.is_current(epoch) {
            return;
        }
        self.flush_candidates(&peer).await;
    }

    async fn handle_remote_candidate(&self, candidate: IceCandidate) {
        let peer = {
            let mut state = self.state.lock();
            if !state.remote_description_set {
                state.pending_candidates.push(candidate);
                return;
            }
            match state.peer.clone() {
                Some(peer) => peer,
                None => return,
            }
        };

        if let Err(e) = peer.add_ice_candidate(&candidate).await {
            tracing::warn!("Failed to add ICE candidate for {}: {}", self.call_id, e);
        }
    }

    async fn flush_candidates(&self, peer: &Arc<dyn PeerConnection>) {
        let pending = std::mem::take(&mut self.state.lock().pending_candidates);
        if !pending.is_empty() {
            tracing::debug!("Applying {} buffered candidate(s) for {}", pending.len(), self.call_id);
        }
        for candidate in pending {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                tracing::warn!("Failed to add ICE candidate for {}: {}", self.call_id, e);
            }
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send(SignalPayload::IceCandidate { candidate }).await;
            }
            PeerEvent::RemoteTrack(track) => {
                let stream = {
                    let mut state = self.state.lock();
                    if !state.remote_stream.add(track) {
                        return;
                    }
                    state.remote_stream.clone()
                };
                self.emit(CallEvent::RemoteStream(stream));
            }
            PeerEvent::StateChanged(peer_state) => {
                tracing::info!("Call {} connection {}", self.call_id, peer_state);
                self.emit(CallEvent::ConnectionState(peer_state));

                if peer_state == PeerState::Connected {
                    self.on_connected().await;
                } else if peer_state.is_terminal() {
                    self.end(EndReason::Connection(peer_state)).await;
                }
            }
        }
    }

    async fn on_connected(&self) {
        let answered_at = Utc::now();
        {
            let mut state = self.state.lock();
            if state.connected || state.summary.is_some() {
                return;
            }
            state.connected = true;
            state.answered_at = Some(answered_at);
            state.timer = Some(CallTimer::start(self.events.clone(), self.epoch.subscribe()));
        }

        if let Err(e) = self.advance(CallPhase::Answered) {
            tracing::debug!("Call {} connected without phase change: {}", self.call_id, e);
        }

        if let Err(e) = self
            .deps
            .store
            .update(&self.call_id, &CallRecordUpdate::answered(answered_at))
            .await
        {
            tracing::warn!("Failed to record answer of {}: {}", self.call_id, e);
        }
    }

    async fn fail(&self, error: Error) {
        tracing::error!("Negotiation failed for {}: {}", self.call_id, error);
        self.end(EndReason::Error(error.to_string())).await;
    }

    /// Marks the call ended and stops every track. Returns the teardown still
    /// owed, or `None` when the call had already ended.
    fn finish(&self, reason: EndReason) -> (CallSummary, Option<Teardown>) {
        let ended_at = Utc::now();
        let mut state = self.state.lock();
        if let Some(ref summary) = state.summary {
            return (summary.clone(), None);
        }

        let summary = CallSummary {
            call_id: self.call_id.clone(),
            status: reason.status(),
            duration_seconds: call_duration_seconds(state.answered_at, ended_at),
            reason,
        };
        state.summary = Some(summary.clone());
        state.phase = CallPhase::Ended;
        state.connected = false;
        state.pending_candidates.clear();
        state.local_stream.stop_all();
        state.remote_stream.stop_all();

        let teardown = Teardown {
            deps: self.deps.clone(),
            call_id: self.call_id.clone(),
            local_user_id: self.local_user_id.clone(),
            remote_user_id: self.remote_user_id.clone(),
            summary: summary.clone(),
            ended_at,
            peer: state.peer.take(),
            subscription: state.subscription.take(),
            timer: state.timer.take(),
        };
        (summary, Some(teardown))
    }

    async fn end(&self, reason: EndReason) -> CallSummary {
        let (summary, teardown) = self.finish(reason);
        let teardown = match teardown {
            Some(teardown) => teardown,
            None => return summary,
        };

        self.epoch.send_modify(|epoch| *epoch += 1);
        teardown.run().await;

        self.emit(CallEvent::PhaseChanged(CallPhase::Ended));
        self.emit(CallEvent::Ended(summary.clone()));
        summary
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let (_, teardown) = self.finish(EndReason::LocalHangup);
        let teardown = match teardown {
            Some(teardown) => teardown,
            None => return,
        };

        tracing::info!("Call {} dropped without hangup", self.call_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(teardown.run());
            }
            Err(_) => {
                // Tracks are already stopped; timer and subscription go with `teardown`.
                tracing::warn!("No runtime to close call {}; peer and record left as is", self.call_id);
            }
        }
    }
}

/// The part of ending a call that has to await.
struct Teardown {
    deps: CallDeps,
    call_id: String,
    local_user_id: String,
    remote_user_id: String,
    summary: CallSummary,
    ended_at: DateTime<Utc>,
    peer: Option<Arc<dyn PeerConnection>>,
    subscription: Option<SubscriptionHandle>,
    timer: Option<CallTimer>,
}

impl Teardown {
    async fn run(mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }

        let summary = &self.summary;
        if summary.reason.notifies_remote() {
            let signal = Signal::new(
                &self.call_id,
                &self.local_user_id,
                &self.remote_user_id,
                SignalPayload::Hangup {
                    reason: summary.reason.signal_reason(),
                },
            );
            if let Err(e) = self.deps.signals.send(&signal).await {
                tracing::warn!("Failed to send call_end for {}: {}", self.call_id, e);
            }
        }

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer connection for {}: {}", self.call_id, e);
            }
        }

        let update = CallRecordUpdate::finished(summary.status, self.ended_at, summary.duration_seconds);
        if let Err(e) = self.deps.store.update(&self.call_id, &update).await {
            tracing::warn!("Failed to record end of {}: {}", self.call_id, e);
        }

        tracing::info!(
            "Call {} ended ({}, {}s)",
            self.call_id,
            summary.reason.signal_reason(),
            summary.duration_seconds
        );
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::media::{DeviceClass, DeviceInventory, Permission};
    use crate::models::{SdpType, SignalType};
    use std::time::Duration;

    fn offer_from(caller: &str, callee: &str, call_id: &str) -> Signal {
        Signal::new(
            call_id,
            caller,
            callee,
            SignalPayload::Offer {
                description: SessionDescription::offer("v=0 remote-offer"),
                call_type: CallType::Video,
            },
        )
    }

    fn candidate_from(from: &str, to: &str, call_id: &str, text: &str) -> Signal {
        Signal::new(
            call_id,
            from,
            to,
            SignalPayload::IceCandidate {
                candidate: IceCandidate {
                    candidate: text.to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            },
        )
    }

    async fn incoming_for(h: &Harness, call_type: CallType) -> IncomingCall {
        let record = CallRecord::initiated("call_U1_U2_1", "U1", "U2", call_type, Utc::now());
        h.store.create(&record).await.unwrap();
        IncomingCall::from_record(&record)
    }

    fn count(history: &[Signal], signal_type: SignalType) -> usize {
        history.iter().filter(|s| s.signal_type() == signal_type).count()
    }

    #[test]
    fn test_phase_transitions() {
        assert!(CallPhase::Idle.can_advance_to(CallPhase::Calling));
        assert!(CallPhase::Ringing.can_advance_to(CallPhase::Answered));
        assert!(CallPhase::Calling.can_advance_to(CallPhase::Ended));
        assert!(!CallPhase::Ended.can_advance_to(CallPhase::Answered));
        assert!(!CallPhase::Ended.can_advance_to(CallPhase::Ended));
        assert!(!CallPhase::Idle.can_advance_to(CallPhase::Answered));
        assert_eq!(CallPhase::Ringing.status(), Some(CallStatus::Ringing));
    }

    #[test]
    fn test_end_reason_status() {
        assert_eq!(EndReason::LocalHangup.status(), CallStatus::Ended);
        assert_eq!(EndReason::RemoteHangup("rejected".into()).status(), CallStatus::Rejected);
        assert_eq!(EndReason::MediaFailure.status(), CallStatus::Failed);
        assert_eq!(
            EndReason::Connection(PeerState::Disconnected).signal_reason(),
            "disconnected"
        );
    }

    #[tokio::test]
    async fn test_blank_receiver_fails_fast() {
        let h = Harness::new(DeviceInventory::default());
        let result = CallSession::start(h.deps(Some("U1")), "   ", CallType::Audio).await;

        assert!(matches!(result, Err(Error::InvalidReceiver)));
        assert_eq!(h.devices.count(), 0);
        assert!(h.store.history("U1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signed_out_creates_nothing() {
        let h = Harness::new(DeviceInventory::default());
        let result = CallSession::start(h.deps(None), "U2", CallType::Audio).await;

        assert!(matches!(result, Err(Error::NotAuthenticated)));
        assert_eq!(h.devices.count(), 0);
    }

    #[tokio::test]
    async fn test_caller_sends_offer() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();

        assert!(session.call_id().starts_with("call_U1_U2_"));
        assert_eq!(session.phase(), CallPhase::Calling);
        assert!(session.has_subscription());

        let record = h.store.get(session.call_id()).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Initiated);

        let peer = h.peers.last();
        assert_eq!(peer.entries("track:"), vec!["track:audio"]);
        assert_eq!(
            peer.offers.lock()[0],
            OfferOptions {
                receive_audio: true,
                receive_video: false
            }
        );

        let history = h.hub.history(session.call_id());
        assert_eq!(history.len(), 1);
        match &history[0].payload {
            SignalPayload::Offer {
                description,
                call_type,
            } => {
                assert_eq!(description.sdp_type, SdpType::Offer);
                assert_eq!(*call_type, CallType::Audio);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_media_denied_marks_failed() {
        let inventory = DeviceInventory {
            camera_permission: Permission::Denied,
            ..Default::default()
        };
        let h = Harness::new(inventory);
        let result = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video).await;

        match result {
            Err(Error::MediaAccess { device, .. }) => assert_eq!(device, DeviceClass::Camera),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("call should not start"),
        }

        let history = h.store.history("U1", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CallStatus::Failed);
        assert!(h.peers.peers.lock().is_empty());
    }

    #[tokio::test]
    async fn test_callee_answers_once() {
        let h = Harness::new(DeviceInventory::default());
        let incoming = incoming_for(&h, CallType::Video).await;

        // Offer inserted before the callee subscribed
        h.hub.send(&offer_from("U1", "U2", &incoming.call_id)).await.unwrap();

        let (session, _events) = CallSession::answer(h.deps(Some("U2")), &incoming).await.unwrap();
        assert_eq!(session.phase(), CallPhase::Ringing);
        assert_eq!(
            h.store.get(&incoming.call_id).await.unwrap().unwrap().status,
            CallStatus::Ringing
        );

        let hub = h.hub.clone();
        let call_id = incoming.call_id.clone();
        wait_until(|| count(&hub.history(&call_id), SignalType::Answer) == 1).await;

        h.hub.send(&offer_from("U1", "U2", &incoming.call_id)).await.unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let history = h.hub.history(&incoming.call_id);
        assert_eq!(count(&history, SignalType::Answer), 1);
        let answer = history
            .iter()
            .find(|s| s.signal_type() == SignalType::Answer)
            .unwrap();
        match &answer.payload {
            SignalPayload::Answer { description } => assert_eq!(description.sdp_type, SdpType::Answer),
            other => panic!("unexpected payload: {:?}", other),
        }
        assert_eq!(answer.from_user_id, "U2");
        assert_eq!(answer.to_user_id, "U1");
        assert_eq!(h.peers.last().entries("answer").len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let h = Harness::new(DeviceInventory::default());
        let incoming = incoming_for(&h, CallType::Audio).await;
        let (_session, _events) = CallSession::answer(h.deps(Some("U2")), &incoming).await.unwrap();

        h.hub
            .send(&candidate_from("U1", "U2", &incoming.call_id, "early"))
            .await
            .unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let peer = h.peers.last();
        assert!(peer.entries("candidate:").is_empty());

        h.hub.send(&offer_from("U1", "U2", &incoming.call_id)).await.unwrap();
        wait_until(|| !peer.entries("candidate:").is_empty()).await;

        h.hub
            .send(&candidate_from("U1", "U2", &incoming.call_id, "late"))
            .await
            .unwrap();
        wait_until(|| peer.entries("candidate:").len() == 2).await;

        let log = peer.log.lock().clone();
        let remote = log.iter().position(|e| e.starts_with("remote:")).unwrap();
        let early = log.iter().position(|e| e == "candidate:early").unwrap();
        assert!(remote < early);
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();

        h.peers.last().emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));

        let hub = h.hub.clone();
        let call_id = session.call_id().to_string();
        wait_until(|| count(&hub.history(&call_id), SignalType::IceCandidate) == 1).await;
    }

    #[tokio::test]
    async fn test_toggle_mute_twice_restores() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        let mic = session.local_stream().first(MediaKind::Audio).cloned().unwrap();

        assert!(session.toggle_mute().unwrap());
        assert!(!mic.is_enabled());
        assert!(!session.toggle_mute().unwrap());
        assert!(mic.is_enabled());

        assert!(session.toggle_video().unwrap());
        assert!(!session.toggle_video().unwrap());
    }

    #[tokio::test]
    async fn test_toggle_video_without_camera() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();
        assert!(matches!(session.toggle_video(), Err(Error::NoTrack("video"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_answers_and_times() {
        let h = Harness::new(DeviceInventory::default());
        let (session, mut events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();

        h.peers.last().emit(PeerEvent::StateChanged(PeerState::Connected));

        let mut seconds = Vec::new();
        while seconds.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(CallEvent::Duration(n))) => seconds.push(n),
                Ok(Some(_)) => {}
                other => panic!("timer did not tick: {:?}", other.is_ok()),
            }
        }
        assert_eq!(seconds, vec![1, 2]);
        assert!(session.is_connected());
        assert_eq!(session.phase(), CallPhase::Answered);

        let record = h.store.get(session.call_id()).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Answered);
        assert!(record.answered_at.is_some());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let summary = session.end_call().await;
        assert!(summary.duration_seconds >= 0);
        assert_eq!(session.elapsed_seconds(), 0);
    }

    #[tokio::test]
    async fn test_end_call_releases_everything() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        let local = session.local_stream();
        h.peers
            .last()
            .emit(PeerEvent::RemoteTrack(crate::media::MediaTrack::remote("r1", MediaKind::Audio)));
        let watched = session.clone();
        wait_until(|| !watched.remote_stream().is_empty()).await;
        let remote = session.remote_stream();

        let summary = session.end_call().await;
        assert_eq!(summary.reason, EndReason::LocalHangup);
        assert_eq!(summary.duration_seconds, 0);

        assert!(local.tracks().iter().all(|t| t.is_stopped()));
        assert!(remote.tracks().iter().all(|t| t.is_stopped()));
        assert_eq!(h.peers.last().entries("close").len(), 1);
        assert_eq!(h.hub.subscriber_count(session.call_id()), 0);
        assert!(!session.is_connected());
        assert_eq!(session.phase(), CallPhase::Ended);

        let record = h.store.get(session.call_id()).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());

        // Second end is a no-op
        let again = session.end_call().await;
        assert_eq!(again, summary);
        assert_eq!(count(&h.hub.history(session.call_id()), SignalType::CallEnd), 1);
        assert_eq!(h.peers.last().entries("close").len(), 1);
    }

    /// Ends `session` and checks that nothing it held is still live.
    async fn end_and_check_released(h: &Harness, session: CallSession) {
        let peer = h.peers.last();
        peer.emit(PeerEvent::RemoteTrack(crate::media::MediaTrack::remote("r1", MediaKind::Audio)));
        let watched = session.clone();
        wait_until(|| !watched.remote_stream().is_empty()).await;
        assert!(session.has_subscription());

        let local = session.local_stream();
        let remote = session.remote_stream();
        let from = session.phase();
        session.end_call().await;

        assert!(!local.tracks().is_empty(), "no local tracks in {}", from);
        assert!(local.tracks().iter().all(|t| t.is_stopped()), "local live after {}", from);
        assert!(remote.tracks().iter().all(|t| t.is_stopped()), "remote live after {}", from);
        assert!(h.devices.live_tracks().is_empty(), "capture live after {}", from);
        assert_eq!(peer.entries("close").len(), 1, "peer not closed after {}", from);
        assert_eq!(h.hub.subscriber_count(session.call_id()), 0);
        assert!(!session.has_subscription());
        assert!(!session.is_connected());
        assert_eq!(session.elapsed_seconds(), 0);
        assert_eq!(session.phase(), CallPhase::Ended);
    }

    #[tokio::test]
    async fn test_end_call_releases_from_every_phase() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        assert_eq!(session.phase(), CallPhase::Calling);
        end_and_check_released(&h, session).await;

        let h = Harness::new(DeviceInventory::default());
        let incoming = incoming_for(&h, CallType::Video).await;
        let (session, _events) = CallSession::answer(h.deps(Some("U2")), &incoming).await.unwrap();
        assert_eq!(session.phase(), CallPhase::Ringing);
        end_and_check_released(&h, session).await;

        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        h.peers.last().emit(PeerEvent::StateChanged(PeerState::Connected));
        let watched = session.clone();
        wait_until(|| watched.phase() == CallPhase::Answered).await;
        end_and_check_released(&h, session).await;
    }

    #[tokio::test]
    async fn test_dropped_session_tears_down() {
        let h = Harness::new(DeviceInventory::default());
        let (session, events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        let call_id = session.call_id().to_string();
        let local = session.local_stream();
        let peer = h.peers.last();
        assert_eq!(h.hub.subscriber_count(&call_id), 1);

        drop(session);
        drop(events);

        assert!(local.tracks().iter().all(|t| t.is_stopped()));
        let hub = h.hub.clone();
        wait_until(|| hub.subscriber_count(&call_id) == 0 && peer.entries("close").len() == 1).await;
        wait_until(|| count(&hub.history(&call_id), SignalType::CallEnd) == 1).await;

        let record = h.store.get(&call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_camera_switch_stops_new_camera() {
        let mut h = Harness::new(DeviceInventory::default());
        h.peers = Arc::new(FakePeerFactory {
            replace_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();

        let switching = tokio::spawn({
            let session = session.clone();
            async move { session.switch_camera().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.end_call().await;

        let result = switching.await.unwrap();
        assert!(matches!(result, Err(Error::CallEnded(_))));
        assert_eq!(h.devices.count(), 2);
        assert!(h.devices.live_tracks().is_empty());
        assert!(session.local_stream().tracks().iter().all(|t| t.is_stopped()));
    }

    #[tokio::test]
    async fn test_failed_camera_swap_stops_new_camera() {
        let mut h = Harness::new(DeviceInventory::default());
        h.peers = Arc::new(FakePeerFactory {
            fail_replace_track: true,
            ..Default::default()
        });
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        let before = session.local_stream().first(MediaKind::Video).cloned().unwrap();

        assert!(matches!(session.switch_camera().await, Err(Error::WebRtc(_))));
        assert_eq!(h.devices.count(), 2);
        let live = h.devices.live_tracks();
        assert!(live.iter().all(|t| t.kind() == MediaKind::Audio));
        assert_eq!(session.local_stream().first(MediaKind::Video).unwrap().id(), before.id());
    }

    #[tokio::test]
    async fn test_remote_hangup_ends_without_echo() {
        let h = Harness::new(DeviceInventory::default());
        let (session, mut events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();

        let hangup = Signal::new(
            session.call_id(),
            "U2",
            "U1",
            SignalPayload::Hangup {
                reason: "hangup".to_string(),
            },
        );
        h.hub.send(&hangup).await.unwrap();

        let watched = session.clone();
        wait_until(|| watched.is_ended()).await;
        assert_eq!(count(&h.hub.history(session.call_id()), SignalType::CallEnd), 1);

        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Ended(summary) = event {
                ended = Some(summary);
            }
        }
        assert_eq!(ended.unwrap().reason, EndReason::RemoteHangup("hangup".to_string()));
    }

    #[tokio::test]
    async fn test_terminal_peer_state_ends_call() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Audio)
            .await
            .unwrap();

        h.peers.last().emit(PeerEvent::StateChanged(PeerState::Failed));
        let watched = session.clone();
        wait_until(|| watched.is_ended()).await;

        assert_eq!(
            session.summary().unwrap().reason,
            EndReason::Connection(PeerState::Failed)
        );
        let history = h.hub.history(session.call_id());
        match &history.last().unwrap().payload {
            SignalPayload::Hangup { reason } => assert_eq!(reason, "failed"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_switch_camera_replaces_in_place() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Video)
            .await
            .unwrap();
        let before = session.local_stream().first(MediaKind::Video).cloned().unwrap();
        assert_eq!(before.facing(), Some(FacingMode::User));

        assert_eq!(session.switch_camera().await.unwrap(), FacingMode::Environment);
        assert!(before.is_stopped());

        let after = session.local_stream().first(MediaKind::Video).cloned().unwrap();
        assert_eq!(after.facing(), Some(FacingMode::Environment));
        assert_eq!(
            h.peers.last().entries("replace:"),
            vec![format!("replace:{}->{}", before.id(), after.id())]
        );
        assert_eq!(session.local_stream().tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_switch_camera_rejected_for_screen() {
        let h = Harness::new(DeviceInventory::default());
        let (session, _events) = CallSession::start(h.deps(Some("U1")), "U2", CallType::Screen)
            .await
            .unwrap();
        assert!(matches!(session.switch_camera().await, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_reject_call() {
        let h = Harness::new(DeviceInventory::default());
        let incoming = incoming_for(&h, CallType::Audio).await;

        CallSession::reject(&h.deps(Some("U2")), &incoming).await.unwrap();

        let record = h.store.get(&incoming.call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Rejected);
        assert_eq!(h.devices.count(), 0);

        let history = h.hub.history(&incoming.call_id);
        match &history[0].payload {
            SignalPayload::Hangup { reason } => assert_eq!(reason, "rejected"),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_offer_fails_call() {
        let mut h = Harness::new(DeviceInventory::default());
        h.peers = Arc::new(FakePeerFactory {
            fail_remote_description: true,
            ..Default::default()
        });
        let incoming = incoming_for(&h, CallType::Audio).await;
        let (session, _events) = CallSession::answer(h.deps(Some("U2")), &incoming).await.unwrap();

        h.hub.send(&offer_from("U1", "U2", &incoming.call_id)).await.unwrap();
        let watched = session.clone();
        wait_until(|| watched.is_ended()).await;

        let record = h.store.get(&incoming.call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Failed);
    }
}
