//! Local media acquisition and track handles

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::CallType;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing: FacingMode,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            facing: FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSource {
    Camera(CameraConstraints),
    Display,
}

/// Device set requested from the platform for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoSource>,
}

impl MediaRequest {
    pub fn for_call(call_type: CallType) -> Self {
        Self::for_call_with(call_type, CameraConstraints::default())
    }

    pub fn for_call_with(call_type: CallType, camera: CameraConstraints) -> Self {
        let audio = Some(AudioConstraints::default());
        match call_type {
            CallType::Audio => Self { audio, video: None },
            CallType::Video => Self {
                audio,
                video: Some(VideoSource::Camera(camera)),
            },
            CallType::Screen => Self {
                audio,
                video: Some(VideoSource::Display),
            },
        }
    }

    pub fn camera_only(camera: CameraConstraints) -> Self {
        Self {
            audio: None,
            video: Some(VideoSource::Camera(camera)),
        }
    }
}

// ============================================================================
// Tracks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera(FacingMode),
    Display,
    Remote,
}

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to a media track. Clones share the enabled/stopped flags.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    label: String,
    source: TrackSource,
    state: Arc<TrackState>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>, source: TrackSource) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            source,
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn remote(id: impl Into<String>, kind: MediaKind) -> Self {
        Self::new(id, kind, "remote", TrackSource::Remote)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn facing(&self) -> Option<FacingMode> {
        match self.source {
            TrackSource::Camera(facing) => Some(facing),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
    }
}

/// Tracks acquired for one call.
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn first(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.first(kind).is_some()
    }

    pub fn extend(&mut self, other: LocalStream) {
        self.tracks.extend(other.tracks);
    }

    /// Swaps the track with `old_id` for `new`, returning the old one.
    pub fn replace(&mut self, old_id: &str, new: MediaTrack) -> Option<MediaTrack> {
        let slot = self.tracks.iter_mut().find(|t| t.id() == old_id)?;
        Some(std::mem::replace(slot, new))
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Remote tracks accumulated as the peer connection reports them.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<MediaTrack>,
}

impl RemoteStream {
    pub fn add(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Microphone,
    Camera,
    Screen,
}

impl DeviceClass {
    pub fn label(self) -> &'static str {
        match self {
            DeviceClass::Microphone => "Microphone",
            DeviceClass::Camera => "Camera",
            DeviceClass::Screen => "Screen capture",
        }
    }

    /// User-facing text shown when access is denied.
    pub fn alert_message(self) -> &'static str {
        match self {
            DeviceClass::Microphone | DeviceClass::Camera => {
                "Could not access camera/microphone. Please allow access and try again."
            }
            DeviceClass::Screen => "Could not start screen sharing. Please allow screen capture and try again.",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Platform capture boundary (`getUserMedia` / `getDisplayMedia`).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// Declared set of capture devices and the permissions granted for them.
///
/// Hands out track handles; the host feeds captured samples into the RTP
/// tracks the peer connection creates for them.
#[derive(Debug, Clone)]
pub struct DeviceInventory {
    pub microphone: Option<Permission>,
    pub cameras: Vec<FacingMode>,
    pub camera_permission: Permission,
    pub screen: Option<Permission>,
}

impl Default for DeviceInventory {
    fn default() -> Self {
        Self {
            microphone: Some(Permission::Granted),
            cameras: vec![FacingMode::User, FacingMode::Environment],
            camera_permission: Permission::Granted,
            screen: Some(Permission::Granted),
        }
    }
}

impl DeviceInventory {
    pub fn audio_only() -> Self {
        Self {
            cameras: Vec::new(),
            screen: None,
            ..Default::default()
        }
    }

    fn check(&self, device: DeviceClass, state: Option<Permission>) -> Result<()> {
        match state {
            Some(Permission::Granted) => Ok(()),
            Some(Permission::Denied) => Err(Error::MediaAccess {
                device,
                reason: "permission denied".to_string(),
            }),
            None => Err(Error::MediaAccess {
                device,
                reason: "no device available".to_string(),
            }),
        }
    }

    fn camera(&self, constraints: &CameraConstraints) -> Result<MediaTrack> {
        self.check(DeviceClass::Camera, Some(self.camera_permission))?;
        let facing = self
            .cameras
            .iter()
            .copied()
            .find(|f| *f == constraints.facing)
            .or_else(|| self.cameras.first().copied())
            .ok_or_else(|| Error::MediaAccess {
                device: DeviceClass::Camera,
                reason: "no device available".to_string(),
            })?;

        let label = match facing {
            FacingMode::User => "front camera",
            FacingMode::Environment => "back camera",
        };
        Ok(MediaTrack::new(
            new_track_id(),
            MediaKind::Video,
            format!("{} {}x{}", label, constraints.ideal_width, constraints.ideal_height),
            TrackSource::Camera(facing),
        ))
    }
}

#[async_trait]
impl MediaDevices for DeviceInventory {
    async fn acquire(&self, request: &MediaRequest) -> Result<LocalStream> {
        let mut tracks = Vec::new();

        match request.video {
            Some(VideoSource::Camera(ref constraints)) => tracks.push(self.camera(constraints)?),
            Some(VideoSource::Display) => {
                self.check(DeviceClass::Screen, self.screen)?;
                tracks.push(MediaTrack::new(
                    new_track_id(),
                    MediaKind::Video,
                    "screen",
                    TrackSource::Display,
                ));
            }
            None => {}
        }

        if request.audio.is_some() {
            self.check(DeviceClass::Microphone, self.microphone)?;
            tracks.push(MediaTrack::new(
                new_track_id(),
                MediaKind::Audio,
                "microphone",
                TrackSource::Microphone,
            ));
        }

        tracing::debug!("Acquired {} local track(s)", tracks.len());
        Ok(LocalStream::new(tracks))
    }
}

fn new_track_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
