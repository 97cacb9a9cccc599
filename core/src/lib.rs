//! Wavecall Core Library
//!
//! Call-signaling core for one-to-one voice, video and screen-share calls.
//! Provides: signal transport, media acquisition, peer connections, the call
//! state machine, and TURN/ICE configuration.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod ice;
pub mod media;
pub mod models;
pub mod peer;
pub mod realtime;
pub mod session;
pub mod signaling;
pub mod store;
pub mod timer;

use std::sync::Arc;

pub use api::ApiClient;
pub use auth::{AuthProvider, RestAuth, StaticAuth};
pub use config::ClientConfig;
pub use error::*;
pub use ice::{probe_turn, IceConfig, IceServer, TurnProbe};
pub use media::{DeviceInventory, FacingMode, LocalStream, MediaDevices, MediaKind, MediaRequest, MediaTrack, RemoteStream};
pub use models::*;
pub use peer::{PeerConnection, PeerFactory, PeerState, RtcPeerFactory};
pub use realtime::RealtimeClient;
pub use session::*;
pub use signaling::{MemorySignalHub, RealtimeSignalTransport, SignalTransport, SubscriptionHandle};
pub use store::{CallStore, IncomingCalls, RestCallStore, SqliteCallStore};
pub use timer::format_duration;

/// Main client instance
pub struct CallClient {
    deps: CallDeps,
    api: Option<Arc<ApiClient>>,
    realtime: Option<Arc<RealtimeClient>>,
}

impl CallClient {
    /// Client over caller-supplied collaborators.
    pub fn new(deps: CallDeps) -> Self {
        Self {
            deps,
            api: None,
            realtime: None,
        }
    }

    /// Client wired to the hosted backend and native WebRTC.
    pub async fn connect(
        config: &ClientConfig,
        access_token: Option<String>,
        media: Arc<dyn MediaDevices>,
    ) -> Result<Self> {
        config.validate()?;

        let api = Arc::new(ApiClient::new(config)?);
        api.set_access_token(access_token.clone());
        let realtime = RealtimeClient::connect(config, access_token).await?;

        let deps = CallDeps {
            auth: Arc::new(RestAuth::new(Arc::clone(&api))),
            store: Arc::new(RestCallStore::new(
                Arc::clone(&api),
                Arc::clone(&realtime),
                &config.schema,
            )),
            signals: Arc::new(RealtimeSignalTransport::new(
                Arc::clone(&api),
                Arc::clone(&realtime),
                &config.schema,
            )),
            media,
            peers: Arc::new(RtcPeerFactory),
            ice: config.ice.clone(),
            media_config: config.media.clone(),
        };

        Ok(Self {
            deps,
            api: Some(api),
            realtime: Some(realtime),
        })
    }

    pub fn deps(&self) -> &CallDeps {
        &self.deps
    }

    /// Replaces the bearer token after a session refresh.
    pub fn set_access_token(&self, token: Option<String>) {
        if let Some(ref api) = self.api {
            api.set_access_token(token.clone());
        }
        if let Some(ref realtime) = self.realtime {
            realtime.set_access_token(token);
        }
    }

    pub async fn start_call(&self, receiver_id: &str, call_type: CallType) -> Result<(CallSession, CallEvents)> {
        CallSession::start(self.deps.clone(), receiver_id, call_type).await
    }

    pub async fn answer_call(&self, incoming: &IncomingCall) -> Result<(CallSession, CallEvents)> {
        CallSession::answer(self.deps.clone(), incoming).await
    }

    pub async fn reject_call(&self, incoming: &IncomingCall) -> Result<()> {
        CallSession::reject(&self.deps, incoming).await
    }

    /// Calls placed to the signed-in user from now on.
    pub async fn watch_incoming(&self) -> Result<IncomingCalls> {
        let user_id = self
            .deps
            .auth
            .current_user_id()
            .await?
            .ok_or(Error::NotAuthenticated)?;
        self.deps.store.watch_incoming(&user_id).await
    }

    /// Reconnects the realtime socket after the host was suspended.
    pub async fn resume(&self) -> Result<()> {
        match self.realtime {
            Some(ref realtime) => realtime.resume().await,
            None => Ok(()),
        }
    }
}
