//! STUN/TURN configuration and the relay self-test

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::error::Result;

pub const GOOGLE_STUN: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];
pub const TWILIO_STUN: &str = "stun:global.stun.twilio.com:3478";

pub const OPENRELAY_USERNAME: &str = "openrelayproject";
pub const OPENRELAY_CREDENTIAL: &str = "openrelayproject";

// Placeholders, not a real Metered.ca account: the default relay entry below
// cannot authenticate until the config file supplies real credentials.
pub const METERED_USERNAME: &str = "wavecall";
pub const METERED_CREDENTIAL: &str = "wavecall-shared-relay";

pub const DEFAULT_CANDIDATE_POOL_SIZE: u8 = 10;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: &[&str], username: &str, credential: &str) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Ordered ICE server list handed to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        let mut servers: Vec<IceServer> = GOOGLE_STUN.iter().map(|u| IceServer::stun(u)).collect();
        servers.push(IceServer::stun(TWILIO_STUN));

        servers.push(IceServer::turn(
            &[
                "turn:openrelay.metered.ca:80",
                "turn:openrelay.metered.ca:443",
                "turn:openrelay.metered.ca:443?transport=tcp",
            ],
            OPENRELAY_USERNAME,
            OPENRELAY_CREDENTIAL,
        ));
        servers.push(IceServer::turn(
            &[
                "turn:a.relay.metered.ca:80",
                "turn:a.relay.metered.ca:80?transport=tcp",
                "turn:a.relay.metered.ca:443",
                "turns:a.relay.metered.ca:443?transport=tcp",
            ],
            METERED_USERNAME,
            METERED_CREDENTIAL,
        ));

        Self {
            servers,
            ice_candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
        }
    }
}

impl IceConfig {
    /// Fallback used when the TURN relays are unreachable.
    pub fn stun_only() -> Self {
        let mut servers: Vec<IceServer> = GOOGLE_STUN.iter().map(|u| IceServer::stun(u)).collect();
        servers.push(IceServer::stun(TWILIO_STUN));
        Self {
            servers,
            ice_candidate_pool_size: DEFAULT_CANDIDATE_POOL_SIZE,
        }
    }

    pub fn turn_servers(&self) -> impl Iterator<Item = &IceServer> {
        self.servers.iter().filter(|s| s.is_turn())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.rtc_ice_servers(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            ..Default::default()
        }
    }
}

/// Outcome of [`probe_turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnProbe {
    pub reachable: bool,
    pub relay_address: Option<String>,
    pub elapsed: Duration,
}

/// Opens a throwaway peer connection and waits for a relay candidate.
///
/// A relay candidate can only be gathered through a working TURN allocation, so
/// seeing one within `timeout` means at least one configured relay answers.
pub async fn probe_turn(config: &IceConfig, timeout: Duration) -> Result<TurnProbe> {
    let started = std::time::Instant::now();

    let api = APIBuilder::new().build();
    let pc = api.new_peer_connection(config.rtc_configuration()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                tracing::debug!("Probe candidate: {:?} {}:{}", c.typ, c.address, c.port);
                if c.typ == RTCIceCandidateType::Relay {
                    let _ = tx.send(format!("{}:{}", c.address, c.port));
                }
            }
        })
    }));

    // A data channel gives the offer an m-line so gathering starts.
    let _channel = pc.create_data_channel("turn-probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let relay = match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(found) => found,
        Err(_) => {
            tracing::warn!("No relay candidate within {:?}", timeout);
            None
        }
    };

    if let Err(e) = pc.close().await {
        tracing::warn!("Failed to close probe connection: {}", e);
    }

    Ok(TurnProbe {
        reachable: relay.is_some(),
        relay_address: relay,
        elapsed: started.elapsed(),
    })
}
