//! Configuration management for Wavecall

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::ice::IceConfig;
use crate::media::{CameraConstraints, FacingMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://abc.supabase.co`.
    pub url: String,
    /// Public (anon) API key sent as `apikey`.
    pub anon_key: String,
}

/// Table names of the call record and signal tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub calls_table: String,
    pub signals_table: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            calls_table: "call_history".to_string(),
            signals_table: "call_signaling".to_string(),
        }
    }
}

impl SchemaConfig {
    /// The `calls` / `webrtc_signals` table pair.
    pub fn legacy() -> Self {
        Self {
            calls_table: "calls".to_string(),
            signals_table: "webrtc_signals".to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for name in [&self.calls_table, &self.signals_table] {
            if !is_identifier(name) {
                return Err(Error::Config(format!("Invalid table name: {:?}", name)));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub heartbeat_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub video_width: u32,
    pub video_height: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_width: 1280,
            video_height: 720,
        }
    }
}

impl MediaConfig {
    pub fn camera(&self, facing: FacingMode) -> CameraConstraints {
        CameraConstraints {
            ideal_width: self.video_width,
            ideal_height: self.video_height,
            facing,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                url: String::new(),
                anon_key: String::new(),
            },
            schema: SchemaConfig::default(),
            realtime: RealtimeConfig::default(),
            ice: IceConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: &str, anon_key: &str) -> Self {
        Self {
            backend: BackendConfig {
                url: url.trim_end_matches('/').to_string(),
                anon_key: anon_key.to_string(),
            },
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.url.is_empty() {
            return Err(Error::Config("backend.url is empty".to_string()));
        }
        url::Url::parse(&self.backend.url)?;
        if self.backend.anon_key.is_empty() {
            return Err(Error::Config("backend.anon_key is empty".to_string()));
        }
        if self.realtime.heartbeat_interval_secs == 0 {
            return Err(Error::Config("realtime.heartbeat_interval_secs must be > 0".to_string()));
        }
        self.schema.validate()
    }

    pub fn http_url(&self) -> String {
        self.backend.url.trim_end_matches('/').to_string()
    }

    pub fn ws_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.http_url())?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| Error::Config(format!("Cannot derive websocket URL from {}", self.backend.url)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.backend.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        let config = ClientConfig::new("https://demo.example.co/", "anon");
        assert_eq!(config.http_url(), "https://demo.example.co");
        assert_eq!(
            config.ws_url().unwrap().as_str(),
            "wss://demo.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let local = ClientConfig::new("http://127.0.0.1:54321", "k");
        assert_eq!(local.ws_url().unwrap().scheme(), "ws");
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::default().validate().is_err());
        assert!(ClientConfig::new("https://demo.example.co", "anon").validate().is_ok());

        let mut config = ClientConfig::new("https://demo.example.co", "anon");
        config.schema.calls_table = "calls; drop table x".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_schema_variants() {
        assert_eq!(SchemaConfig::default().signals_table, "call_signaling");
        assert_eq!(SchemaConfig::legacy().calls_table, "calls");
        assert!(SchemaConfig::legacy().validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wavecall.json");

        let mut config = ClientConfig::new("https://demo.example.co", "anon");
        config.schema = SchemaConfig::legacy();
        config.save(&path).unwrap();

        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_sections_default() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"backend":{"url":"https://x.co","anon_key":"k"}}"#).unwrap();
        assert_eq!(config.schema, SchemaConfig::default());
        assert_eq!(config.realtime.heartbeat_interval_secs, 30);
        assert_eq!(config.ice.ice_candidate_pool_size, 10);
    }
}
