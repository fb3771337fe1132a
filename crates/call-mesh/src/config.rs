//! Configuration types for a call session

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN server used when nothing else is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Main configuration for joining a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// Bearer token presented once when the signaling channel is opened
    pub auth_token: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// Operator-supplied relay servers (optional)
    pub turn: Option<TurnConfig>,

    /// Which capture devices to request
    pub capture: CaptureRequest,
}

/// TURN relay configuration
///
/// All urls share one username/credential pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URLs (turn: or turns:)
    pub urls: Vec<String>,

    /// Username for TURN authentication
    pub username: Option<String>,

    /// Credential for TURN authentication
    pub credential: Option<String>,
}

/// Capture request handed to the media devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Request a microphone track
    pub audio: bool,
    /// Request a camera track
    pub video: bool,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:3000".to_string(),
            auth_token: None,
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn: None,
            capture: CaptureRequest::default(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl CallConfig {
    /// Build a configuration from the process environment
    ///
    /// Reads `CALL_SIGNALING_URL`, `CALL_AUTH_TOKEN`, `CALL_TURN_URLS`
    /// (comma separated), `CALL_TURN_USERNAME` and `CALL_TURN_CREDENTIAL`.
    /// Empty values are treated as unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(url) = env_value("CALL_SIGNALING_URL") {
            config.signaling_url = url;
        }
        config.auth_token = env_value("CALL_AUTH_TOKEN");

        let urls = env_value("CALL_TURN_URLS")
            .map(|raw| parse_url_list(&raw))
            .unwrap_or_default();
        if !urls.is_empty() {
            config.turn = Some(TurnConfig {
                urls,
                username: env_value("CALL_TURN_USERNAME"),
                credential: env_value("CALL_TURN_CREDENTIAL"),
            });
        }

        config
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty or holds a non-STUN url
    /// - a TURN url does not use the turn: or turns: scheme
    /// - `signaling_url` is not a WebSocket URL
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        if let Some(turn) = &self.turn {
            for url in &turn.urls {
                if !url.starts_with("turn:") && !url.starts_with("turns:") {
                    return Err(Error::InvalidConfig(format!(
                        "TURN server must start with turn: or turns:, got {}",
                        url
                    )));
                }
            }
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        Ok(())
    }

    /// Set the relay configuration
    pub fn with_turn(mut self, turn: TurnConfig) -> Self {
        self.turn = Some(turn);
        self
    }

    /// Set the bearer token for the signaling channel
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// ICE server list handed to every new peer connection
    ///
    /// Each STUN url gets its own entry; all TURN urls share one entry
    /// carrying the credentials.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers: Vec<RTCIceServer> = self
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        if let Some(turn) = self.turn.as_ref().filter(|t| !t.urls.is_empty()) {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone().unwrap_or_default(),
                credential: turn.credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }

        servers
    }
}

fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
