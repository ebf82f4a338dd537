use serde::{Deserialize, Serialize};

use crate::media::{LensFacing, QualityTier};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Session timing
    pub session: SessionConfig,
    /// Rendezvous service connection
    pub rendezvous: RendezvousConfig,
    /// Peer connection settings
    pub webrtc: WebRtcConfig,
    /// Local capture settings
    pub capture: CaptureConfig,
}

/// Session timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Window for coalescing rapid payload updates (ms)
    pub debounce_ms: u64,
    /// First reconnect delay after losing the rendezvous service (ms)
    pub reconnect_delay_ms: u64,
    /// Upper bound for the reconnect backoff (ms)
    pub reconnect_max_delay_ms: u64,
    /// Interval before the initiator dials again when the counterpart is
    /// not online yet (seconds, 0 disables)
    pub redial_secs: u64,
    /// Polling interval for an attached measurement source (ms)
    pub measurement_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            reconnect_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            redial_secs: 5,
            measurement_poll_ms: 33,
        }
    }
}

/// Rendezvous service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// WebSocket URL of the rendezvous service
    pub server_url: String,
    /// Heartbeat interval (seconds)
    pub heartbeat_secs: u64,
    /// Connect timeout (ms)
    pub connect_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9000/rendezvous".to_string(),
            heartbeat_secs: 5,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// Label of the overlay data channel
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            data_channel_label: "overlay".to_string(),
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN URLs; several allow UDP/TCP fallback
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Local capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Lens used for the first capture
    pub default_facing: LensFacing,
    pub quality: QualityTier,
    /// Lower resolution and frame rate ceilings for constrained links
    pub constrained: bool,
    /// V4L2 device of the front camera
    pub front_device: String,
    /// V4L2 device of the back camera
    pub back_device: String,
    /// ALSA capture device
    pub audio_device: String,
    /// Opus bitrate (bps)
    pub audio_bitrate: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_facing: LensFacing::Back,
            quality: QualityTier::Standard,
            constrained: false,
            front_device: "/dev/video1".to_string(),
            back_device: "/dev/video0".to_string(),
            audio_device: "default".to_string(),
            audio_bitrate: 64_000,
        }
    }
}
