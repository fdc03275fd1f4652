//! Configuration management for jobcam
//!
//! Provides configuration loading, saving, and validation for the signaling
//! relay, peer sessions, ICE servers, capture devices and media storage.

use crate::errors::LinkError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub ice: IceConfig,
    pub capture: CaptureConfig,
    pub media: MediaConfig,
}

/// Relay channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Topic name prefix; the job id is appended
    pub topic_prefix: String,
    /// Extra publish attempts before the channel is reported unavailable
    pub publish_retries: u32,
    /// Delay between publish attempts in milliseconds
    pub retry_delay_ms: u64,
}

/// Peer session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bounded inbox size per session
    pub inbox_capacity: usize,
    /// Time allowed for the remote description and a confirmed route
    pub negotiation_timeout_ms: u64,
    /// Time allowed for the capture permission prompt
    pub capture_timeout_ms: u64,
}

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// Bundle policy for the peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub servers: Vec<IceServer>,
}

/// Local capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub video: bool,
    pub audio: bool,
    /// Consumers allowed to share one capture handle (session + preview)
    pub max_consumers: usize,
}

/// Blob storage used to resolve creative assets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub public_base_url: String,
    pub bucket: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "session-".to_string(),
            publish_retries: 2,
            retry_delay_ms: 100,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 64,
            negotiation_timeout_ms: 30_000,
            capture_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            transport_policy: IceTransportPolicy::All,
            bundle_policy: BundlePolicy::MaxBundle,
            servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
            max_consumers: 2,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:54321".to_string(),
            bucket: "ad-media".to_string(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| LinkError::Config(format!("Failed to read config file: {}", e)))?;

        let config: LinkConfig = toml::from_str(&contents)
            .map_err(|e| LinkError::Config(format!("Failed to parse config file: {}", e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load the file (if any) and apply `JOBCAM_` environment overrides on
    /// top, e.g. `JOBCAM_SESSION__NEGOTIATION_TIMEOUT_MS=5000`.
    pub fn load_layered<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let layered = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("JOBCAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LinkError::Config(format!("Failed to layer config: {}", e)))?;

        layered
            .try_deserialize::<LinkConfig>()
            .map_err(|e| LinkError::Config(format!("Failed to deserialize config: {}", e)))
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), LinkError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                LinkError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| LinkError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| LinkError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("jobcam.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.session.inbox_capacity == 0 {
            return Err("Session inbox capacity must be at least 1".to_string());
        }
        if self.session.negotiation_timeout_ms == 0 {
            return Err("Negotiation timeout must be positive".to_string());
        }
        if self.session.capture_timeout_ms == 0 {
            return Err("Capture timeout must be positive".to_string());
        }
        if self.signaling.topic_prefix.is_empty() {
            return Err("Signaling topic prefix cannot be empty".to_string());
        }

        if self.ice.servers.is_empty() {
            return Err("At least one ICE server is required".to_string());
        }
        for server in &self.ice.servers {
            if server.urls.is_empty() {
                return Err("ICE server must list at least one URL".to_string());
            }
            for url in &server.urls {
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                if !is_turn && !url.starts_with("stun:") {
                    return Err(format!("Unsupported ICE server URL: {}", url));
                }
                if is_turn && (server.username.is_none() || server.credential.is_none()) {
                    return Err(format!("TURN server {} requires username and credential", url));
                }
            }
        }

        if !(1..=2).contains(&self.capture.max_consumers) {
            return Err("Capture consumers must be 1 or 2".to_string());
        }
        if !self.capture.video && !self.capture.audio {
            return Err("Capture must request video, audio or both".to_string());
        }

        Ok(())
    }
}
