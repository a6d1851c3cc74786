use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use crate::engine::models::ChannelKind;

/// Top-level bot configuration, loaded from soundboard.toml.
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct BotConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub sounds: SoundsSection,
    pub gateway: GatewaySection,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Log out after this many seconds without a join, leave or play.
    pub inactivity_timeout_secs: u64,
    /// Bound on join, leave and logout acknowledgements.
    pub ack_timeout_secs: u64,
    /// Log out and back in before rejoining a group whose voice connection was
    /// just torn down. Works around gateways where a bare rejoin hangs.
    pub reconnect_before_rejoin: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 600,
            ack_timeout_secs: 5,
            reconnect_before_rejoin: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct SoundsSection {
    /// Sandbox root. Local track identifiers resolve inside this folder only.
    pub folder: String,
    pub supported_extensions: Vec<String>,
    pub scan_interval_secs: u64,
    /// Display names keyed by file name.
    pub mappings: HashMap<String, String>,
}

impl Default for SoundsSection {
    fn default() -> Self {
        Self {
            folder: "sounds".into(),
            supported_extensions: [".mp3", ".ogg", ".wav", ".opus", ".flac"]
                .into_iter()
                .map(String::from)
                .collect(),
            scan_interval_secs: 3,
            mappings: HashMap::new(),
        }
    }
}

/// Seed directory of the in-process gateway.
#[derive(Deserialize, Default)]
#[serde(default)]
pub struct GatewaySection {
    pub groups: Vec<SeedGroup>,
}

#[derive(Deserialize)]
pub struct SeedGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub channels: Vec<SeedChannel>,
}

#[derive(Deserialize)]
pub struct SeedChannel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
}

impl BotConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::parse(&contents).with_context(|| format!("failed to parse config file {path}"))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Ok(v) = std::env::var("SOUNDS_FOLDER") {
            self.sounds.folder = v;
        }
        if let Ok(v) = std::env::var("INACTIVITY_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.session.inactivity_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("ACK_TIMEOUT_SECS")
            && let Ok(secs) = v.parse()
        {
            self.session.ack_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("RECONNECT_BEFORE_REJOIN")
            && let Ok(flag) = v.parse()
        {
            self.session.reconnect_before_rejoin = flag;
        }
    }
}
