// teammesh configuration types
// All settings with sensible defaults matching current hardcoded values

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub channel: ChannelTuning,
    #[serde(default)]
    pub ice: IceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            channel: ChannelTuning::default(),
            ice: IceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    // Signaling hub WebSocket URL
    pub signaling_server: String,

    // How long to wait after joining for existing-peer notifications before
    // declaring ourselves host
    pub host_grace_ms: u64,

    // A peer stuck negotiating longer than this is failed and cleaned up
    pub negotiation_timeout_secs: u64,

    // Enable file-based negotiation diagnostics (/tmp/teammesh-debug.log)
    pub debug_log: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            signaling_server: "wss://hub.tripgeo.com/teamhub".to_string(),
            host_grace_ms: 200,
            negotiation_timeout_secs: 20,
            debug_log: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelTuning {
    // Data channel label announced to the remote side
    pub label: String,

    // Allow out-of-order delivery (game state tolerates it)
    pub ordered: bool,

    // Retransmit budget for lost frames; 0 = fire and forget
    pub max_retransmits: u16,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            label: "game".to_string(),
            ordered: false,
            max_retransmits: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IceConfig {
    // STUN servers handed to the connection for candidate gathering
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}
