// Application envelope carried on the data channels
// One JSON text frame per message: {"type": ..., "payload": ...}

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Application-layer message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEnvelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,
}

impl AppEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Serialize to a single text frame for transmission
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a received text frame
    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
