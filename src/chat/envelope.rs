use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::User;

/// A chat message as it travels over the socket.
///
/// Fields the relay doesn't know about are kept in `extra` and echoed back
/// untouched when the envelope is broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub user: User,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn decode(frame: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(frame)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
