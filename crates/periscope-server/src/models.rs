//! API request and response models.

use serde::{Deserialize, Serialize};

/// Request body for `POST /api/command`.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    /// Protocol version; only `"v1"` is accepted.
    pub version: String,
    /// Command name.
    pub cmd: String,
    /// Command payload (start parameters).
    #[serde(default)]
    pub content: Option<StartContent>,
    /// Caller correlation id, echoed back.
    #[serde(default)]
    pub uuid: Option<String>,
}

/// Start parameters carried in a `start_proxy_pac` command.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartContent {
    /// Port for the tap relay listener.
    pub proxy_port: u16,
    /// Port for the PAC file listener.
    pub pac_port: u16,
    /// Allowlisted upstream, by name or address, optionally `:port`.
    pub target: String,
}

/// Response body for `POST /api/command`.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    /// Human-readable outcome.
    pub message: String,
    /// Correlation id from the request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl CommandResponse {
    /// Creates a response echoing the caller's correlation id.
    pub fn new(message: impl Into<String>, uuid: Option<String>) -> Self {
        Self {
            message: message.into(),
            uuid,
        }
    }
}
