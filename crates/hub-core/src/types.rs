use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const SCREENSHOT_ACTION: &str = "screenshot";
pub const REPLY_STATUS_SUCCESS: &str = "success";

/// Opaque device identity, allocated by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Registered,
    Connected,
    Disconnected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "device_id")]
    pub id: PeerId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub os_info: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: PeerStatus,
    pub registered_at: DateTime<Utc>,
}

/// Input to `PeerRegistry::register`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PeerRegistration {
    #[serde(rename = "device_name")]
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub os_info: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

/// A command addressed to one peer, serialized verbatim onto the peer's channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub command_id: String,
    pub action: String,
    pub target: Value,
    pub parameters: Value,
    pub timestamp: String,
}

impl CommandEnvelope {
    pub fn new(
        command_id: Option<String>,
        action: impl Into<String>,
        target: Option<Value>,
        parameters: Option<Value>,
    ) -> Self {
        let command_id = command_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            command_id,
            action: action.into(),
            target: target.unwrap_or_else(empty_object),
            parameters: parameters.unwrap_or_else(empty_object),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// First frame a device sends after the channel opens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthMessage {
    #[serde(default)]
    pub token: String,
}

/// Device reply to a previously dispatched command. Unknown fields are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplyMessage {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ReplyMessage {
    pub fn is_success(&self) -> bool {
        self.status.as_deref() == Some(REPLY_STATUS_SUCCESS)
    }

    pub fn status_label(&self) -> &str {
        self.status.as_deref().unwrap_or("unknown")
    }

    /// Converts the reply into the value stored on the correlated task.
    pub fn into_outcome(self) -> Result<Value, String> {
        if self.is_success() {
            Ok(self.result.unwrap_or_else(empty_object))
        } else {
            Err(self
                .error_message
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

/// Correlation record for an asynchronous command.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub request_id: String,
    #[serde(rename = "device_id")]
    pub peer_id: PeerId,
    #[serde(rename = "status")]
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn pending(request_id: String, peer_id: PeerId) -> Self {
        Self {
            request_id,
            peer_id,
            state: TaskState::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Counters reported by the health endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct HubHealth {
    pub devices_connected: usize,
    pub devices_registered: usize,
    pub tasks_tracked: usize,
}

pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Decodes one frame sent by a device. Only JSON objects are accepted.
pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    match serde_json::from_str::<Value>(text).map_err(|err| err.to_string())? {
        object @ Value::Object(_) => serde_json::from_value(object).map_err(|err| err.to_string()),
        Value::Array(_) => Err("expected a JSON object, got an array".to_string()),
        other => Err(format!("expected a JSON object, got {other}")),
    }
}
