//! Wire types exchanged with the management plane.
//!
//! Inbound: the JSON envelope read from the backhaul websocket. Outbound:
//! the liveness probe written back on the same socket, and the command
//! lifecycle REST payloads (`ack` on receipt, `fin` on completion).

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Priority used for command acknowledgements and completion notices.
pub const COMMAND_EVENT_PRIORITY: i32 = 10;

/// Shell name reserved for commands the agent handles itself.
pub const INTERNAL_SHELL: &str = "internal";

/// Raw inbound envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A command pushed by the management plane.
///
/// Every field may be missing or `null` on the wire; both decode to the
/// empty value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CommandRef {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub shell: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub line: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CommandRef {
    /// Whether this is an agent-internal command with the given name
    /// (e.g. `restart`).
    pub fn is_internal(&self, name: &str) -> bool {
        self.shell == INTERNAL_SHELL && self.line.trim() == name
    }
}

/// Decoded inbound query. Unknown names are kept for logging.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Command(CommandRef),
    Quit { reason: Option<String> },
    Reconnect { reason: Option<String> },
    Unknown(String),
}

/// Reasons an inbound frame could not be turned into a [`Query`].
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("'command' query without a command body")]
    MissingCommand,

    #[error("command body has an empty id")]
    EmptyCommandId,
}

impl Query {
    /// Decode a websocket text frame.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::try_from(envelope)
    }
}

impl TryFrom<Envelope> for Query {
    type Error = EnvelopeError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.query.as_str() {
            "command" => {
                let command = envelope.command.ok_or(EnvelopeError::MissingCommand)?;
                if command.id.is_empty() {
                    return Err(EnvelopeError::EmptyCommandId);
                }
                Ok(Query::Command(command))
            }
            "quit" => Ok(Query::Quit {
                reason: envelope.reason,
            }),
            "reconnect" => Ok(Query::Reconnect {
                reason: envelope.reason,
            }),
            _ => Ok(Query::Unknown(envelope.query)),
        }
    }
}

/// Liveness probe sent after each processed frame.
pub const PING_JSON: &str = r#"{"query":"ping"}"#;

/// Body of the completion notice posted to `/fin/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandFinish {
    pub success: bool,
    pub result: String,
    /// Wall-clock execution time in seconds.
    pub elapsed_time: f64,
}

/// `POST` target acknowledging receipt of a command.
pub fn ack_path(command_id: &str) -> String {
    format!("/api/events/commands/{command_id}/ack/")
}

/// `POST` target reporting completion of a command.
pub fn fin_path(command_id: &str) -> String {
    format!("/api/events/commands/{command_id}/fin/")
}
