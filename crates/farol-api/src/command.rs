// Command API models
// This file defines the typed command value, the dispatched envelope,
// and the acknowledgement written back by the receiving target

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use farol_common::{CMD_CREDENTIALS_UPDATED, CMD_TERMINATE, OPT_VERSION};

/// A typed command: a name plus string options.
///
/// Immutable value, built once and possibly dispatched many times.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Command {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn builder(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            command: Command::new(name),
        }
    }

    /// The reserved command that triggers orderly shutdown of a target.
    pub fn terminate() -> Self {
        Command::new(CMD_TERMINATE)
    }

    /// The reserved command announcing a new credential bundle version.
    pub fn credentials_updated(version: u64) -> Self {
        Command::builder(CMD_CREDENTIALS_UPDATED)
            .option(OPT_VERSION, version.to_string())
            .build()
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Builder for [`Command`].
pub struct CommandBuilder {
    command: Command,
}

impl CommandBuilder {
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.options.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Command {
        self.command
    }
}

/// One dispatched command plus its delivery metadata.
///
/// Created by the sender at dispatch; deleted from the store by the
/// receiving target only after its handler returns without failing
/// (at-least-once delivery).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub envelope_id: String,
    pub sender_id: String,
    pub target_id: String,
    /// Per-sender sequence; preserves FIFO from one sender to one target.
    pub sequence: u64,
    pub command: Command,
    pub created_at_ms: i64,
}

impl CommandEnvelope {
    pub fn new(sender_id: &str, target_id: &str, sequence: u64, command: Command) -> Self {
        Self {
            envelope_id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            target_id: target_id.to_string(),
            sequence,
            command,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Final outcome of one envelope on the receiving side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckStatus {
    Completed,
    Failed,
}

/// Acknowledgement written by the receiver once an envelope is finally
/// handled or permanently rejected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub envelope_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn completed(envelope_id: &str) -> Self {
        Self {
            envelope_id: envelope_id.to_string(),
            status: AckStatus::Completed,
            message: None,
        }
    }

    pub fn failed(envelope_id: &str, message: impl Into<String>) -> Self {
        Self {
            envelope_id: envelope_id.to_string(),
            status: AckStatus::Failed,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let command = Command::builder("done")
            .option("mode", "fast")
            .option("retries", "3")
            .build();
        assert_eq!(command.name, "done");
        assert_eq!(command.option("mode"), Some("fast"));
        assert_eq!(command.option("retries"), Some("3"));
        assert_eq!(command.option("missing"), None);
    }

    #[test]
    fn test_reserved_commands() {
        assert_eq!(Command::terminate().name, "terminate");

        let cmd = Command::credentials_updated(4);
        assert_eq!(cmd.name, "credentialsUpdated");
        assert_eq!(cmd.option("version"), Some("4"));
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = CommandEnvelope::new("controller", "r1", 7, Command::new("done"));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"senderId\":\"controller\""));

        let back: CommandEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.envelope_id, envelope.envelope_id);
        assert_eq!(back.sequence, 7);
        assert_eq!(back.command.name, "done");
    }

    #[test]
    fn test_ack_serialization() {
        let ack = Ack::completed("e-1");
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        assert!(!json.contains("message"));

        let ack = Ack::failed("e-2", "handler rejected");
        let back: Ack = serde_json::from_str(&serde_json::to_string(&ack).unwrap()).unwrap();
        assert_eq!(back.status, AckStatus::Failed);
        assert_eq!(back.message.as_deref(), Some("handler rejected"));
    }
}
