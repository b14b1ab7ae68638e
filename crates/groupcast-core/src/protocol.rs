//! Wire protocol.
//!
//! Three layers share these types:
//!
//! - **Client → server**: [`ClientCommand`] records, one JSON object per text frame.
//! - **Server → client**: [`Message`] deliveries and [`ServerEvent`] notices.
//!   Clients decode either with [`InboundFrame`].
//! - **Server ↔ broker**: [`Envelope`] bytes published on a group's topic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{GROUP_TOPIC_INFIX, MAX_GROUP_NAME_LEN};
use crate::errors::{BrokerError, GroupError};
use crate::ids::ConnectionId;

/// A command sent by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Become a member of `group`.
    Join {
        /// Target group.
        group: String,
    },
    /// Stop being a member of `group`.
    Leave {
        /// Target group.
        group: String,
    },
    /// Publish `payload` to every member of `group`.
    Send {
        /// Target group.
        group: String,
        /// Opaque payload, `null` when omitted.
        #[serde(default)]
        payload: Value,
    },
}

impl ClientCommand {
    /// Which command this is.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Join { .. } => CommandKind::Join,
            Self::Leave { .. } => CommandKind::Leave,
            Self::Send { .. } => CommandKind::Send,
        }
    }

    /// Group the command targets.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::Join { group } | Self::Leave { group } | Self::Send { group, .. } => group,
        }
    }
}

/// Discriminant of a [`ClientCommand`], echoed in acks and errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// `join`
    Join,
    /// `leave`
    Leave,
    /// `send`
    Send,
}

impl CommandKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Send => "send",
        }
    }
}

/// A published message. Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Group it was published to.
    pub group: String,
    /// Publishing connection.
    pub sender: ConnectionId,
    /// Per-(sender, group) sequence number, starting at 0.
    pub seq: u64,
    /// Opaque payload.
    pub payload: Value,
}

/// Membership transition announced to the rest of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    /// Connection joined the group.
    Joined,
    /// Connection left the group.
    Left,
}

/// Non-delivery frame sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// First frame on every session.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        /// Identity assigned to this connection.
        connection: ConnectionId,
    },

    /// A command completed.
    #[serde(rename = "ack")]
    Ack {
        /// Command being acknowledged.
        command: CommandKind,
        /// Group it targeted.
        group: String,
        /// Sequence number assigned, for `send` only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// A command failed or a frame could not be parsed.
    #[serde(rename = "error")]
    Error {
        /// Command that failed, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<CommandKind>,
        /// Group involved, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        /// Stable machine-readable code.
        code: String,
        /// Human-readable detail.
        message: String,
    },

    /// Another connection joined a group this connection belongs to.
    #[serde(rename = "member.joined")]
    MemberJoined {
        /// Group joined.
        group: String,
        /// Joining connection.
        connection: ConnectionId,
    },

    /// Another connection left a group this connection belongs to.
    #[serde(rename = "member.left")]
    MemberLeft {
        /// Group left.
        group: String,
        /// Departing connection.
        connection: ConnectionId,
    },

    /// The group's broker subscription was re-established after a loss.
    /// Messages published during the outage may be missing.
    #[serde(rename = "group.resubscribed")]
    GroupResubscribed {
        /// Affected group.
        group: String,
    },
}

/// Code used for frames that are not valid commands.
pub const INVALID_COMMAND: &str = "INVALID_COMMAND";

impl ServerEvent {
    /// Error frame for a failed command.
    #[must_use]
    pub fn from_error(command: Option<CommandKind>, err: &GroupError) -> Self {
        Self::Error {
            command,
            group: err.group().map(str::to_owned),
            code: err.code().to_owned(),
            message: err.to_string(),
        }
    }

    /// Error frame for an unparseable inbound frame.
    #[must_use]
    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::Error {
            command: None,
            group: None,
            code: INVALID_COMMAND.to_owned(),
            message: message.into(),
        }
    }

    /// Presence notice for `event`.
    #[must_use]
    pub fn presence(group: String, connection: ConnectionId, event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::Joined => Self::MemberJoined { group, connection },
            PresenceEvent::Left => Self::MemberLeft { group, connection },
        }
    }
}

/// Anything a client can receive: a delivery or a server event.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    /// Server event (has a `type` field).
    Event(ServerEvent),
    /// Message delivery.
    Delivery(Message),
}

/// Payload carried on a group's broker topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// A sequenced message to fan out.
    Message(Message),
    /// A presence notice to fan out.
    Presence {
        /// Group concerned.
        group: String,
        /// Subject connection.
        connection: ConnectionId,
        /// What happened.
        event: PresenceEvent,
    },
}

impl Envelope {
    /// Group this envelope belongs to.
    #[must_use]
    pub fn group(&self) -> &str {
        match self {
            Self::Message(m) => &m.group,
            Self::Presence { group, .. } => group,
        }
    }

    /// Connection that caused the envelope (sender or presence subject).
    #[must_use]
    pub fn origin(&self) -> &ConnectionId {
        match self {
            Self::Message(m) => &m.sender,
            Self::Presence { connection, .. } => connection,
        }
    }

    /// Encode for the broker.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Codec(e.to_string()))
    }

    /// Decode bytes received from the broker.
    pub fn decode(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::Codec(e.to_string()))
    }
}

/// Check a group name: 1 to [`MAX_GROUP_NAME_LEN`] ASCII letters, digits,
/// `-`, `_` or `.`.
pub fn validate_group_name(name: &str) -> Result<(), GroupError> {
    let invalid = |reason| GroupError::InvalidGroup {
        name: name.to_owned(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(invalid("must be at most 100 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid("may only contain ASCII letters, digits, '-', '_' or '.'"));
    }
    Ok(())
}

/// Broker topic backing `group`.
#[must_use]
pub fn topic_for(prefix: &str, group: &str) -> String {
    format!("{prefix}{GROUP_TOPIC_INFIX}{group}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parse_commands() {
        let join: ClientCommand =
            serde_json::from_str(r#"{"command":"join","group":"room_a"}"#).unwrap();
        assert_eq!(
            join,
            ClientCommand::Join {
                group: "room_a".into()
            }
        );

        let send: ClientCommand = serde_json::from_str(
            r#"{"command":"send","group":"room_a","payload":{"count":3}}"#,
        )
        .unwrap();
        assert_eq!(send.kind(), CommandKind::Send);
        assert_matches!(send, ClientCommand::Send { payload, .. } if payload == json!({"count": 3}));
    }

    #[test]
    fn send_payload_defaults_to_null() {
        let send: ClientCommand =
            serde_json::from_str(r#"{"command":"send","group":"g"}"#).unwrap();
        assert_matches!(send, ClientCommand::Send { payload: Value::Null, .. });
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"command":"shout","group":"g"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"message":"hi"}"#).is_err());
    }

    #[test]
    fn delivery_wire_shape() {
        let msg = Message {
            group: "room_a".into(),
            sender: ConnectionId::from("c1"),
            seq: 4,
            payload: json!({"count": 4}),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"group": "room_a", "sender": "c1", "seq": 4, "payload": {"count": 4}})
        );
    }

    #[test]
    fn event_wire_shapes() {
        let ack = ServerEvent::Ack {
            command: CommandKind::Join,
            group: "g".into(),
            seq: None,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "ack", "command": "join", "group": "g"})
        );

        let joined = ServerEvent::presence("g".into(), "c2".into(), PresenceEvent::Joined);
        assert_eq!(
            serde_json::to_value(&joined).unwrap(),
            json!({"type": "member.joined", "group": "g", "connection": "c2"})
        );

        let err = ServerEvent::invalid_command("expected JSON");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "error", "code": "INVALID_COMMAND", "message": "expected JSON"})
        );
    }

    #[test]
    fn error_event_from_group_error() {
        let err = GroupError::PublishFailed {
            group: "g".into(),
            source: BrokerError::Unavailable("down".into()),
        };
        let event = ServerEvent::from_error(Some(CommandKind::Send), &err);
        assert_matches!(
            event,
            ServerEvent::Error { command: Some(CommandKind::Send), group: Some(g), code, .. }
                if g == "g" && code == "PUBLISH_FAILED"
        );
    }

    #[test]
    fn inbound_frame_distinguishes_events_and_deliveries() {
        let delivery: InboundFrame =
            serde_json::from_str(r#"{"group":"g","sender":"c1","seq":0,"payload":null}"#).unwrap();
        assert_matches!(delivery, InboundFrame::Delivery(Message { seq: 0, .. }));

        let event: InboundFrame =
            serde_json::from_str(r#"{"type":"group.resubscribed","group":"g"}"#).unwrap();
        assert_matches!(event, InboundFrame::Event(ServerEvent::GroupResubscribed { .. }));
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::Presence {
            group: "g".into(),
            connection: "c1".into(),
            event: PresenceEvent::Left,
        };
        let bytes = env.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"kind": "presence", "group": "g", "connection": "c1", "event": "left"})
        );
        assert_eq!(Envelope::decode(&bytes).unwrap(), env);

        let msg = Envelope::Message(Message {
            group: "g".into(),
            sender: "c1".into(),
            seq: 9,
            payload: json!("hi"),
        });
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "message");
        assert_eq!(value["seq"], 9);
        assert_eq!(msg.group(), "g");
        assert_eq!(msg.origin().as_str(), "c1");
    }

    #[test]
    fn envelope_decode_garbage_is_codec_error() {
        assert_matches!(Envelope::decode(b"not json"), Err(BrokerError::Codec(_)));
        assert_matches!(
            Envelope::decode(br#"{"kind":"message","group":"g"}"#),
            Err(BrokerError::Codec(_))
        );
    }

    #[test]
    fn group_name_rules() {
        assert!(validate_group_name("room_a").is_ok());
        assert!(validate_group_name("lobby-1.eu").is_ok());
        assert!(validate_group_name(&"x".repeat(100)).is_ok());
        assert_matches!(validate_group_name(""), Err(GroupError::InvalidGroup { .. }));
        assert_matches!(
            validate_group_name(&"x".repeat(101)),
            Err(GroupError::InvalidGroup { .. })
        );
        assert_matches!(
            validate_group_name("room a"),
            Err(GroupError::InvalidGroup { .. })
        );
        assert_matches!(validate_group_name("café"), Err(GroupError::InvalidGroup { .. }));
    }

    #[test]
    fn topic_naming() {
        assert_eq!(topic_for("groupcast:", "room_a"), "groupcast:__group__room_a");
        assert_eq!(topic_for("", "g"), "__group__g");
    }

    proptest! {
        #[test]
        fn valid_names_accepted(name in "[A-Za-z0-9_.-]{1,100}") {
            prop_assert!(validate_group_name(&name).is_ok());
        }

        #[test]
        fn names_with_other_chars_rejected(
            prefix in "[a-z]{0,5}",
            bad in "[ /:#@!*?]",
            suffix in "[a-z]{0,5}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(validate_group_name(&name).is_err());
        }
    }
}
