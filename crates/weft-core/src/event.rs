//! Typed Matrix events: envelopes and the content tagged unions.
//!
//! Content decoding is two-level: the envelope `type` picks the content
//! family, and within `m.room.message` the `msgtype` field picks the
//! message variant. Both dispatches live in [`crate::codec`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{EventId, Mxc, RoomId, UserId};

/// Room message content, discriminated inline by `msgtype`.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    /// `m.text`
    Text { body: String },
    /// `m.image`
    Image {
        body: String,
        url: Option<Mxc>,
        info: Option<ImageInfo>,
    },
    /// Any message type this client does not model; the raw content is kept.
    Unknown {
        msgtype: Option<String>,
        raw: Value,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn msgtype(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => Some("m.text"),
            Self::Image { .. } => Some("m.image"),
            Self::Unknown { msgtype, .. } => msgtype.as_deref(),
        }
    }
}

/// Metadata attached to `m.image` messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Room membership states. Unrecognized wire values map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invite,
    Join,
    Knock,
    Leave,
    Ban,
    #[serde(other)]
    Unknown,
}

/// `m.room.member` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Mxc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `m.room.redaction` content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactionContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reference to the room this one replaced, carried by `m.room.create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousRoom {
    pub room_id: RoomId,
    pub event_id: EventId,
}

/// `m.room.create` content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(rename = "m.federate", default = "default_federate")]
    pub federate: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<PreviousRoom>,
}

impl Default for CreateContent {
    fn default() -> Self {
        Self {
            creator: None,
            room_version: None,
            federate: true,
            room_type: None,
            predecessor: None,
        }
    }
}

fn default_federate() -> bool {
    true
}

/// `m.room.power_levels` content with the protocol default values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerLevelsContent {
    pub users: HashMap<UserId, i64>,
    pub users_default: i64,
    pub events: HashMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            users_default: 0,
            events: HashMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 0,
        }
    }
}

/// Event content, discriminated by the envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Message(MessageContent),
    Member(MemberContent),
    Redaction(RedactionContent),
    Create(CreateContent),
    PowerLevels(PowerLevelsContent),
    /// Any event type this client does not model; the raw content is kept.
    Unknown { event_type: String, raw: Value },
}

impl EventContent {
    /// The envelope `type` this content belongs under.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Message(_) => "m.room.message",
            Self::Member(_) => "m.room.member",
            Self::Redaction(_) => "m.room.redaction",
            Self::Create(_) => "m.room.create",
            Self::PowerLevels(_) => "m.room.power_levels",
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

/// Bare event envelope as used for presence, account data, and ephemeral
/// sections.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    /// `None` if and only if the event was redacted.
    pub content: Option<EventContent>,
    pub state_key: Option<String>,
    pub sender: Option<UserId>,
    pub event_id: Option<EventId>,
}

impl Event {
    /// A state event is exactly an event carrying a `state_key`.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }
}

/// The `unsigned` portion of a client event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unsigned {
    pub age: Option<i64>,
    /// Raw previous content of a state event; decoded only when rewinding,
    /// because its type is the envelope type which is only in scope there.
    pub prev_content: Option<Value>,
    pub transaction_id: Option<String>,
    pub redacted_because: Option<Box<ClientEvent>>,
}

/// Full event as delivered to clients: the envelope plus server timestamps
/// and the `unsigned` bag.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub event: Event,
    pub origin_server_ts: Option<u64>,
    pub unsigned: Option<Unsigned>,
}

impl ClientEvent {
    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn content(&self) -> Option<&EventContent> {
        self.event.content.as_ref()
    }

    pub fn state_key(&self) -> Option<&str> {
        self.event.state_key.as_deref()
    }

    pub fn sender(&self) -> Option<&UserId> {
        self.event.sender.as_ref()
    }

    pub fn event_id(&self) -> Option<&EventId> {
        self.event.event_id.as_ref()
    }

    pub fn is_state(&self) -> bool {
        self.event.is_state()
    }

    /// A redacted event has no content and records the redaction that
    /// removed it.
    pub fn is_redacted(&self) -> bool {
        self.event.content.is_none()
            && self
                .unsigned
                .as_ref()
                .is_some_and(|unsigned| unsigned.redacted_because.is_some())
    }
}

/// Reduced-form state event delivered with invited and knocked rooms.
#[derive(Debug, Clone, PartialEq)]
pub struct StrippedStateEvent {
    pub event_type: String,
    pub content: Option<EventContent>,
    pub state_key: String,
    pub sender: Option<UserId>,
}
