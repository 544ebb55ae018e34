//! Polymorphic wire codec.
//!
//! Two discriminator styles are in play. *Inline*: `msgtype` sits next to
//! the message fields inside `content` and may appear at any position in
//! the object. *Property*: the envelope `type` determines how the sibling
//! `content` property decodes. Unknown discriminators never fail a
//! response; they land in the designated unknown variant. Only a missing
//! required field or a primitive type mismatch is a decode failure.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::CoreError;
use crate::event::{
    ClientEvent, CreateContent, Event, EventContent, ImageInfo, MemberContent, MessageContent,
    PowerLevelsContent, RedactionContent, StrippedStateEvent, Unsigned,
};
use crate::id::{EventId, Mxc, UserId};

/// Decode `content` under a given envelope `type`.
pub fn decode_event_content(event_type: &str, content: &Value) -> Result<EventContent, CoreError> {
    match event_type {
        "m.room.message" => decode_message_content(content).map(EventContent::Message),
        "m.room.member" => {
            decode_typed::<MemberContent>(content, "content").map(EventContent::Member)
        }
        "m.room.redaction" => {
            decode_typed::<RedactionContent>(content, "content").map(EventContent::Redaction)
        }
        "m.room.create" => {
            decode_typed::<CreateContent>(content, "content").map(EventContent::Create)
        }
        "m.room.power_levels" => {
            decode_typed::<PowerLevelsContent>(content, "content").map(EventContent::PowerLevels)
        }
        _ => Ok(EventContent::Unknown {
            event_type: event_type.to_owned(),
            raw: content.clone(),
        }),
    }
}

/// Decode `m.room.message` content, dispatching on the inline `msgtype`.
pub fn decode_message_content(content: &Value) -> Result<MessageContent, CoreError> {
    let Some(object) = content.as_object() else {
        return Err(CoreError::decode("content", "expected object"));
    };

    // Plain map lookup: the discriminator's position in the object is
    // irrelevant.
    match object.get("msgtype").and_then(Value::as_str) {
        Some("m.text") => Ok(MessageContent::Text {
            body: require_str(object, "body", "content")?,
        }),
        Some("m.image") => {
            let url = match object.get("url") {
                None | Some(Value::Null) => None,
                Some(Value::String(raw)) => Some(
                    Mxc::parse(raw)
                        .map_err(|err| CoreError::decode("content.url", err.to_string()))?,
                ),
                Some(_) => return Err(CoreError::decode("content.url", "expected string")),
            };
            let info = match object.get("info") {
                None | Some(Value::Null) => None,
                Some(value) => Some(decode_typed::<ImageInfo>(value, "content.info")?),
            };
            Ok(MessageContent::Image {
                body: require_str(object, "body", "content")?,
                url,
                info,
            })
        }
        other => Ok(MessageContent::Unknown {
            msgtype: other.map(str::to_owned),
            raw: content.clone(),
        }),
    }
}

/// Encode message content back to its wire object.
pub fn encode_message_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text { body } => json!({ "msgtype": "m.text", "body": body }),
        MessageContent::Image { body, url, info } => {
            let mut object = Map::new();
            object.insert("msgtype".to_owned(), Value::from("m.image"));
            object.insert("body".to_owned(), Value::from(body.clone()));
            if let Some(url) = url {
                object.insert("url".to_owned(), Value::from(url.to_string()));
            }
            if let Some(info) = info
                && let Ok(value) = serde_json::to_value(info)
            {
                object.insert("info".to_owned(), value);
            }
            Value::Object(object)
        }
        MessageContent::Unknown { raw, .. } => raw.clone(),
    }
}

/// Encode event content back to its wire object.
pub fn encode_event_content(content: &EventContent) -> Result<Value, CoreError> {
    match content {
        EventContent::Message(message) => Ok(encode_message_content(message)),
        EventContent::Member(member) => to_value_checked(member),
        EventContent::Redaction(redaction) => to_value_checked(redaction),
        EventContent::Create(create) => to_value_checked(create),
        EventContent::PowerLevels(levels) => to_value_checked(levels),
        EventContent::Unknown { raw, .. } => Ok(raw.clone()),
    }
}

fn to_value_checked<T: Serialize>(content: &T) -> Result<Value, CoreError> {
    serde_json::to_value(content).map_err(|err| CoreError::decode("content", err.to_string()))
}

fn require_str(object: &Map<String, Value>, key: &str, path: &str) -> Result<String, CoreError> {
    match object.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(CoreError::decode(
            format!("{path}.{key}"),
            "expected string",
        )),
        None => Err(CoreError::decode(
            format!("{path}.{key}"),
            "missing required field",
        )),
    }
}

fn decode_typed<T: DeserializeOwned>(value: &Value, path: &str) -> Result<T, CoreError> {
    serde_json::from_value(value.clone()).map_err(|err| CoreError::decode(path, err.to_string()))
}

impl Serialize for MessageContent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode_message_content(self).serialize(serializer)
    }
}

impl Serialize for EventContent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode_event_content(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    sender: Option<UserId>,
    #[serde(default)]
    event_id: Option<EventId>,
}

#[derive(Deserialize, Default)]
struct RawUnsigned {
    #[serde(default)]
    age: Option<i64>,
    #[serde(default)]
    prev_content: Option<Value>,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    redacted_because: Option<Box<ClientEvent>>,
}

#[derive(Deserialize)]
struct RawClientEvent {
    #[serde(flatten)]
    event: RawEvent,
    #[serde(default)]
    origin_server_ts: Option<u64>,
    #[serde(default)]
    unsigned: Option<RawUnsigned>,
}

#[derive(Deserialize)]
struct RawStrippedEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Option<Value>,
    state_key: String,
    #[serde(default)]
    sender: Option<UserId>,
}

fn convert_event(raw: RawEvent, redacted: bool) -> Result<Event, CoreError> {
    let content = if redacted {
        None
    } else {
        let value = raw.content.unwrap_or_else(|| Value::Object(Map::new()));
        Some(decode_event_content(&raw.event_type, &value)?)
    };
    Ok(Event {
        event_type: raw.event_type,
        content,
        state_key: raw.state_key,
        sender: raw.sender,
        event_id: raw.event_id,
    })
}

fn convert_client_event(raw: RawClientEvent) -> Result<ClientEvent, CoreError> {
    let unsigned = raw.unsigned.map(|unsigned| Unsigned {
        age: unsigned.age,
        prev_content: unsigned.prev_content,
        transaction_id: unsigned.transaction_id,
        redacted_because: unsigned.redacted_because,
    });
    let redacted = unsigned
        .as_ref()
        .is_some_and(|unsigned| unsigned.redacted_because.is_some());
    Ok(ClientEvent {
        event: convert_event(raw.event, redacted)?,
        origin_server_ts: raw.origin_server_ts,
        unsigned,
    })
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEvent::deserialize(deserializer)?;
        convert_event(raw, false).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for ClientEvent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawClientEvent::deserialize(deserializer)?;
        convert_client_event(raw).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for StrippedStateEvent {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawStrippedEvent::deserialize(deserializer)?;
        let value = raw.content.unwrap_or_else(|| Value::Object(Map::new()));
        let content =
            decode_event_content(&raw.event_type, &value).map_err(serde::de::Error::custom)?;
        Ok(StrippedStateEvent {
            event_type: raw.event_type,
            content: Some(content),
            state_key: raw.state_key,
            sender: raw.sender,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Membership;

    #[test]
    fn decodes_discriminator_at_any_position() {
        let first = json!({ "msgtype": "m.text", "body": "hi" });
        let last = json!({ "body": "hi", "msgtype": "m.text" });

        for content in [first, last] {
            let decoded = decode_message_content(&content).expect("text message should decode");
            assert_eq!(
                decoded,
                MessageContent::Text {
                    body: "hi".to_owned()
                }
            );
        }
    }

    #[test]
    fn unknown_msgtype_falls_back_without_error() {
        let content = json!({ "msgtype": "m.location", "body": "here", "geo_uri": "geo:1,2" });
        let decoded = decode_message_content(&content).expect("unknown msgtype must not fail");
        match decoded {
            MessageContent::Unknown { msgtype, raw } => {
                assert_eq!(msgtype.as_deref(), Some("m.location"));
                assert_eq!(raw, content);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn missing_msgtype_is_unknown_not_error() {
        let decoded = decode_message_content(&json!({ "body": "hi" }))
            .expect("missing msgtype must not fail");
        assert!(matches!(
            decoded,
            MessageContent::Unknown { msgtype: None, .. }
        ));
    }

    #[test]
    fn missing_required_body_fails_with_path() {
        let err = decode_message_content(&json!({ "msgtype": "m.text" }))
            .expect_err("missing body must fail");
        assert_eq!(
            err,
            CoreError::decode("content.body", "missing required field")
        );
    }

    #[test]
    fn unknown_event_type_keeps_raw_content() {
        let content = json!({ "topic": "weekly sync" });
        let decoded = decode_event_content("m.room.topic", &content)
            .expect("unknown event type must not fail");
        match decoded {
            EventContent::Unknown { event_type, raw } => {
                assert_eq!(event_type, "m.room.topic");
                assert_eq!(raw, content);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn envelope_type_selects_content_decoder() {
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "m.room.member",
            "state_key": "@bob:h",
            "sender": "@alice:h",
            "event_id": "$m1",
            "origin_server_ts": 1_700_000_000_000_u64,
            "content": { "membership": "join", "displayname": "Bob" }
        }))
        .expect("member event should decode");

        match event.content() {
            Some(EventContent::Member(member)) => {
                assert_eq!(member.membership, Membership::Join);
                assert_eq!(member.displayname.as_deref(), Some("Bob"));
            }
            other => panic!("unexpected content: {other:?}"),
        }
        assert!(event.is_state());
    }

    #[test]
    fn unrecognized_membership_decodes_as_unknown() {
        let member: MemberContent =
            serde_json::from_value(json!({ "membership": "wandering" }))
                .expect("unknown membership must not fail");
        assert_eq!(member.membership, Membership::Unknown);
    }

    #[test]
    fn redacted_event_has_no_content() {
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "m.room.message",
            "event_id": "$gone",
            "content": {},
            "unsigned": {
                "redacted_because": {
                    "type": "m.room.redaction",
                    "event_id": "$red",
                    "content": { "redacts": "$gone" }
                }
            }
        }))
        .expect("redacted event should decode");

        assert!(event.content().is_none());
        assert!(event.is_redacted());
        let because = event
            .unsigned
            .as_ref()
            .and_then(|unsigned| unsigned.redacted_because.as_deref())
            .expect("redaction reference should be present");
        assert_eq!(because.event_id().map(EventId::as_str), Some("$red"));
    }

    #[test]
    fn encoding_omits_absent_fields() {
        let member = MemberContent {
            membership: Membership::Join,
            displayname: None,
            avatar_url: None,
            reason: None,
        };
        let value = serde_json::to_value(&member).expect("member content should encode");
        assert_eq!(value, json!({ "membership": "join" }));

        let text = MessageContent::text("hello");
        let value = serde_json::to_value(&text).expect("text content should encode");
        assert_eq!(value, json!({ "msgtype": "m.text", "body": "hello" }));
    }
}
