//! Typed surface over the REST endpoints the sync core consumes.

use std::collections::HashMap;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use weft_core::{ClientEvent, Event, EventId, RoomId, StrippedStateEvent, UserId};

use crate::error::ClientError;
use crate::session::Session;

/// Presence hint passed to `/sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Offline,
    Online,
    Unavailable,
}

impl PresenceState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Pagination direction for `/rooms/{id}/messages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "f",
            Self::Backward => "b",
        }
    }
}

/// A section of events, e.g. `state` or `ephemeral`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventList<T> {
    #[serde(default = "Vec::new")]
    pub events: Vec<T>,
}

impl<T> Default for EventList<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// Top-level `/sync` response.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
    #[serde(default)]
    pub presence: EventList<Event>,
    #[serde(default)]
    pub account_data: EventList<Event>,
}

/// Per-membership room deltas.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<RoomId, JoinedRoomSync>,
    #[serde(default)]
    pub invite: HashMap<RoomId, InvitedRoomSync>,
    #[serde(default)]
    pub knock: HashMap<RoomId, KnockedRoomSync>,
    #[serde(default)]
    pub leave: HashMap<RoomId, LeftRoomSync>,
}

/// Delta for one joined room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub account_data: EventList<Event>,
    #[serde(default)]
    pub ephemeral: EventList<Event>,
    #[serde(default)]
    pub state: EventList<ClientEvent>,
    #[serde(default)]
    pub summary: Option<RoomSummaryUpdate>,
    #[serde(default)]
    pub timeline: SyncTimeline,
    #[serde(default)]
    pub unread_notifications: Option<UnreadNotificationCounts>,
    #[serde(default)]
    pub unread_thread_notifications: HashMap<EventId, UnreadNotificationCounts>,
}

/// Delta for one invited room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvitedRoomSync {
    #[serde(default)]
    pub invite_state: EventList<StrippedStateEvent>,
}

/// Delta for one knocked room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnockedRoomSync {
    #[serde(default)]
    pub knock_state: EventList<StrippedStateEvent>,
}

/// Delta for one left room.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeftRoomSync {
    #[serde(default)]
    pub account_data: EventList<Event>,
    #[serde(default)]
    pub state: EventList<ClientEvent>,
    #[serde(default)]
    pub timeline: SyncTimeline,
}

/// Timeline section of a room delta.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncTimeline {
    #[serde(default)]
    pub events: Vec<ClientEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

/// Partial room summary; absent fields leave the stored summary untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoomSummaryUpdate {
    #[serde(rename = "m.heroes", default)]
    pub heroes: Option<Vec<UserId>>,
    #[serde(rename = "m.joined_member_count", default)]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default)]
    pub invited_member_count: Option<u64>,
}

/// Unread counters for a room or a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct UnreadNotificationCounts {
    #[serde(default)]
    pub highlight_count: u64,
    #[serde(default)]
    pub notification_count: u64,
}

/// Response of `/rooms/{id}/messages`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomMessagesResponse {
    pub start: String,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<ClientEvent>,
    #[serde(default)]
    pub state: Vec<ClientEvent>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<RoomId>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: EventId,
}

#[derive(Debug, Deserialize)]
struct CreateRoomResponse {
    room_id: RoomId,
}

#[derive(Debug, Deserialize)]
struct JoinRoomResponse {
    room_id: RoomId,
}

/// Room creation preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    PrivateChat,
    TrustedPrivateChat,
    PublicChat,
}

/// Directory visibility of a created room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    Public,
    Private,
}

/// One entry of `initial_state` in a room creation request.
#[derive(Debug, Clone, Serialize)]
pub struct InitialStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

/// Options accepted by `create_room`.
#[derive(Debug, Clone, Default)]
pub struct CreateRoomOptions {
    pub room_type: Option<String>,
    pub room_version: Option<String>,
    pub federate: Option<bool>,
    pub invite: Vec<UserId>,
    pub is_direct: Option<bool>,
    pub name: Option<String>,
    pub initial_state: Vec<InitialStateEvent>,
    pub power_level_content_override: Option<Value>,
    pub preset: Option<RoomPreset>,
    pub room_alias_name: Option<String>,
    pub topic: Option<String>,
    pub visibility: Option<RoomVisibility>,
    /// Only honored together with `predecessor_event_id`.
    pub predecessor_room_id: Option<RoomId>,
    /// Only honored together with `predecessor_room_id`.
    pub predecessor_event_id: Option<EventId>,
}

impl CreateRoomOptions {
    pub(crate) fn request_body(&self) -> Value {
        let mut body = Map::new();

        let mut creation = Map::new();
        if let Some(room_type) = &self.room_type {
            creation.insert("type".to_owned(), Value::from(room_type.clone()));
        }
        if let Some(federate) = self.federate {
            creation.insert("m.federate".to_owned(), Value::from(federate));
        }
        // Predecessor halves are only meaningful together; one alone is
        // treated as neither.
        if let (Some(room_id), Some(event_id)) =
            (&self.predecessor_room_id, &self.predecessor_event_id)
        {
            let mut predecessor = Map::new();
            predecessor.insert("room_id".to_owned(), Value::from(room_id.as_str()));
            predecessor.insert("event_id".to_owned(), Value::from(event_id.as_str()));
            creation.insert("predecessor".to_owned(), Value::Object(predecessor));
        }
        if !creation.is_empty() {
            body.insert("creation_content".to_owned(), Value::Object(creation));
        }

        if let Some(room_version) = &self.room_version {
            body.insert("room_version".to_owned(), Value::from(room_version.clone()));
        }
        if !self.invite.is_empty() {
            let users: Vec<Value> = self
                .invite
                .iter()
                .map(|user| Value::from(user.as_str()))
                .collect();
            body.insert("invite".to_owned(), Value::from(users));
        }
        if let Some(is_direct) = self.is_direct {
            body.insert("is_direct".to_owned(), Value::from(is_direct));
        }
        if let Some(name) = &self.name {
            body.insert("name".to_owned(), Value::from(name.clone()));
        }
        if !self.initial_state.is_empty()
            && let Ok(value) = serde_json::to_value(&self.initial_state)
        {
            body.insert("initial_state".to_owned(), value);
        }
        if let Some(power_levels) = &self.power_level_content_override {
            body.insert(
                "power_level_content_override".to_owned(),
                power_levels.clone(),
            );
        }
        if let Some(preset) = self.preset
            && let Ok(value) = serde_json::to_value(preset)
        {
            body.insert("preset".to_owned(), value);
        }
        if let Some(alias) = &self.room_alias_name {
            body.insert("room_alias_name".to_owned(), Value::from(alias.clone()));
        }
        if let Some(topic) = &self.topic {
            body.insert("topic".to_owned(), Value::from(topic.clone()));
        }
        if let Some(visibility) = self.visibility
            && let Ok(value) = serde_json::to_value(visibility)
        {
            body.insert("visibility".to_owned(), value);
        }

        Value::Object(body)
    }
}

/// Thin typed client over the endpoints the core needs.
#[derive(Debug, Clone)]
pub struct MatrixApi {
    session: Session,
}

impl MatrixApi {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// One long-poll of `/sync`.
    pub async fn sync(
        &self,
        filter: Option<&str>,
        full_state: bool,
        set_presence: PresenceState,
        since: Option<&str>,
        timeout_ms: u64,
    ) -> Result<SyncResponse, ClientError> {
        let timeout = timeout_ms.to_string();
        // `full_state` must be the lowercase literal; the server rejects
        // other spellings.
        let mut query: Vec<(&str, &str)> = vec![
            ("full_state", if full_state { "true" } else { "false" }),
            ("set_presence", set_presence.as_str()),
            ("timeout", &timeout),
        ];
        if let Some(filter) = filter {
            query.push(("filter", filter));
        }
        if let Some(since) = since {
            query.push(("since", since));
        }
        self.session
            .request_typed(Method::GET, &["sync"], &query, None, "/sync response")
            .await
    }

    /// Server-side list of joined rooms.
    pub async fn joined_rooms(&self) -> Result<Vec<RoomId>, ClientError> {
        let response: JoinedRoomsResponse = self
            .session
            .request_typed(
                Method::GET,
                &["joined_rooms"],
                &[],
                None,
                "/joined_rooms response",
            )
            .await?;
        Ok(response.joined_rooms)
    }

    /// Send a room event; the transaction id makes replays idempotent.
    pub async fn send_event(
        &self,
        room: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<EventId, ClientError> {
        let txn_id = Uuid::new_v4().to_string();
        let response: SendResponse = self
            .session
            .request_typed(
                Method::PUT,
                &["rooms", room.as_str(), "send", event_type, &txn_id],
                &[],
                Some(content),
                "/send response",
            )
            .await?;
        Ok(response.event_id)
    }

    /// Redact a room event.
    pub async fn redact_event(
        &self,
        room: &RoomId,
        event: &EventId,
        reason: Option<&str>,
    ) -> Result<EventId, ClientError> {
        let txn_id = Uuid::new_v4().to_string();
        let mut body = Map::new();
        if let Some(reason) = reason {
            body.insert("reason".to_owned(), Value::from(reason));
        }
        let response: SendResponse = self
            .session
            .request_typed(
                Method::PUT,
                &["rooms", room.as_str(), "redact", event.as_str(), &txn_id],
                &[],
                Some(Value::Object(body)),
                "/redact response",
            )
            .await?;
        Ok(response.event_id)
    }

    /// Paginate room history between two batch tokens.
    pub async fn room_messages(
        &self,
        room: &RoomId,
        direction: Direction,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<RoomMessagesResponse, ClientError> {
        let mut query: Vec<(&str, &str)> = vec![("dir", direction.as_str())];
        if let Some(from) = from {
            query.push(("from", from));
        }
        if let Some(to) = to {
            query.push(("to", to));
        }
        self.session
            .request_typed(
                Method::GET,
                &["rooms", room.as_str(), "messages"],
                &query,
                None,
                "/messages response",
            )
            .await
    }

    /// Create a room.
    pub async fn create_room(&self, options: &CreateRoomOptions) -> Result<RoomId, ClientError> {
        let response: CreateRoomResponse = self
            .session
            .request_typed(
                Method::POST,
                &["createRoom"],
                &[],
                Some(options.request_body()),
                "/createRoom response",
            )
            .await?;
        Ok(response.room_id)
    }

    /// Invite a user to a room.
    pub async fn invite_user(
        &self,
        room: &RoomId,
        user: &UserId,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut body = Map::new();
        body.insert("user_id".to_owned(), Value::from(user.as_str()));
        if let Some(reason) = reason {
            body.insert("reason".to_owned(), Value::from(reason));
        }
        self.session
            .request(
                Method::POST,
                &["rooms", room.as_str(), "invite"],
                &[],
                Some(Value::Object(body)),
            )
            .await?;
        Ok(())
    }

    /// Join a room by id or alias, optionally via named servers.
    pub async fn join_room(
        &self,
        room_id_or_alias: &str,
        reason: Option<&str>,
        via: &[String],
    ) -> Result<RoomId, ClientError> {
        let query: Vec<(&str, &str)> = via
            .iter()
            .map(|server| ("server_name", server.as_str()))
            .collect();
        let mut body = Map::new();
        if let Some(reason) = reason {
            body.insert("reason".to_owned(), Value::from(reason));
        }
        let response: JoinRoomResponse = self
            .session
            .request_typed(
                Method::POST,
                &["join", room_id_or_alias],
                &query,
                Some(Value::Object(body)),
                "/join response",
            )
            .await?;
        Ok(response.room_id)
    }

    /// Leave a room.
    pub async fn leave_room(&self, room: &RoomId, reason: Option<&str>) -> Result<(), ClientError> {
        let mut body = Map::new();
        if let Some(reason) = reason {
            body.insert("reason".to_owned(), Value::from(reason));
        }
        self.session
            .request(
                Method::POST,
                &["rooms", room.as_str(), "leave"],
                &[],
                Some(Value::Object(body)),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn create_room_body_includes_only_set_options() {
        let options = CreateRoomOptions {
            name: Some("ops".to_owned()),
            preset: Some(RoomPreset::PrivateChat),
            visibility: Some(RoomVisibility::Private),
            federate: Some(false),
            invite: vec!["@bob:h".into()],
            ..Default::default()
        };

        let body = options.request_body();
        assert_eq!(
            body,
            json!({
                "creation_content": { "m.federate": false },
                "invite": ["@bob:h"],
                "name": "ops",
                "preset": "private_chat",
                "visibility": "private"
            })
        );
    }

    #[test]
    fn lone_predecessor_half_is_dropped() {
        let options = CreateRoomOptions {
            predecessor_room_id: Some("!old:h".into()),
            ..Default::default()
        };
        assert_eq!(options.request_body(), json!({}));

        let options = CreateRoomOptions {
            predecessor_room_id: Some("!old:h".into()),
            predecessor_event_id: Some("$tombstone".into()),
            ..Default::default()
        };
        assert_eq!(
            options.request_body(),
            json!({
                "creation_content": {
                    "predecessor": { "room_id": "!old:h", "event_id": "$tombstone" }
                }
            })
        );
    }

    #[test]
    fn sync_response_tolerates_missing_sections() {
        let response: SyncResponse =
            serde_json::from_value(json!({ "next_batch": "b0" })).expect("minimal sync decodes");
        assert_eq!(response.next_batch, "b0");
        assert!(response.rooms.join.is_empty());
        assert!(response.presence.events.is_empty());
    }
}
