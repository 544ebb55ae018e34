//! Room state snapshots and the event-stream resolver.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::codec;
use crate::error::CoreError;
use crate::event::{ClientEvent, EventContent, StrippedStateEvent};

/// Key of one state entry: the event type plus the event's `state_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            state_key: state_key.into(),
        }
    }
}

/// Immutable room state at one point in the timeline.
///
/// Updates return a new snapshot; prior snapshots stay valid and are shared
/// by every event that references them. Copy-on-write over a shared map
/// keeps clones cheap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    entries: Arc<HashMap<StateKey, Arc<EventContent>>>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_type: &str, state_key: &str) -> Option<&EventContent> {
        self.entries
            .get(&StateKey::new(event_type, state_key))
            .map(Arc::as_ref)
    }

    pub fn with(&self, key: StateKey, content: Arc<EventContent>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(key, content);
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn without(&self, key: &StateKey) -> Self {
        if !self.entries.contains_key(key) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.remove(key);
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &EventContent)> {
        self.entries
            .iter()
            .map(|(key, content)| (key, content.as_ref()))
    }
}

/// A client event paired with the state in force at that event.
///
/// For a state-bearing event the snapshot is the state *after* the event;
/// otherwise it is the state under which the event was accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct EventWithState {
    pub event: ClientEvent,
    pub state: StateSnapshot,
}

/// Resolver input: either a full client event or a stripped state event.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Full(ClientEvent),
    Stripped(StrippedStateEvent),
}

/// Fold an event stream into per-event snapshots and a final snapshot.
///
/// Forward (`rewind = false`): state events update the snapshot at
/// `(type, state_key)`; full events are emitted with the current snapshot;
/// stripped events contribute to state only. A redacted state event has no
/// content and leaves the snapshot untouched.
///
/// Rewind (`rewind = true`): events arrive newest to oldest. Each event is
/// emitted with the incoming snapshot, then a state-bearing event rewinds
/// the snapshot through `unsigned.prev_content` (absent or null removes
/// the key). Stripped events cannot be rewound.
pub fn resolve(
    events: Vec<RoomEvent>,
    prior: Option<&StateSnapshot>,
    rewind: bool,
) -> Result<(Vec<EventWithState>, StateSnapshot), CoreError> {
    let mut snapshot = prior.cloned().unwrap_or_default();
    let mut emitted = Vec::with_capacity(events.len());

    for event in events {
        match event {
            RoomEvent::Full(event) => {
                if rewind {
                    let current = snapshot.clone();
                    if event.is_state() {
                        snapshot = rewind_state(&snapshot, &event)?;
                    }
                    emitted.push(EventWithState {
                        event,
                        state: current,
                    });
                } else {
                    if event.is_state()
                        && let (Some(content), Some(state_key)) =
                            (event.content(), event.state_key())
                    {
                        snapshot = snapshot.with(
                            StateKey::new(event.event_type(), state_key),
                            Arc::new(content.clone()),
                        );
                    }
                    emitted.push(EventWithState {
                        state: snapshot.clone(),
                        event,
                    });
                }
            }
            RoomEvent::Stripped(stripped) => {
                if rewind {
                    return Err(CoreError::InvalidOperation(
                        "stripped state events cannot be rewound".to_owned(),
                    ));
                }
                if let Some(content) = stripped.content {
                    snapshot = snapshot.with(
                        StateKey::new(stripped.event_type, stripped.state_key),
                        Arc::new(content),
                    );
                }
            }
        }
    }

    Ok((emitted, snapshot))
}

/// Resolve a stream of full client events.
pub fn resolve_events(
    events: Vec<ClientEvent>,
    prior: Option<&StateSnapshot>,
    rewind: bool,
) -> Result<(Vec<EventWithState>, StateSnapshot), CoreError> {
    resolve(
        events.into_iter().map(RoomEvent::Full).collect(),
        prior,
        rewind,
    )
}

/// Fold stripped state events onto a prior snapshot.
pub fn fold_stripped(events: Vec<StrippedStateEvent>, prior: &StateSnapshot) -> StateSnapshot {
    let mut snapshot = prior.clone();
    for stripped in events {
        if let Some(content) = stripped.content {
            snapshot = snapshot.with(
                StateKey::new(stripped.event_type, stripped.state_key),
                Arc::new(content),
            );
        }
    }
    snapshot
}

fn rewind_state(
    snapshot: &StateSnapshot,
    event: &ClientEvent,
) -> Result<StateSnapshot, CoreError> {
    let key = StateKey::new(event.event_type(), event.state_key().unwrap_or_default());
    let prev_content = event
        .unsigned
        .as_ref()
        .and_then(|unsigned| unsigned.prev_content.as_ref());
    match prev_content {
        None | Some(Value::Null) => Ok(snapshot.without(&key)),
        Some(value) => {
            let content = codec::decode_event_content(event.event_type(), value)?;
            Ok(snapshot.with(key, Arc::new(content)))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::{Event, Membership, Unsigned};

    fn member_event(
        event_id: &str,
        user: &str,
        membership: &str,
        prev_membership: Option<&str>,
    ) -> ClientEvent {
        let prev_content = prev_membership.map(|value| json!({ "membership": value }));
        serde_json::from_value(json!({
            "type": "m.room.member",
            "event_id": event_id,
            "sender": user,
            "state_key": user,
            "origin_server_ts": 1_700_000_000_000_u64,
            "content": { "membership": membership },
            "unsigned": { "prev_content": prev_content }
        }))
        .expect("member event fixture should decode")
    }

    fn text_event(event_id: &str, body: &str) -> ClientEvent {
        serde_json::from_value(json!({
            "type": "m.room.message",
            "event_id": event_id,
            "sender": "@alice:h",
            "origin_server_ts": 1_700_000_000_000_u64,
            "content": { "msgtype": "m.text", "body": body }
        }))
        .expect("text event fixture should decode")
    }

    #[test]
    fn forward_resolution_pairs_events_with_current_state() {
        let events = vec![
            member_event("$join", "@alice:h", "join", None),
            text_event("$msg", "hello"),
        ];

        let (emitted, snapshot) =
            resolve_events(events, None, false).expect("forward resolution should work");

        assert_eq!(emitted.len(), 2);
        // The message sees the membership that was in force when it arrived.
        let membership = emitted[1]
            .state
            .get("m.room.member", "@alice:h")
            .expect("membership should be present");
        match membership {
            EventContent::Member(member) => assert_eq!(member.membership, Membership::Join),
            other => panic!("unexpected content: {other:?}"),
        }
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn stripped_events_fold_without_emission() {
        let stripped: StrippedStateEvent = serde_json::from_value(json!({
            "type": "m.room.member",
            "state_key": "@bob:h",
            "sender": "@bob:h",
            "content": { "membership": "invite" }
        }))
        .expect("stripped fixture should decode");

        let (emitted, snapshot) = resolve(vec![RoomEvent::Stripped(stripped)], None, false)
            .expect("stripped fold should work");
        assert!(emitted.is_empty());
        assert!(snapshot.get("m.room.member", "@bob:h").is_some());
    }

    #[test]
    fn rewinding_stripped_events_is_rejected() {
        let stripped: StrippedStateEvent = serde_json::from_value(json!({
            "type": "m.room.member",
            "state_key": "@bob:h",
            "content": { "membership": "invite" }
        }))
        .expect("stripped fixture should decode");

        let err = resolve(vec![RoomEvent::Stripped(stripped)], None, true)
            .expect_err("rewind over stripped events must fail");
        assert!(matches!(err, CoreError::InvalidOperation(_)));
    }

    #[test]
    fn forward_then_rewind_restores_prior_snapshot() {
        let prior = StateSnapshot::new().with(
            StateKey::new("m.room.member", "@alice:h"),
            Arc::new(EventContent::Member(crate::event::MemberContent {
                membership: Membership::Invite,
                displayname: None,
                avatar_url: None,
                reason: None,
            })),
        );

        let events = vec![
            member_event("$j", "@alice:h", "join", Some("invite")),
            text_event("$m", "hi"),
            member_event("$l", "@alice:h", "leave", Some("join")),
        ];

        let (forward, after) = resolve_events(events, Some(&prior), false)
            .expect("forward resolution should work");

        let mut reversed: Vec<ClientEvent> =
            forward.into_iter().map(|emitted| emitted.event).collect();
        reversed.reverse();

        let (_, restored) = resolve_events(reversed, Some(&after), true)
            .expect("rewind resolution should work");
        assert_eq!(restored, prior);
    }

    #[test]
    fn snapshots_are_persistent_values() {
        let empty = StateSnapshot::new();
        let one = empty.with(
            StateKey::new("m.room.name", ""),
            Arc::new(EventContent::Unknown {
                event_type: "m.room.name".to_owned(),
                raw: json!({ "name": "ops" }),
            }),
        );

        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert!(one.get("m.room.name", "").is_some());

        let removed = one.without(&StateKey::new("m.room.name", ""));
        assert!(removed.is_empty());
        assert_eq!(one.len(), 1, "prior snapshot must stay intact");
    }

    #[test]
    fn redacted_state_event_leaves_snapshot_untouched() {
        let redacted = ClientEvent {
            event: Event {
                event_type: "m.room.member".to_owned(),
                content: None,
                state_key: Some("@alice:h".to_owned()),
                sender: None,
                event_id: Some("$gone".into()),
            },
            origin_server_ts: None,
            unsigned: Some(Unsigned::default()),
        };

        let (_, snapshot) = resolve_events(vec![redacted], None, false)
            .expect("forward resolution should work");
        assert!(snapshot.is_empty());
    }
}
