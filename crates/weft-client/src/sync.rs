//! The `/sync` merge engine.
//!
//! One merge applies a full `/sync` response to the stored client state:
//! presence, invited/knocked stripped state, and per-room account data,
//! ephemeral, state, and timeline sections. Timeline events are registered
//! through the global deduplication index as they land.

use std::collections::HashMap;

use tracing::{debug, trace};

use weft_core::{
    ClientEvent, EventContent, EventId, RoomId, StateSnapshot, UserId, fold_stripped,
    resolve_events,
};

use crate::api::{JoinedRoomSync, LeftRoomSync, SyncResponse, SyncTimeline};
use crate::error::ClientError;
use crate::room::{JoinedRoom, LeftRoom, merge_summary};
use crate::timeline::{NodeId, Timeline};

/// Where an indexed event currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventLocation {
    pub room: RoomId,
    pub node: NodeId,
}

/// All shared mutable client state, guarded by the single client lock.
#[derive(Debug, Default)]
pub(crate) struct ClientState {
    pub joined: HashMap<RoomId, JoinedRoom>,
    pub left: HashMap<RoomId, LeftRoom>,
    pub invited_state: HashMap<RoomId, StateSnapshot>,
    pub knock_state: HashMap<RoomId, StateSnapshot>,
    pub presence_state: HashMap<UserId, EventContent>,
    pub events_by_id: HashMap<EventId, EventLocation>,
    pub next_batch: Option<String>,
    pub syncing: bool,
    pub filling: bool,
}

impl ClientState {
    pub fn timeline(&self, room: &RoomId) -> Option<&Timeline> {
        self.joined
            .get(room)
            .map(|joined| &joined.timeline)
            .or_else(|| self.left.get(room).map(|left| &left.timeline))
    }

    pub fn timeline_mut(&mut self, room: &RoomId) -> Option<&mut Timeline> {
        if let Some(joined) = self.joined.get_mut(room) {
            return Some(&mut joined.timeline);
        }
        self.left.get_mut(room).map(|left| &mut left.timeline)
    }
}

/// Apply one `/sync` response. The caller has already advanced past the
/// request; `state.next_batch` still holds the token the request was made
/// with and becomes the response's `next_batch` here.
pub(crate) fn merge_sync_response(
    state: &mut ClientState,
    response: SyncResponse,
) -> Result<(), ClientError> {
    let original_batch = state.next_batch.replace(response.next_batch.clone());
    debug!(
        next_batch = %response.next_batch,
        joined = response.rooms.join.len(),
        left = response.rooms.leave.len(),
        "merging sync response"
    );

    for event in response.presence.events {
        if let (Some(sender), Some(content)) = (event.sender, event.content) {
            state.presence_state.insert(sender, content);
        }
    }

    for (room_id, invited) in response.rooms.invite {
        let prior = state
            .invited_state
            .get(&room_id)
            .cloned()
            .unwrap_or_default();
        let folded = fold_stripped(invited.invite_state.events, &prior);
        state.invited_state.insert(room_id, folded);
    }

    for (room_id, knocked) in response.rooms.knock {
        let prior = state.knock_state.get(&room_id).cloned().unwrap_or_default();
        let folded = fold_stripped(knocked.knock_state.events, &prior);
        state.knock_state.insert(room_id, folded);
    }

    for (room_id, delta) in response.rooms.join {
        merge_joined_room(state, room_id, delta, original_batch.as_deref())?;
    }

    for (room_id, delta) in response.rooms.leave {
        merge_left_room(state, room_id, delta, original_batch.as_deref())?;
    }

    Ok(())
}

fn merge_joined_room(
    state: &mut ClientState,
    room_id: RoomId,
    delta: JoinedRoomSync,
    original_batch: Option<&str>,
) -> Result<(), ClientError> {
    if !state.joined.contains_key(&room_id) {
        // A re-joined room keeps its history and thus its index entries.
        let revived = state
            .left
            .remove(&room_id)
            .map(|left| JoinedRoom {
                timeline: left.timeline,
                state: left.state,
                account_data: left.account_data,
                ..Default::default()
            })
            .unwrap_or_default();
        state.joined.insert(room_id.clone(), revived);
    }

    let base_state = {
        let room = state
            .joined
            .get_mut(&room_id)
            .ok_or_else(|| ClientError::internal("joined room vanished during merge"))?;

        for event in delta.account_data.events {
            if let Some(content) = event.content {
                room.account_data.insert(event.event_type, content);
            }
        }
        for event in delta.ephemeral.events {
            if let Some(content) = event.content {
                room.ephemeral.insert(event.event_type, content);
            }
        }
        if let Some(summary) = delta.summary {
            merge_summary(&mut room.summary, summary);
        }
        if let Some(unread) = delta.unread_notifications {
            room.unread_notifications = unread;
        }
        for (thread, counts) in delta.unread_thread_notifications {
            room.unread_thread_notifications.insert(thread, counts);
        }

        // The state section folds into the snapshot; nothing is emitted to
        // the timeline.
        let (_, folded) = resolve_events(delta.state.events, Some(&room.state), false)?;
        room.state = folded.clone();
        folded
    };

    let appended = {
        let room = state
            .joined
            .get_mut(&room_id)
            .ok_or_else(|| ClientError::internal("joined room vanished during merge"))?;
        append_timeline_section(
            &mut room.timeline,
            &room_id,
            delta.timeline,
            &base_state,
            original_batch,
        )?
    };
    register_appended(state, &room_id, &appended)?;

    // The room state follows the newest timeline event when one exists.
    let room = state
        .joined
        .get_mut(&room_id)
        .ok_or_else(|| ClientError::internal("joined room vanished during merge"))?;
    if let Some(last) = room.timeline.last_event()? {
        room.state = room
            .timeline
            .event_ref(last)
            .ok_or_else(|| ClientError::internal("timeline node missing"))?
            .state
            .clone();
    }
    Ok(())
}

fn merge_left_room(
    state: &mut ClientState,
    room_id: RoomId,
    delta: LeftRoomSync,
    original_batch: Option<&str>,
) -> Result<(), ClientError> {
    if !state.left.contains_key(&room_id) {
        // Leaving moves the stored room wholesale; index entries stay valid
        // because lookups fall through to the left map.
        let departed = state
            .joined
            .remove(&room_id)
            .map(|joined| LeftRoom {
                timeline: joined.timeline,
                state: joined.state,
                account_data: joined.account_data,
            })
            .unwrap_or_default();
        state.left.insert(room_id.clone(), departed);
    }

    let base_state = {
        let room = state
            .left
            .get_mut(&room_id)
            .ok_or_else(|| ClientError::internal("left room vanished during merge"))?;

        for event in delta.account_data.events {
            if let Some(content) = event.content {
                room.account_data.insert(event.event_type, content);
            }
        }

        let (_, folded) = resolve_events(delta.state.events, Some(&room.state), false)?;
        room.state = folded.clone();
        folded
    };

    let appended = {
        let room = state
            .left
            .get_mut(&room_id)
            .ok_or_else(|| ClientError::internal("left room vanished during merge"))?;
        append_timeline_section(
            &mut room.timeline,
            &room_id,
            delta.timeline,
            &base_state,
            original_batch,
        )?
    };
    register_appended(state, &room_id, &appended)?;

    let room = state
        .left
        .get_mut(&room_id)
        .ok_or_else(|| ClientError::internal("left room vanished during merge"))?;
    if let Some(last) = room.timeline.last_event()? {
        room.state = room
            .timeline
            .event_ref(last)
            .ok_or_else(|| ClientError::internal("timeline node missing"))?
            .state
            .clone();
    }
    Ok(())
}

/// Apply a sync timeline section: gap detection, then resolved appends.
fn append_timeline_section(
    timeline: &mut Timeline,
    room_id: &RoomId,
    section: SyncTimeline,
    base_state: &StateSnapshot,
    original_batch: Option<&str>,
) -> Result<Vec<NodeId>, ClientError> {
    // A delivered `prev_batch` that differs from the token we synced with
    // means events happened in between. On the very first sync there is no
    // prior token and nothing to bridge.
    if let Some(original) = original_batch
        && section.prev_batch.as_deref() != Some(original)
    {
        debug!(
            room = %room_id,
            from = %original,
            to = ?section.prev_batch,
            "gap detected in sync timeline"
        );
        timeline.append_hole(Some(original.to_owned()), section.prev_batch.clone())?;
    }

    let (resolved, _) = resolve_events(section.events, Some(base_state), false)?;
    let mut appended = Vec::with_capacity(resolved.len());
    for with_state in resolved {
        appended.push(timeline.append_event(with_state)?);
    }
    Ok(appended)
}

/// Run freshly inserted event nodes through the deduplication index and
/// apply any redactions they carry.
pub(crate) fn register_appended(
    state: &mut ClientState,
    room_id: &RoomId,
    nodes: &[NodeId],
) -> Result<(), ClientError> {
    for &node in nodes {
        // A duplicate earlier in the same batch may have evicted this node
        // already.
        let Some(event) = state
            .timeline(room_id)
            .and_then(|timeline| timeline.event_ref(node))
            .map(|with_state| with_state.event.clone())
        else {
            continue;
        };

        if let Some(event_id) = event.event_id().cloned() {
            let location = EventLocation {
                room: room_id.clone(),
                node,
            };
            if let Some(previous) = state.events_by_id.insert(event_id.clone(), location)
                && !(previous.room == *room_id && previous.node == node)
            {
                trace!(event_id = %event_id, "displacing duplicate timeline event");
                if let Some(timeline) = state.timeline_mut(&previous.room) {
                    timeline.remove(previous.node)?;
                }
            }
        }

        if let Some(EventContent::Redaction(redaction)) = event.content()
            && let Some(target) = redaction.redacts.clone()
            && let Some(location) = state.events_by_id.get(&target).cloned()
            && let Some(timeline) = state.timeline_mut(&location.room)
        {
            debug!(target = %target, "applying redaction in place");
            timeline.redact(location.node, event.clone())?;
        }
    }
    Ok(())
}

/// Fold a `/messages` state section onto a snapshot without emitting.
pub(crate) fn fold_state_section(
    events: Vec<ClientEvent>,
    prior: &StateSnapshot,
) -> Result<StateSnapshot, ClientError> {
    let (_, folded) = resolve_events(events, Some(prior), false)?;
    Ok(folded)
}
