//! Client facade: one object owning the session, the sync engine, and the
//! per-room timelines.
//!
//! All shared mutable state lives behind a single mutex; a `Notify` plays
//! the condition variable over two boolean gates. `syncing` admits at most
//! one `/sync` at a time (concurrent callers collapse into the running
//! one), `filling` serializes hole fills against syncs and each other. The
//! network part of both runs outside the lock; a drop guard clears the
//! gate even when the operation errors or is cancelled mid-flight.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;
use url::Url;

use weft_core::{
    EventContent, EventId, EventWithState, MessageContent, RoomId, StateSnapshot, UserId,
    resolve_events,
};

use crate::api::{
    CreateRoomOptions, Direction, MatrixApi, PresenceState, RoomSummaryUpdate,
    UnreadNotificationCounts,
};
use crate::error::ClientError;
use crate::session::{LoginData, Session};
use crate::sync::{ClientState, EventLocation, fold_state_section, merge_sync_response,
    register_appended};
use crate::timeline::{NodeId, Point, TimelineEntry};
use crate::transport::{HttpTransport, ReqwestTransport};

#[derive(Debug)]
pub(crate) struct ClientInner {
    api: MatrixApi,
    state: Mutex<ClientState>,
    gate: Notify,
}

impl ClientInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, ClientState>, ClientError> {
        self.state
            .lock()
            .map_err(|_| ClientError::internal("client state lock poisoned"))
    }

    /// Claim the sync slot if free, without holding the lock guard past the
    /// call. Used so the async `sync` caller never has a `MutexGuard` local
    /// live across an `.await` (which would make its future non-`Send`).
    fn begin_sync(&self) -> Result<SyncAction, ClientError> {
        let mut state = self.lock_state()?;
        if state.syncing {
            return Ok(SyncAction::AlreadyRunning);
        }
        if state.filling {
            return Ok(SyncAction::WaitAndRetry);
        }
        state.syncing = true;
        Ok(SyncAction::Start(state.next_batch.clone()))
    }

    fn is_syncing(&self) -> Result<bool, ClientError> {
        Ok(self.lock_state()?.syncing)
    }
}

enum SyncAction {
    AlreadyRunning,
    WaitAndRetry,
    Start(Option<String>),
}

#[derive(Debug, Clone, Copy)]
enum Gate {
    Syncing,
    Filling,
}

/// Clears its gate and wakes waiters on drop, so cancellation or an error
/// in the network phase never leaves the flag stuck.
struct GateGuard {
    inner: Arc<ClientInner>,
    gate: Gate,
}

impl GateGuard {
    fn new(inner: Arc<ClientInner>, gate: Gate) -> Self {
        Self { inner, gate }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            match self.gate {
                Gate::Syncing => state.syncing = false,
                Gate::Filling => state.filling = false,
            }
        }
        self.inner.gate.notify_waiters();
    }
}

/// Stateful Matrix client.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client against a homeserver with no resumed session.
    pub fn new(homeserver: &str) -> Result<Self, ClientError> {
        Self::with_transport(
            &LoginData::new(homeserver),
            Arc::new(ReqwestTransport::new()),
        )
    }

    /// Resume a session previously exported with [`Client::to_login_data`].
    pub fn from_login_data(data: &LoginData) -> Result<Self, ClientError> {
        Self::with_transport(data, Arc::new(ReqwestTransport::new()))
    }

    /// Build with a custom transport (embedding, tests).
    pub fn with_transport(
        data: &LoginData,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, ClientError> {
        let session = Session::from_login_data(data, transport)?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                api: MatrixApi::new(session),
                state: Mutex::new(ClientState::default()),
                gate: Notify::new(),
            }),
        })
    }

    /// Typed endpoint surface, for calls the facade does not wrap.
    pub fn api(&self) -> &MatrixApi {
        &self.inner.api
    }

    pub fn session(&self) -> &Session {
        self.inner.api.session()
    }

    pub fn homeserver(&self) -> &Url {
        self.session().homeserver()
    }

    pub fn logged_in(&self) -> Result<bool, ClientError> {
        self.session().logged_in()
    }

    pub fn expired(&self) -> Result<bool, ClientError> {
        self.session().expired()
    }

    pub fn expired_at(&self, at: SystemTime) -> Result<bool, ClientError> {
        self.session().expired_at(at)
    }

    pub fn user_id(&self) -> Result<Option<UserId>, ClientError> {
        self.session().user_id()
    }

    pub fn device_id(&self) -> Result<Option<String>, ClientError> {
        self.session().device_id()
    }

    pub fn to_login_data(&self) -> Result<LoginData, ClientError> {
        self.session().to_login_data()
    }

    pub async fn password_login(
        &self,
        user: &str,
        password: &str,
        initial_display_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.session()
            .password_login(user, password, initial_display_name, device_id)
            .await
    }

    pub async fn token_login(
        &self,
        token: &str,
        initial_display_name: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.session()
            .token_login(token, initial_display_name, device_id)
            .await
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.session().refresh().await
    }

    /// Perform one `/sync` and merge the response.
    ///
    /// If a sync is already in flight this call does not issue a second
    /// request; it waits for the running one and returns, since the caller
    /// has then observed the latest batch either way. A cancelled call
    /// leaves `next_batch` unchanged.
    pub async fn sync(&self, timeout: Duration) -> Result<(), ClientError> {
        let since = loop {
            let notified = self.inner.gate.notified();
            match self.inner.begin_sync()? {
                SyncAction::AlreadyRunning => {
                    drop(notified);
                    return self.await_running_sync().await;
                }
                SyncAction::WaitAndRetry => {
                    notified.await;
                    continue;
                }
                SyncAction::Start(since) => break since,
            }
        };

        let _guard = GateGuard::new(self.inner.clone(), Gate::Syncing);
        debug!(since = ?since, "starting sync");
        let response = self
            .inner
            .api
            .sync(
                None,
                false,
                PresenceState::Online,
                since.as_deref(),
                timeout.as_millis() as u64,
            )
            .await?;

        let mut state = self.inner.lock_state()?;
        merge_sync_response(&mut state, response)
    }

    async fn await_running_sync(&self) -> Result<(), ClientError> {
        loop {
            let notified = self.inner.gate.notified();
            if !self.inner.is_syncing()? {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Server-side room list. Prefer the synced [`Client::joined_room_ids`].
    #[deprecated(note = "passthrough of /joined_rooms; use joined_room_ids")]
    pub async fn get_joined_rooms(&self) -> Result<Vec<RoomId>, ClientError> {
        self.inner.api.joined_rooms().await
    }

    /// Send an event with arbitrary serializable content.
    pub async fn send_event<T: Serialize>(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &T,
    ) -> Result<EventId, ClientError> {
        let value = serde_json::to_value(content)
            .map_err(|err| ClientError::decode("event content", err.to_string()))?;
        self.inner.api.send_event(room, event_type, value).await
    }

    pub async fn send_message(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EventId, ClientError> {
        self.send_event(room, "m.room.message", content).await
    }

    pub async fn send_text_message(
        &self,
        room: &RoomId,
        body: &str,
    ) -> Result<EventId, ClientError> {
        self.send_message(room, &MessageContent::text(body)).await
    }

    pub async fn redact(
        &self,
        room: &RoomId,
        event: &EventId,
        reason: Option<&str>,
    ) -> Result<EventId, ClientError> {
        self.inner.api.redact_event(room, event, reason).await
    }

    pub async fn create_room(&self, options: &CreateRoomOptions) -> Result<RoomId, ClientError> {
        self.inner.api.create_room(options).await
    }

    pub async fn invite_user(
        &self,
        room: &RoomId,
        user: &UserId,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        self.inner.api.invite_user(room, user, reason).await
    }

    pub async fn join_room(
        &self,
        room_id_or_alias: &str,
        reason: Option<&str>,
        via: &[String],
    ) -> Result<RoomId, ClientError> {
        self.inner.api.join_room(room_id_or_alias, reason, via).await
    }

    pub async fn leave_room(
        &self,
        room: &RoomId,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        self.inner.api.leave_room(room, reason).await
    }

    pub fn next_batch(&self) -> Result<Option<String>, ClientError> {
        Ok(self.inner.lock_state()?.next_batch.clone())
    }

    pub fn joined_room_ids(&self) -> Result<Vec<RoomId>, ClientError> {
        Ok(self.inner.lock_state()?.joined.keys().cloned().collect())
    }

    pub fn left_room_ids(&self) -> Result<Vec<RoomId>, ClientError> {
        Ok(self.inner.lock_state()?.left.keys().cloned().collect())
    }

    /// Current state snapshot of a joined or left room.
    pub fn room_state(&self, room: &RoomId) -> Result<Option<StateSnapshot>, ClientError> {
        let state = self.inner.lock_state()?;
        Ok(state
            .joined
            .get(room)
            .map(|joined| joined.state.clone())
            .or_else(|| state.left.get(room).map(|left| left.state.clone())))
    }

    pub fn invited_state(&self, room: &RoomId) -> Result<Option<StateSnapshot>, ClientError> {
        Ok(self.inner.lock_state()?.invited_state.get(room).cloned())
    }

    pub fn knock_state(&self, room: &RoomId) -> Result<Option<StateSnapshot>, ClientError> {
        Ok(self.inner.lock_state()?.knock_state.get(room).cloned())
    }

    pub fn presence(&self, user: &UserId) -> Result<Option<EventContent>, ClientError> {
        Ok(self.inner.lock_state()?.presence_state.get(user).cloned())
    }

    pub fn room_summary(&self, room: &RoomId) -> Result<Option<RoomSummaryUpdate>, ClientError> {
        Ok(self
            .inner
            .lock_state()?
            .joined
            .get(room)
            .map(|joined| joined.summary.clone()))
    }

    pub fn room_unread_counts(
        &self,
        room: &RoomId,
    ) -> Result<Option<UnreadNotificationCounts>, ClientError> {
        Ok(self
            .inner
            .lock_state()?
            .joined
            .get(room)
            .map(|joined| joined.unread_notifications))
    }

    pub fn room_thread_unread_counts(
        &self,
        room: &RoomId,
        thread_root: &EventId,
    ) -> Result<Option<UnreadNotificationCounts>, ClientError> {
        Ok(self
            .inner
            .lock_state()?
            .joined
            .get(room)
            .and_then(|joined| joined.unread_thread_notifications.get(thread_root).copied()))
    }

    pub fn room_account_data(
        &self,
        room: &RoomId,
        event_type: &str,
    ) -> Result<Option<EventContent>, ClientError> {
        let state = self.inner.lock_state()?;
        Ok(state
            .joined
            .get(room)
            .and_then(|joined| joined.account_data.get(event_type))
            .or_else(|| {
                state
                    .left
                    .get(room)
                    .and_then(|left| left.account_data.get(event_type))
            })
            .cloned())
    }

    /// Handle to an event known through the global index.
    pub fn event(&self, event_id: &EventId) -> Result<Option<EventHandle>, ClientError> {
        let state = self.inner.lock_state()?;
        let Some(location) = state.events_by_id.get(event_id) else {
            return Ok(None);
        };
        Ok(Some(EventHandle {
            inner: self.inner.clone(),
            room: location.room.clone(),
            node: location.node,
            event_id: Some(event_id.clone()),
        }))
    }

    /// Handle to the oldest event of a room, skipping leading holes.
    pub fn room_first(&self, room: &RoomId) -> Result<Option<EventHandle>, ClientError> {
        self.room_end(room, true)
    }

    /// Handle to the newest event of a room, skipping trailing holes.
    pub fn room_last(&self, room: &RoomId) -> Result<Option<EventHandle>, ClientError> {
        self.room_end(room, false)
    }

    fn room_end(&self, room: &RoomId, first: bool) -> Result<Option<EventHandle>, ClientError> {
        let state = self.inner.lock_state()?;
        let Some(timeline) = state.timeline(room) else {
            return Ok(None);
        };
        let node = if first {
            timeline.first_event()?
        } else {
            timeline.last_event()?
        };
        let Some(node) = node else {
            return Ok(None);
        };
        let event_id = timeline
            .event_ref(node)
            .and_then(|with_state| with_state.event.event_id().cloned());
        Ok(Some(EventHandle {
            inner: self.inner.clone(),
            room: room.clone(),
            node,
            event_id,
        }))
    }

    /// Cheap snapshot of a room's point sequence.
    pub fn timeline_entries(
        &self,
        room: &RoomId,
    ) -> Result<Option<Vec<TimelineEntry>>, ClientError> {
        let state = self.inner.lock_state()?;
        match state.timeline(room) {
            Some(timeline) => Ok(Some(timeline.entries()?)),
            None => Ok(None),
        }
    }
}

enum Adjacent {
    Event(EventHandle),
    Hole,
    End,
}

/// Handle to one timeline event.
///
/// A handle survives deduplication: when its node is displaced it
/// re-resolves through the global event index on next use.
#[derive(Debug, Clone)]
pub struct EventHandle {
    inner: Arc<ClientInner>,
    room: RoomId,
    node: NodeId,
    event_id: Option<EventId>,
}

impl EventHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    pub fn event_id(&self) -> Option<&EventId> {
        self.event_id.as_ref()
    }

    /// The event and its state snapshot.
    pub fn value(&self) -> Result<EventWithState, ClientError> {
        let state = self.inner.lock_state()?;
        let location = self.locate(&state)?;
        state
            .timeline(&location.room)
            .and_then(|timeline| timeline.event_ref(location.node))
            .cloned()
            .ok_or_else(|| ClientError::internal("located timeline node is not an event"))
    }

    /// The state snapshot attached to this event.
    pub fn state(&self) -> Result<StateSnapshot, ClientError> {
        Ok(self.value()?.state)
    }

    /// Next event, fetching across a hole when needed.
    pub async fn next(&self) -> Result<Option<EventHandle>, ClientError> {
        self.advance(true).await
    }

    /// Previous event, fetching across a hole when needed.
    pub async fn previous(&self) -> Result<Option<EventHandle>, ClientError> {
        self.advance(false).await
    }

    /// Next event without I/O; `None` across a hole or at the end.
    pub fn next_sync(&self) -> Result<Option<EventHandle>, ClientError> {
        let state = self.inner.lock_state()?;
        match self.adjacent(&state, true)? {
            Adjacent::Event(handle) => Ok(Some(handle)),
            Adjacent::Hole | Adjacent::End => Ok(None),
        }
    }

    /// Previous event without I/O; `None` across a hole or at the start.
    pub fn previous_sync(&self) -> Result<Option<EventHandle>, ClientError> {
        let state = self.inner.lock_state()?;
        match self.adjacent(&state, false)? {
            Adjacent::Event(handle) => Ok(Some(handle)),
            Adjacent::Hole | Adjacent::End => Ok(None),
        }
    }

    /// Lazy forward enumeration starting at this event.
    pub fn events_forward(&self) -> TimelineCursor {
        TimelineCursor {
            next: Some(self.clone()),
            forward: true,
        }
    }

    /// Lazy backward enumeration starting at this event.
    pub fn events_backward(&self) -> TimelineCursor {
        TimelineCursor {
            next: Some(self.clone()),
            forward: false,
        }
    }

    async fn advance(&self, forward: bool) -> Result<Option<EventHandle>, ClientError> {
        {
            let state = self.inner.lock_state()?;
            match self.adjacent(&state, forward)? {
                Adjacent::Event(handle) => return Ok(Some(handle)),
                Adjacent::End => return Ok(None),
                Adjacent::Hole => {}
            }
        }
        fill_adjacent(&self.inner, self, forward).await
    }

    fn adjacent(&self, state: &ClientState, forward: bool) -> Result<Adjacent, ClientError> {
        let location = self.locate(state)?;
        let timeline = state
            .timeline(&location.room)
            .ok_or_else(|| ClientError::internal("room timeline missing"))?;
        let neighbor = if forward {
            timeline.next_of(location.node)
        } else {
            timeline.prev_of(location.node)
        };
        match neighbor {
            None => Ok(Adjacent::End),
            Some(node) => match timeline.point(node) {
                Some(Point::Event(with_state)) => Ok(Adjacent::Event(EventHandle {
                    inner: self.inner.clone(),
                    room: location.room.clone(),
                    node,
                    event_id: with_state.event.event_id().cloned(),
                })),
                Some(Point::Hole { .. }) => Ok(Adjacent::Hole),
                None => Err(ClientError::internal("timeline node missing")),
            },
        }
    }

    /// Current location, healing an orphaned handle through the index.
    fn locate(&self, state: &ClientState) -> Result<EventLocation, ClientError> {
        if let Some(timeline) = state.timeline(&self.room)
            && let Some(with_state) = timeline.event_ref(self.node)
            && with_state.event.event.event_id == self.event_id
        {
            return Ok(EventLocation {
                room: self.room.clone(),
                node: self.node,
            });
        }

        let Some(event_id) = &self.event_id else {
            return Err(ClientError::internal(
                "handle to an unidentified event was displaced",
            ));
        };
        state
            .events_by_id
            .get(event_id)
            .cloned()
            .ok_or_else(|| ClientError::internal(format!("event {event_id} is no longer indexed")))
    }
}

/// Lazy event sequence over a timeline, advancing one step at a time.
#[derive(Debug)]
pub struct TimelineCursor {
    next: Option<EventHandle>,
    forward: bool,
}

impl TimelineCursor {
    /// Yield the next event handle, filling holes as needed.
    pub async fn next(&mut self) -> Result<Option<EventHandle>, ClientError> {
        let Some(current) = self.next.take() else {
            return Ok(None);
        };
        self.next = if self.forward {
            current.next().await?
        } else {
            current.previous().await?
        };
        Ok(Some(current))
    }
}

/// Fill the hole adjacent to `handle` and return the nearest new event.
///
/// Waits until no sync and no other fill is in flight, re-checks the
/// adjacent node under the lock (another filler may have resolved it),
/// performs the `/messages` call outside the lock, then splices the hole
/// under the lock.
async fn fill_adjacent(
    inner: &Arc<ClientInner>,
    handle: &EventHandle,
    forward: bool,
) -> Result<Option<EventHandle>, ClientError> {
    loop {
        let notified = inner.gate.notified();
        let mut state = inner.lock_state()?;
        if state.syncing || state.filling {
            drop(state);
            notified.await;
            continue;
        }

        let location = handle.locate(&state)?;
        let (hole_node, hole_from, hole_to, handle_state) = {
            let timeline = state
                .timeline(&location.room)
                .ok_or_else(|| ClientError::internal("room timeline missing"))?;
            let neighbor = if forward {
                timeline.next_of(location.node)
            } else {
                timeline.prev_of(location.node)
            };
            match neighbor {
                None => return Ok(None),
                Some(node) => match timeline.point(node) {
                    Some(Point::Event(with_state)) => {
                        return Ok(Some(EventHandle {
                            inner: inner.clone(),
                            room: location.room.clone(),
                            node,
                            event_id: with_state.event.event_id().cloned(),
                        }));
                    }
                    Some(Point::Hole { from, to }) => {
                        let handle_state = timeline
                            .event_ref(location.node)
                            .ok_or_else(|| {
                                ClientError::internal("located timeline node is not an event")
                            })?
                            .state
                            .clone();
                        (node, from.clone(), to.clone(), handle_state)
                    }
                    None => return Err(ClientError::internal("timeline node missing")),
                },
            }
        };

        state.filling = true;
        drop(state);
        let _guard = GateGuard::new(inner.clone(), Gate::Filling);

        let (direction, from, to) = if forward {
            (Direction::Forward, hole_from.clone(), hole_to.clone())
        } else {
            (Direction::Backward, hole_to.clone(), hole_from.clone())
        };
        debug!(
            room = %location.room,
            dir = ?direction,
            from = ?from,
            to = ?to,
            "filling timeline hole"
        );
        let response = inner
            .api
            .room_messages(&location.room, direction, from.as_deref(), to.as_deref())
            .await?;

        let mut state = inner.lock_state()?;
        // The response state resolves forward onto the handle's snapshot to
        // give the state in force at the chunk boundary.
        let pre_chunk = fold_state_section(response.state, &handle_state)?;
        let (resolved, _) = resolve_events(response.chunk, Some(&pre_chunk), !forward)?;
        let chunk_empty = resolved.is_empty();

        // Replacement points, left to right: the fetched events in timeline
        // order, plus a remainder hole for the range `end` did not cover.
        let mut points = Vec::with_capacity(resolved.len() + 1);
        if forward {
            points.extend(resolved.into_iter().map(Point::Event));
            if let Some(end) = response.end.clone() {
                points.push(Point::Hole {
                    from: Some(end),
                    to: hole_to.clone(),
                });
            }
        } else {
            if let Some(end) = response.end.clone() {
                points.push(Point::Hole {
                    from: hole_from.clone(),
                    to: Some(end),
                });
            }
            points.extend(resolved.into_iter().rev().map(Point::Event));
        }

        let target = {
            let timeline = state
                .timeline_mut(&location.room)
                .ok_or_else(|| ClientError::internal("room timeline missing"))?;
            let inserted = timeline.splice(hole_node, points)?;
            let event_nodes: Vec<NodeId> = inserted
                .iter()
                .copied()
                .filter(|&id| timeline.event_ref(id).is_some())
                .collect();
            let target_node = if forward {
                event_nodes.first().copied()
            } else {
                event_nodes.last().copied()
            };
            let target = target_node.and_then(|node| {
                timeline
                    .event_ref(node)
                    .map(|with_state| (node, with_state.event.event_id().cloned()))
            });
            register_appended(&mut state, &location.room, &event_nodes)?;
            target
        };
        drop(state);

        if chunk_empty {
            return Ok(None);
        }
        let (node, event_id) = target
            .ok_or_else(|| ClientError::internal("filled chunk produced no event node"))?;
        return Ok(Some(EventHandle {
            inner: inner.clone(),
            room: location.room.clone(),
            node,
            event_id,
        }));
    }
}
