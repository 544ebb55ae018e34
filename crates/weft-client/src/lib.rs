//! Stateful Matrix client core.
//!
//! Consumes incremental `/sync` responses and maintains a consistent local
//! view of rooms, their state, and gap-tracked per-room timelines with
//! on-demand backfill over `/rooms/{id}/messages`.

/// Typed endpoint surface and wire response types.
pub mod api;
/// Client facade, event handles, and the sync/fill coordination gates.
pub mod client;
/// Client error type.
pub mod error;
/// Session: login, refresh, authenticated dispatch.
pub mod session;
/// HTTP dispatch seam.
pub mod transport;

mod room;
mod sync;
mod timeline;

pub use api::{
    CreateRoomOptions, Direction, InitialStateEvent, MatrixApi, PresenceState,
    RoomMessagesResponse, RoomPreset, RoomSummaryUpdate, RoomVisibility, SyncResponse,
    UnreadNotificationCounts,
};
pub use client::{Client, EventHandle, TimelineCursor};
pub use error::ClientError;
pub use session::{LoginData, Session};
pub use timeline::TimelineEntry;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
