//! Pure Matrix client-server protocol core.
//!
//! This crate holds everything the stateful client consumes that needs no
//! I/O: identifier newtypes, the typed event model with its two-level
//! polymorphic wire codec, and state snapshot resolution.

/// Polymorphic JSON codec for events and their content.
pub mod codec;
/// Core error type.
pub mod error;
/// Typed events: envelopes and content unions.
pub mod event;
/// Identifier newtypes and the `mxc://` URI.
pub mod id;
/// State snapshots and the event-stream resolver.
pub mod state;

pub use error::CoreError;
pub use event::{
    ClientEvent, CreateContent, Event, EventContent, ImageInfo, MemberContent, Membership,
    MessageContent, PowerLevelsContent, PreviousRoom, RedactionContent, StrippedStateEvent,
    Unsigned,
};
pub use id::{EventId, IdParseError, Mxc, RoomId, UserId};
pub use state::{
    EventWithState, RoomEvent, StateKey, StateSnapshot, fold_stripped, resolve, resolve_events,
};
