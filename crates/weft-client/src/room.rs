//! Stored per-room structures the sync engine maintains.

use std::collections::HashMap;

use weft_core::{EventContent, EventId, StateSnapshot};

use crate::api::{RoomSummaryUpdate, UnreadNotificationCounts};
use crate::timeline::Timeline;

/// A room this user is joined to.
#[derive(Debug, Default)]
pub(crate) struct JoinedRoom {
    pub timeline: Timeline,
    /// Equal to the snapshot of the newest timeline event when one exists,
    /// otherwise the most recent state delivered by `/sync`.
    pub state: StateSnapshot,
    pub account_data: HashMap<String, EventContent>,
    pub ephemeral: HashMap<String, EventContent>,
    pub summary: RoomSummaryUpdate,
    pub unread_notifications: UnreadNotificationCounts,
    pub unread_thread_notifications: HashMap<EventId, UnreadNotificationCounts>,
}

/// A room this user has left; only the applicable sections survive.
#[derive(Debug, Default)]
pub(crate) struct LeftRoom {
    pub timeline: Timeline,
    pub state: StateSnapshot,
    pub account_data: HashMap<String, EventContent>,
}

pub(crate) fn merge_summary(stored: &mut RoomSummaryUpdate, update: RoomSummaryUpdate) {
    if update.heroes.is_some() {
        stored.heroes = update.heroes;
    }
    if update.joined_member_count.is_some() {
        stored.joined_member_count = update.joined_member_count;
    }
    if update.invited_member_count.is_some() {
        stored.invited_member_count = update.invited_member_count;
    }
}
