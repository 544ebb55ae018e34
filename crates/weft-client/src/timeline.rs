//! Gap-tracked room timeline.
//!
//! A timeline is a doubly-linked sequence of points: events with their
//! state snapshot, interleaved with holes. A hole carries the pair of
//! batch tokens bounding a range the client has not fetched; either end
//! may be open. Two holes are never adjacent — removals and splices merge
//! neighbors to keep that invariant.

use std::collections::HashMap;

use weft_core::{ClientEvent, EventWithState, Unsigned};

use crate::error::ClientError;

/// Stable per-timeline node identity. Ids are never reused, so a stale
/// handle can detect that its node is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(u64);

/// Public projection of one timeline point.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    Event(EventWithState),
    Gap {
        from: Option<String>,
        to: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Point {
    Event(EventWithState),
    Hole {
        from: Option<String>,
        to: Option<String>,
    },
}

#[derive(Debug)]
struct Node {
    point: Point,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

#[derive(Debug, Default)]
pub(crate) struct Timeline {
    nodes: HashMap<NodeId, Node>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    next_id: u64,
}

impl Timeline {
    fn alloc(&mut self, point: Point) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                point,
                prev: None,
                next: None,
            },
        );
        id
    }

    fn node(&self, id: NodeId) -> Result<&Node, ClientError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ClientError::internal("timeline node missing"))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, ClientError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| ClientError::internal("timeline node missing"))
    }

    pub fn next_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|node| node.next)
    }

    pub fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|node| node.prev)
    }

    pub fn point(&self, id: NodeId) -> Option<&Point> {
        self.nodes.get(&id).map(|node| &node.point)
    }

    pub fn event_ref(&self, id: NodeId) -> Option<&EventWithState> {
        match self.nodes.get(&id) {
            Some(Node {
                point: Point::Event(event),
                ..
            }) => Some(event),
            _ => None,
        }
    }

    /// First non-hole node. `None` for an empty timeline; a non-empty
    /// timeline of only holes is a broken invariant.
    pub fn first_event(&self) -> Result<Option<NodeId>, ClientError> {
        self.scan_for_event(self.head, true)
    }

    /// Last non-hole node, mirror of [`Self::first_event`].
    pub fn last_event(&self) -> Result<Option<NodeId>, ClientError> {
        self.scan_for_event(self.tail, false)
    }

    fn scan_for_event(
        &self,
        start: Option<NodeId>,
        forward: bool,
    ) -> Result<Option<NodeId>, ClientError> {
        if start.is_none() {
            return Ok(None);
        }
        let mut cursor = start;
        while let Some(id) = cursor {
            let node = self.node(id)?;
            if matches!(node.point, Point::Event(_)) {
                return Ok(Some(id));
            }
            cursor = if forward { node.next } else { node.prev };
        }
        Err(ClientError::internal("timeline contains only holes"))
    }

    /// Append an event point at the tail.
    pub fn append_event(&mut self, event: EventWithState) -> Result<NodeId, ClientError> {
        let id = self.alloc(Point::Event(event));
        let old_tail = self.tail;
        match old_tail {
            Some(tail) => {
                self.node_mut(tail)?.next = Some(id);
                self.node_mut(id)?.prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        Ok(id)
    }

    /// Append a hole at the tail, merging into a trailing hole if present.
    pub fn append_hole(
        &mut self,
        from: Option<String>,
        to: Option<String>,
    ) -> Result<(), ClientError> {
        if let Some(tail) = self.tail
            && let Point::Hole { to: tail_to, .. } = &mut self.node_mut(tail)?.point
        {
            // The trailing hole already starts earlier; extend its end.
            *tail_to = to;
            return Ok(());
        }

        let id = self.alloc(Point::Hole { from, to });
        let old_tail = self.tail;
        match old_tail {
            Some(tail) => {
                self.node_mut(tail)?.next = Some(id);
                self.node_mut(id)?.prev = Some(tail);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        Ok(())
    }

    /// Unlink and drop a node, merging holes that become adjacent.
    /// Removing an unknown node is a no-op.
    pub fn remove(&mut self, id: NodeId) -> Result<(), ClientError> {
        let Some(node) = self.nodes.remove(&id) else {
            return Ok(());
        };
        let (prev, next) = (node.prev, node.next);
        self.stitch(prev, next)?;

        if let (Some(prev), Some(next)) = (prev, next) {
            let prev_is_hole = matches!(self.node(prev)?.point, Point::Hole { .. });
            let next_is_hole = matches!(self.node(next)?.point, Point::Hole { .. });
            if prev_is_hole && next_is_hole {
                self.merge_hole_pair(prev, next)?;
            }
        }
        Ok(())
    }

    /// Combine two now-adjacent holes into the left one.
    fn merge_hole_pair(&mut self, left: NodeId, right: NodeId) -> Result<(), ClientError> {
        let Some(right_node) = self.nodes.remove(&right) else {
            return Ok(());
        };
        let Point::Hole { to: right_to, .. } = right_node.point else {
            return Err(ClientError::internal("hole merge against an event node"));
        };
        self.stitch(right_node.prev, right_node.next)?;

        match &mut self.node_mut(left)?.point {
            Point::Hole { to, .. } => *to = right_to,
            Point::Event(_) => {
                return Err(ClientError::internal("hole merge against an event node"));
            }
        }
        Ok(())
    }

    fn stitch(&mut self, prev: Option<NodeId>, next: Option<NodeId>) -> Result<(), ClientError> {
        match prev {
            Some(prev) => self.node_mut(prev)?.next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next)?.prev = prev,
            None => self.tail = prev,
        }
        Ok(())
    }

    /// Replace a hole with the given points, left to right. Returns the
    /// inserted node ids in the same order.
    pub fn splice(
        &mut self,
        hole: NodeId,
        points: Vec<Point>,
    ) -> Result<Vec<NodeId>, ClientError> {
        {
            let node = self.node(hole)?;
            if !matches!(node.point, Point::Hole { .. }) {
                return Err(ClientError::internal("splice target is not a hole"));
            }
        }
        let Some(node) = self.nodes.remove(&hole) else {
            return Err(ClientError::internal("timeline node missing"));
        };
        let (prev, next) = (node.prev, node.next);

        let mut inserted = Vec::with_capacity(points.len());
        let mut cursor = prev;
        for point in points {
            let id = self.alloc(point);
            match cursor {
                Some(cursor) => self.node_mut(cursor)?.next = Some(id),
                None => self.head = Some(id),
            }
            self.node_mut(id)?.prev = cursor;
            cursor = Some(id);
            inserted.push(id);
        }

        match cursor {
            Some(cursor) => self.node_mut(cursor)?.next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next)?.prev = cursor,
            None => self.tail = cursor,
        }
        Ok(inserted)
    }

    /// Rewrite an event in place as redacted, preserving node identity and
    /// position. Returns whether the node was an event.
    pub fn redact(&mut self, id: NodeId, because: ClientEvent) -> Result<bool, ClientError> {
        match self.nodes.get_mut(&id) {
            Some(Node {
                point: Point::Event(with_state),
                ..
            }) => {
                with_state.event.event.content = None;
                with_state
                    .event
                    .unsigned
                    .get_or_insert_with(Unsigned::default)
                    .redacted_because = Some(Box::new(because));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Snapshot of the point sequence for rendering and assertions.
    pub fn entries(&self) -> Result<Vec<TimelineEntry>, ClientError> {
        let mut entries = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let node = self.node(id)?;
            entries.push(match &node.point {
                Point::Event(event) => TimelineEntry::Event(event.clone()),
                Point::Hole { from, to } => TimelineEntry::Gap {
                    from: from.clone(),
                    to: to.clone(),
                },
            });
            cursor = node.next;
        }
        Ok(entries)
    }
}
