//! Arena-backed circular work list.
//!
//! Work items link into a single circular doubly-linked list: the head is
//! the oldest item and `head.prev` the newest. Nodes live in an arena and
//! are addressed by `u32` index, so an item's identity is stable across any
//! list mutation. The frame pool occupies the first `pool_count` node
//! indices permanently; event nodes recycle through a free list.

use log::trace;

use super::frame::Frame;
use crate::sequence::FrameId;

pub(crate) const NIL: u32 = u32::MAX;

#[derive(Debug)]
pub(crate) enum WorkBody {
    Frame(Frame),
    Event(EventBody),
    Vacant { next_free: u32 },
}

#[derive(Debug)]
pub(crate) struct EventBody {
    pub(crate) id: u32,
}

#[derive(Debug)]
struct WorkNode {
    prev: u32,
    next: u32,
    effective: FrameId,
    body: WorkBody,
}

#[derive(Debug)]
pub(crate) struct WorkList {
    nodes: Vec<WorkNode>,
    head: u32,
    free: u32,
    pool_count: u32,
}

impl WorkList {
    pub fn new(pool_count: usize) -> Self {
        let nodes = (0..pool_count)
            .map(|_| WorkNode {
                prev: NIL,
                next: NIL,
                effective: FrameId::default(),
                body: WorkBody::Frame(Frame::default()),
            })
            .collect();
        Self {
            nodes,
            head: NIL,
            free: NIL,
            pool_count: pool_count as u32,
        }
    }

    pub fn pool_count(&self) -> u32 {
        self.pool_count
    }

    /// Oldest queued item.
    pub fn head(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    /// Newest queued item.
    pub fn tail(&self) -> Option<u32> {
        self.head().map(|h| self.nodes[h as usize].prev)
    }

    pub fn next(&self, index: u32) -> u32 {
        self.nodes[index as usize].next
    }

    pub fn prev(&self, index: u32) -> u32 {
        self.nodes[index as usize].prev
    }

    pub fn is_queued(&self, index: u32) -> bool {
        let node = &self.nodes[index as usize];
        node.prev != NIL && node.next != NIL
    }

    pub fn is_frame(&self, index: u32) -> bool {
        matches!(self.nodes[index as usize].body, WorkBody::Frame(_))
    }

    pub fn effective(&self, index: u32) -> FrameId {
        self.nodes[index as usize].effective
    }

    pub fn set_effective(&mut self, index: u32, id: FrameId) {
        self.nodes[index as usize].effective = id;
    }

    pub fn frame(&self, slot: u32) -> &Frame {
        match &self.nodes[slot as usize].body {
            WorkBody::Frame(frame) => frame,
            other => panic!("node {} is not a frame: {:?}", slot, other),
        }
    }

    pub fn frame_mut(&mut self, slot: u32) -> &mut Frame {
        match &mut self.nodes[slot as usize].body {
            WorkBody::Frame(frame) => frame,
            other => panic!("node {} is not a frame: {:?}", slot, other),
        }
    }

    pub fn event(&self, index: u32) -> &EventBody {
        match &self.nodes[index as usize].body {
            WorkBody::Event(event) => event,
            other => panic!("node {} is not an event: {:?}", index, other),
        }
    }

    /// Append to the tail (newest position).
    pub fn push_back(&mut self, index: u32) {
        debug_assert!(!self.is_queued(index));
        let i = index as usize;
        if self.head == NIL {
            self.head = index;
            self.nodes[i].prev = index;
            self.nodes[i].next = index;
            return;
        }
        let head = self.head as usize;
        let tail = self.nodes[head].prev;
        self.nodes[tail as usize].next = index;
        self.nodes[i].prev = tail;
        self.nodes[i].next = self.head;
        self.nodes[head].prev = index;
    }

    /// Remove any queued node, advancing the head if the head was removed.
    pub fn unlink(&mut self, index: u32) {
        debug_assert!(self.is_queued(index));
        debug_assert!(self.head != NIL);
        let i = index as usize;
        let prev = self.nodes[i].prev;
        let next = self.nodes[i].next;
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        self.nodes[i].prev = NIL;
        self.nodes[i].next = NIL;
        if self.head == index {
            self.head = if next == index { NIL } else { next };
        }
    }

    /// Allocate an event node outside the list; `push_back` links it.
    pub fn alloc_event(&mut self, id: u32, effective: FrameId) -> u32 {
        if self.free != NIL {
            let index = self.free;
            let node = &mut self.nodes[index as usize];
            self.free = match node.body {
                WorkBody::Vacant { next_free } => next_free,
                ref other => panic!("free list node {} not vacant: {:?}", index, other),
            };
            node.effective = effective;
            node.body = WorkBody::Event(EventBody { id });
            index
        } else {
            let index = self.nodes.len() as u32;
            self.nodes.push(WorkNode {
                prev: NIL,
                next: NIL,
                effective,
                body: WorkBody::Event(EventBody { id }),
            });
            trace!("work list grew to {} nodes", self.nodes.len());
            index
        }
    }

    /// Recycle a consumed, unlinked event node.
    pub fn free_event(&mut self, index: u32) {
        debug_assert!(!self.is_queued(index));
        debug_assert!(index >= self.pool_count);
        let node = &mut self.nodes[index as usize];
        debug_assert!(matches!(node.body, WorkBody::Event(_)));
        node.body = WorkBody::Vacant {
            next_free: self.free,
        };
        self.free = index;
    }
}
