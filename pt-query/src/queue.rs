//! Bounded per-binding event ring, ported from `pt_enqueue_event` /
//! `pt_dequeue_event` / `pt_discard_events` / `pt_find_event` /
//! `pt_queue_inc` in `original_source/libipt/src/pt_state.c`.
//!
//! One slot is always left empty so `begin == end` unambiguously means
//! "empty": a full ring has `capacity - 1` usable slots. libipt sizes
//! `ev_pend` per-binding at a small fixed array; spec §3/§9 asks for
//! capacity `>= 9` (8 usable slots).

use pt_error::ErrorKind;

use crate::event::{Binding, Event, EventKind};

/// Total ring slots per binding (one slot is a permanent gap).
const CAPACITY: usize = 9;

fn queue_inc(idx: usize) -> usize {
    (idx + 1) % CAPACITY
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    event: Option<Event>,
}

impl Default for Slot {
    fn default() -> Self {
        Self { event: None }
    }
}

/// One ring per [`Binding`].
pub struct EventQueues {
    rings: [[Slot; CAPACITY]; Binding::COUNT],
    begin: [usize; Binding::COUNT],
    end: [usize; Binding::COUNT],
    /// The most recently dequeued event per binding, kept for
    /// introspection even after the slot it occupied is reused.
    last_dequeued: [Option<Event>; Binding::COUNT],
}

impl Default for EventQueues {
    fn default() -> Self {
        Self {
            rings: [[Slot::default(); CAPACITY]; Binding::COUNT],
            begin: [0; Binding::COUNT],
            end: [0; Binding::COUNT],
            last_dequeued: [None; Binding::COUNT],
        }
    }
}

impl EventQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot in `binding`'s ring and fill it with `kind`.
    ///
    /// # Errors
    /// [`ErrorKind::NoMem`] if the ring is full (the reserved gap slot
    /// would be overwritten, which would make a full ring
    /// indistinguishable from an empty one).
    pub fn enqueue(&mut self, binding: Binding, kind: EventKind) -> Result<&mut Event, ErrorKind> {
        let i = binding.index();
        let end = self.end[i];
        let next_end = queue_inc(end);
        if self.begin[i] == next_end {
            return Err(ErrorKind::NoMem);
        }
        self.rings[i][end].event = Some(Event::new(kind));
        self.end[i] = next_end;
        Ok(self.rings[i][end].event.as_mut().expect("just inserted"))
    }

    /// Pop the head event of `binding`'s ring, if any.
    pub fn dequeue(&mut self, binding: Binding) -> Option<Event> {
        let i = binding.index();
        if self.begin[i] == self.end[i] {
            return None;
        }
        let event = self.rings[i][self.begin[i]].event.take();
        self.begin[i] = queue_inc(self.begin[i]);
        if event.is_some() {
            self.last_dequeued[i] = event;
        }
        event
    }

    /// Reset `binding`'s ring to empty without dequeuing.
    pub fn discard(&mut self, binding: Binding) {
        let i = binding.index();
        self.begin[i] = 0;
        self.end[i] = 0;
    }

    /// Whether `binding`'s ring has at least one pending event.
    #[must_use]
    pub fn is_pending(&self, binding: Binding) -> bool {
        let i = binding.index();
        self.begin[i] != self.end[i]
    }

    /// The last event dequeued from `binding`'s ring, for diagnostics.
    #[must_use]
    pub fn last_dequeued(&self, binding: Binding) -> Option<&Event> {
        self.last_dequeued[binding.index()].as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_within_a_binding() {
        let mut q = EventQueues::new();
        q.enqueue(Binding::Tip, EventKind::Enabled { ip: 1 }).unwrap();
        q.enqueue(Binding::Tip, EventKind::Enabled { ip: 2 }).unwrap();
        let first = q.dequeue(Binding::Tip).unwrap();
        let second = q.dequeue(Binding::Tip).unwrap();
        assert_eq!(first.kind, EventKind::Enabled { ip: 1 });
        assert_eq!(second.kind, EventKind::Enabled { ip: 2 });
        assert!(q.dequeue(Binding::Tip).is_none());
    }

    #[test]
    fn bindings_are_independent() {
        let mut q = EventQueues::new();
        q.enqueue(Binding::Fup, EventKind::Overflow { ip: 0 }).unwrap();
        assert!(q.is_pending(Binding::Fup));
        assert!(!q.is_pending(Binding::Tip));
    }

    #[test]
    fn ring_rejects_enqueue_past_capacity() {
        let mut q = EventQueues::new();
        let mut count = 0;
        while q.enqueue(Binding::Now, EventKind::Overflow { ip: 0 }).is_ok() {
            count += 1;
        }
        assert_eq!(count, CAPACITY - 1);
    }

    #[test]
    fn discard_clears_without_dequeue_history() {
        let mut q = EventQueues::new();
        q.enqueue(Binding::Psbend, EventKind::Overflow { ip: 0 }).unwrap();
        q.discard(Binding::Psbend);
        assert!(!q.is_pending(Binding::Psbend));
        assert!(q.dequeue(Binding::Psbend).is_none());
    }

    #[test]
    fn last_dequeued_survives_slot_reuse() {
        let mut q = EventQueues::new();
        q.enqueue(Binding::Now, EventKind::Overflow { ip: 7 }).unwrap();
        q.dequeue(Binding::Now);
        q.enqueue(Binding::Now, EventKind::Overflow { ip: 8 }).unwrap();
        q.dequeue(Binding::Now);
        assert_eq!(
            q.last_dequeued(Binding::Now).unwrap().kind,
            EventKind::Overflow { ip: 8 }
        );
    }
}
