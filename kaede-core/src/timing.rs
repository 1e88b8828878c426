//! Virtual-time event scheduling.
//!
//! The emulated kernel runs against a virtual monotonic clock counted in
//! CPU cycles; wall-clock time never appears here. Subsystems register an
//! event type once at bring-up and may then schedule it any number of
//! times. [`TimingScheduler::advance`] fires everything that has come due,
//! in `(due_cycle, insertion order)` order, which makes the firing sequence
//! a pure function of the call sequence — replay and movie recording depend
//! on this.
//!
//! The scheduler is generic over the context type `C` handed to callbacks
//! so it stays free of dependencies on the rest of the kernel; the emulator
//! instantiates it with [`crate::board::Board`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::trace;

use crate::types::{Cycles, FRAME_CYCLES};

/// Identifies a registered event type. Opaque outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType(usize);

/// Callback invoked when a scheduled entry comes due.
///
/// Receives the scheduler itself (so it can re-schedule), the context, the
/// `user_data` word the entry was scheduled with, and how many cycles late
/// the entry fired.
pub type EventCallback<C> = Box<dyn FnMut(&mut TimingScheduler<C>, &mut C, u64, Cycles) + Send>;

struct EventSlot<C> {
    name: String,
    /// Taken out of the slot while its callback runs, so an event type can
    /// never fire recursively into itself.
    callback: Option<EventCallback<C>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledEvent {
    due_cycle: Cycles,
    /// Monotonic insertion counter; breaks ties among entries due at the
    /// same cycle in FIFO order.
    sequence: u64,
    ty: EventType,
    user_data: u64,
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest entry comes out first.
        (other.due_cycle, other.sequence).cmp(&(self.due_cycle, self.sequence))
    }
}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimingScheduler<C> {
    now: Cycles,
    sequence: u64,
    slots: Vec<EventSlot<C>>,
    queue: BinaryHeap<ScheduledEvent>,
}

impl<C> TimingScheduler<C> {
    pub fn new() -> Self {
        Self {
            now: 0,
            sequence: 0,
            slots: Vec::new(),
            queue: BinaryHeap::new(),
        }
    }

    /// Current virtual cycle count.
    #[inline]
    pub fn ticks(&self) -> Cycles {
        self.now
    }

    /// Advance the clock by `cycles` without firing anything. Called after
    /// a guest execution slice; the next [`advance`](Self::advance) pays
    /// out whatever came due in the meantime.
    #[inline]
    pub fn add_ticks(&mut self, cycles: Cycles) {
        self.now += cycles;
    }

    /// Register an event type. One registration per subsystem at init;
    /// the returned [`EventType`] is then used to schedule entries.
    pub fn register_event(
        &mut self,
        name: impl Into<String>,
        callback: impl FnMut(&mut TimingScheduler<C>, &mut C, u64, Cycles) + Send + 'static,
    ) -> EventType {
        let name = name.into();
        trace!(%name, "registering event type");
        self.slots.push(EventSlot {
            name,
            callback: Some(Box::new(callback)),
        });
        EventType(self.slots.len() - 1)
    }

    /// Schedule `ty` to fire `delay` cycles from now, carrying `user_data`.
    /// Entries due at the same cycle fire in the order they were scheduled.
    pub fn schedule_event(&mut self, ty: EventType, delay: Cycles, user_data: u64) {
        let due_cycle = self.now + delay;
        let sequence = self.sequence;
        self.sequence += 1;
        self.queue.push(ScheduledEvent {
            due_cycle,
            sequence,
            ty,
            user_data,
        });
    }

    /// Remove every pending entry matching `(ty, user_data)`. No-op if
    /// nothing matches, even if the entry is already due.
    pub fn unschedule_event(&mut self, ty: EventType, user_data: u64) {
        self.queue
            .retain(|e| !(e.ty == ty && e.user_data == user_data));
    }

    /// Pop and invoke every entry with `due_cycle <= now`, passing each
    /// callback how late it fired. A callback may re-schedule its own type.
    pub fn advance(&mut self, ctx: &mut C) {
        while self
            .queue
            .peek()
            .map_or(false, |e| e.due_cycle <= self.now)
        {
            let ev = self.queue.pop().expect("peek then pop");
            let Some(mut callback) = self.slots[ev.ty.0].callback.take() else {
                // The type is mid-fire; a recursive entry would livelock.
                continue;
            };
            let cycles_late = self.now - ev.due_cycle;
            trace!(
                name = %self.slots[ev.ty.0].name,
                due = ev.due_cycle,
                cycles_late,
                "firing event"
            );
            callback(self, ctx, ev.user_data, cycles_late);
            self.slots[ev.ty.0].callback = Some(callback);
        }
    }

    /// Jump the clock straight to the next pending entry's due cycle
    /// without invoking anything. Used when no guest thread is runnable so
    /// virtual time does not stall; the caller follows up with
    /// [`advance`](Self::advance).
    pub fn idle(&mut self) {
        match self.queue.peek() {
            Some(e) if e.due_cycle > self.now => self.now = e.due_cycle,
            Some(_) => {}
            // Nothing pending at all: move by one nominal frame so an idle
            // machine still makes progress.
            None => self.now += FRAME_CYCLES,
        }
    }

    /// Cycles until the next pending entry comes due, bounding the length
    /// of the next guest execution slice. `None` when the queue is empty.
    pub fn cycles_until_next_event(&self) -> Option<Cycles> {
        self.queue
            .peek()
            .map(|e| e.due_cycle.saturating_sub(self.now))
    }
}

impl<C> Default for TimingScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}
