//! Cooperative guest threads.
//!
//! A single guest thread executes at any instant; switches happen only at
//! defined yield points (end of slice, IPC suspension, scheduler-driven
//! reschedule). The manager keeps a round-robin ready queue — priorities
//! are not modelled.

use std::collections::VecDeque;

use slab::Slab;
use tracing::trace;

use crate::types::PAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    pub fn from_raw(raw: usize) -> Self {
        ThreadId(raw)
    }

    #[inline]
    pub fn as_raw(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// Suspended inside a synchronous IPC request; the response write is
    /// deferred until the thread is woken.
    WaitIpc,
    Dormant,
}

#[derive(Debug)]
pub struct GuestThread {
    pub name: String,
    pub state: ThreadState,
    pub entry: PAddr,
    /// Start of this thread's TLS block; the IPC command buffer lives at a
    /// fixed offset inside it.
    pub tls_addr: PAddr,
}

#[derive(Default)]
pub struct ThreadManager {
    threads: Slab<GuestThread>,
    ready: VecDeque<ThreadId>,
    current: Option<ThreadId>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, name: impl Into<String>, entry: PAddr, tls_addr: PAddr) -> ThreadId {
        let name = name.into();
        let id = ThreadId(self.threads.insert(GuestThread {
            name,
            state: ThreadState::Ready,
            entry,
            tls_addr,
        }));
        trace!(?id, "spawned guest thread");
        self.ready.push_back(id);
        id
    }

    #[inline]
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn get(&self, id: ThreadId) -> &GuestThread {
        &self.threads[id.0]
    }

    pub fn get_mut(&mut self, id: ThreadId) -> &mut GuestThread {
        &mut self.threads[id.0]
    }

    /// Whether any thread could run right now.
    pub fn has_runnable(&self) -> bool {
        self.current.is_some() || !self.ready.is_empty()
    }

    /// Round-robin switch: the current thread (if still running) goes to
    /// the back of the ready queue and the next ready thread takes over.
    pub fn reschedule(&mut self) {
        if let Some(cur) = self.current.take() {
            if self.threads[cur.0].state == ThreadState::Running {
                self.threads[cur.0].state = ThreadState::Ready;
                self.ready.push_back(cur);
            }
        }
        while let Some(next) = self.ready.pop_front() {
            if self.threads[next.0].state == ThreadState::Ready {
                self.threads[next.0].state = ThreadState::Running;
                self.current = Some(next);
                trace!(?next, "switched to guest thread");
                return;
            }
        }
    }

    /// Park `id` waiting for a deferred IPC response. If it was the
    /// current thread the CPU has nothing to run until a reschedule.
    pub fn suspend(&mut self, id: ThreadId) {
        self.threads[id.0].state = ThreadState::WaitIpc;
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Wake a thread parked in [`ThreadState::WaitIpc`].
    pub fn wake(&mut self, id: ThreadId) {
        let thread = &mut self.threads[id.0];
        if thread.state == ThreadState::WaitIpc {
            thread.state = ThreadState::Ready;
            self.ready.push_back(id);
        }
    }

    /// Terminate the current thread.
    pub fn exit_current(&mut self) {
        if let Some(cur) = self.current.take() {
            self.threads[cur.0].state = ThreadState::Dormant;
            trace!(?cur, "guest thread exited");
        }
    }
}
