//! Service registration and sessions.
//!
//! A service is a named table of request handlers plus a bounded session
//! pool. Handlers are plain closures keyed by the full header word — there
//! is no service class hierarchy. Requests within a session are implicitly
//! serialized because exactly one guest thread drives a session at a time;
//! handlers touching state shared across services must synchronize
//! themselves.

pub mod command;

pub use command::{make_header, BufferDescriptor, IpcRequest, IpcResponse};

use std::any::Any;
use std::collections::HashMap;

use slab::Slab;
use tracing::debug;

use crate::board::Board;
use crate::kernel::{Handle, HandleTable, Kernel, KernelObject, ThreadId};
use crate::memory::MemorySystem;
use crate::result::{ErrorLevel, ErrorModule, ErrorSummary, ResultCode};
use crate::timing::TimingScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) usize);

impl SessionId {
    /// Round-trip through a `u64`, for stashing a session in an event's
    /// `user_data`.
    pub fn from_user_data(raw: u64) -> Self {
        SessionId(raw as usize)
    }

    #[inline]
    pub fn as_user_data(self) -> u64 {
        self.0 as u64
    }
}

/// Result code for a connect attempt naming an unknown service.
pub fn err_service_not_found() -> ResultCode {
    ResultCode::new(
        100,
        ErrorModule::Srv,
        ErrorSummary::NotFound,
        ErrorLevel::Permanent,
    )
}

/// Result code for a connect attempt beyond a service's session bound.
pub fn err_out_of_sessions() -> ResultCode {
    ResultCode::new(
        101,
        ErrorModule::Srv,
        ErrorSummary::OutOfResource,
        ErrorLevel::Temporary,
    )
}

/// What the kernel does with a request once its handler returns. The
/// handler decides whether the response is written immediately or deferred
/// until the calling thread is resumed.
pub enum HandlerOutcome {
    /// Write the response before the caller runs again.
    Respond(IpcResponse),
    /// Suspend the calling thread; the command buffer location is retained
    /// and written by [`Board::complete_deferred`] when the thread wakes.
    Defer,
    /// Open a session to the named service and answer with its handle.
    /// Used by the service manager, which cannot reach the registry from
    /// inside its own handler.
    Connect(String),
}

/// Everything a handler may touch while it runs on the emulation thread.
pub struct HandlerCtx<'a> {
    pub timing: &'a mut TimingScheduler<Board>,
    pub kernel: &'a mut Kernel,
    pub memory: &'a mut MemorySystem,
    pub session: &'a mut Session,
    pub thread: ThreadId,
}

pub type IpcHandler = Box<dyn FnMut(&mut HandlerCtx<'_>, &IpcRequest) -> HandlerOutcome + Send>;

pub struct HandlerEntry {
    pub header_code: u32,
    pub normal_params: usize,
    pub buffer_count: usize,
    pub(crate) handler: IpcHandler,
}

impl HandlerEntry {
    /// A table entry for `header_code`. The header must encode the same
    /// shape the entry declares; a mismatch is a host configuration bug.
    pub fn new(
        header_code: u32,
        normal_params: usize,
        buffer_count: usize,
        handler: impl FnMut(&mut HandlerCtx<'_>, &IpcRequest) -> HandlerOutcome + Send + 'static,
    ) -> Self {
        assert_eq!(
            command::header_normal_count(header_code),
            normal_params,
            "header {header_code:#010X} does not declare {normal_params} normal params"
        );
        assert_eq!(
            command::header_buffer_words(header_code),
            2 * buffer_count,
            "header {header_code:#010X} does not declare {buffer_count} buffers"
        );
        Self {
            header_code,
            normal_params,
            buffer_count,
            handler: Box::new(handler),
        }
    }
}

pub struct Service {
    pub name: String,
    pub max_sessions: usize,
    pub(crate) live_sessions: usize,
    pub(crate) handlers: HashMap<u32, HandlerEntry>,
}

/// One bound channel between a client and a service.
pub struct Session {
    pub id: SessionId,
    pub handle: Handle,
    pub service: ServiceId,
    /// Handler-defined per-session state.
    pub data: Option<Box<dyn Any + Send>>,
    /// Set while a request on this session has its response deferred.
    pub(crate) pending: Option<PendingRequest>,
}

impl Session {
    /// Whether a request on this session is awaiting a deferred response.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn set_pending(&mut self, thread: ThreadId, header: u32) {
        self.pending = Some(PendingRequest { thread, header });
    }

    pub(crate) fn take_pending(&mut self) -> Option<PendingRequest> {
        self.pending.take()
    }
}

pub(crate) struct PendingRequest {
    pub thread: ThreadId,
    pub header: u32,
}

#[derive(Default)]
pub struct ServiceRegistry {
    pub(crate) services: Vec<Service>,
    pub(crate) sessions: Slab<Session>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under `name` with a bounded session pool and its
    /// handler table. Registering the same name twice is a host bug.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        max_sessions: usize,
        entries: Vec<HandlerEntry>,
    ) -> ServiceId {
        let name = name.into();
        assert!(
            !self.services.iter().any(|s| s.name == name),
            "service {name:?} registered twice"
        );
        debug!(%name, max_sessions, handlers = entries.len(), "registered service");
        let handlers = entries
            .into_iter()
            .map(|e| (e.header_code, e))
            .collect();
        self.services.push(Service {
            name,
            max_sessions,
            live_sessions: 0,
            handlers,
        });
        ServiceId(self.services.len() - 1)
    }

    /// Open a session to `name`. Fails explicitly when the service does not
    /// exist or its session pool is exhausted — never queues.
    pub fn connect(&mut self, name: &str, handles: &mut HandleTable) -> Result<Handle, ResultCode> {
        let (sid, service) = self
            .services
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .ok_or_else(err_service_not_found)?;
        if service.live_sessions >= service.max_sessions {
            return Err(err_out_of_sessions());
        }
        service.live_sessions += 1;

        let entry = self.sessions.vacant_entry();
        let id = SessionId(entry.key());
        let handle = handles.insert(KernelObject::Session {
            service: ServiceId(sid),
            session: id,
        });
        entry.insert(Session {
            id,
            handle,
            service: ServiceId(sid),
            data: None,
            pending: None,
        });
        Ok(handle)
    }

    /// Close the session behind `handle`, releasing its pool slot.
    pub fn close(&mut self, handle: Handle, handles: &mut HandleTable) -> bool {
        let Some(KernelObject::Session { service, session }) = handles.remove(handle) else {
            return false;
        };
        self.sessions.remove(session.0);
        self.services[service.0].live_sessions -= 1;
        true
    }

    pub fn service(&self, id: ServiceId) -> &Service {
        &self.services[id.0]
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id.0)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(header: u32) -> HandlerEntry {
        HandlerEntry::new(
            header,
            command::header_normal_count(header),
            command::header_buffer_words(header) / 2,
            |_, _| HandlerOutcome::Respond(IpcResponse::success([])),
        )
    }

    #[test]
    fn connect_respects_the_session_bound() {
        let mut registry = ServiceRegistry::new();
        let mut handles = HandleTable::new();
        registry.register("app:test", 2, vec![noop_entry(make_header(1, 0, 0))]);

        let a = registry
            .connect("app:test", &mut handles)
            .unwrap();
        let _b = registry
            .connect("app:test", &mut handles)
            .unwrap();
        let err = registry
            .connect("app:test", &mut handles)
            .unwrap_err();
        assert_eq!(err, err_out_of_sessions());

        // Closing a session frees its slot.
        assert!(registry.close(a, &mut handles));
        registry
            .connect("app:test", &mut handles)
            .unwrap();
    }

    #[test]
    fn connecting_to_an_unknown_service_fails() {
        let mut registry = ServiceRegistry::new();
        let mut handles = HandleTable::new();
        let err = registry
            .connect("missing", &mut handles)
            .unwrap_err();
        assert_eq!(err, err_service_not_found());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_service_names_are_a_host_bug() {
        let mut registry = ServiceRegistry::new();
        registry.register("dup", 1, vec![]);
        registry.register("dup", 1, vec![]);
    }

    #[test]
    #[should_panic(expected = "normal params")]
    fn entry_shape_must_match_its_header() {
        HandlerEntry::new(make_header(1, 2, 0), 3, 0, |_, _| {
            HandlerOutcome::Respond(IpcResponse::success([]))
        });
    }
}
