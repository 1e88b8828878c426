//! The emulated machine state a timing callback may touch: memory, kernel,
//! services, the output collaborator and hardware tick hooks.
//!
//! Keeping all of it in one owned aggregate (instead of a global system
//! singleton) lets the scheduler hand callbacks mutable access without any
//! hidden state, and keeps the whole kernel single-writer: only the
//! emulation thread ever holds `&mut Board`.

use tracing::warn;

use crate::kernel::{Handle, Kernel, KernelObject, ThreadId};
use crate::memory::MemorySystem;
use crate::result::{ErrorLevel, ErrorModule, ErrorSummary, ResultCode};
use crate::service::{
    HandlerCtx, HandlerOutcome, IpcRequest, IpcResponse, ServiceRegistry, SessionId,
};
use crate::timing::{EventType, TimingScheduler};
use crate::types::{Cycles, FRAME_CYCLES};

/// The presentation collaborator. A "blank" frame is a [`swap_buffers`]
/// call with no guest work behind it.
///
/// [`swap_buffers`]: OutputSink::swap_buffers
pub trait OutputSink: Send {
    /// Whether the output can currently accept frames. When it cannot, the
    /// run loop presents blank frames and throttles instead of executing
    /// guest code.
    fn is_output_allowed(&self) -> bool;

    fn swap_buffers(&mut self);
}

/// A hardware-state collaborator ticked once per executed slice.
pub trait HardwareTick: Send {
    fn tick(&mut self, cycles: Cycles);
}

fn err_invalid_handle() -> ResultCode {
    ResultCode::new(
        20,
        ErrorModule::Kernel,
        ErrorSummary::WrongArgument,
        ErrorLevel::Permanent,
    )
}

pub struct Board {
    pub memory: MemorySystem,
    pub kernel: Kernel,
    pub services: ServiceRegistry,
    pub output: Box<dyn OutputSink>,
    pub hw: Vec<Box<dyn HardwareTick>>,
    /// Set right after registration so the frame callback can re-arm
    /// itself.
    pub(crate) frame_event: Option<EventType>,
    frames_presented: u64,
}

impl Board {
    pub fn new(memory: MemorySystem, kernel: Kernel, services: ServiceRegistry, output: Box<dyn OutputSink>) -> Self {
        Self {
            memory,
            kernel,
            services,
            output,
            hw: Vec::new(),
            frame_event: None,
            frames_presented: 0,
        }
    }

    #[inline]
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn present_frame(&mut self) {
        self.frames_presented += 1;
        self.output.swap_buffers();
    }

    pub fn tick_hardware(&mut self, cycles: Cycles) {
        for hw in &mut self.hw {
            hw.tick(cycles);
        }
    }

    /// Register and arm the periodic frame event. The callback presents a
    /// frame and re-schedules itself one frame ahead, compensating for how
    /// late it fired.
    pub(crate) fn install_frame_event(timing: &mut TimingScheduler<Board>) -> EventType {
        let ty = timing.register_event("frame", |sched, board: &mut Board, data, late| {
            board.present_frame();
            let ty = board.frame_event.expect("frame event installed");
            sched.schedule_event(ty, FRAME_CYCLES.saturating_sub(late).max(1), data);
        });
        timing.schedule_event(ty, FRAME_CYCLES, 0);
        ty
    }

    /// Route a synchronous IPC request from the currently running guest
    /// thread into the owning service's handler table.
    ///
    /// Unregistered headers are a soft failure: logged and answered with a
    /// benign default so unrelated guest code keeps functioning. Whether
    /// the response is written now or when the thread resumes is the
    /// handler's decision.
    pub fn dispatch(&mut self, timing: &mut TimingScheduler<Board>, handle: Handle, thread: ThreadId) {
        let words = self.kernel.read_cmd_buffer(&self.memory, thread);
        let header = words[0];

        let Some(&KernelObject::Session { service, session }) = self.kernel.handles.get(handle)
        else {
            warn!(
                handle = handle.as_raw(),
                header = %format!("{header:#010X}"),
                "sync request on a handle that is not a session"
            );
            self.write_response(thread, header, &IpcResponse::error(err_invalid_handle()));
            return;
        };

        let outcome = {
            let svc = &mut self.services.services[service.0];
            match svc.handlers.get_mut(&header) {
                None => {
                    warn!(
                        service = %svc.name,
                        header = %format!("{header:#010X}"),
                        "unimplemented IPC request"
                    );
                    None
                }
                Some(entry) => {
                    let request =
                        IpcRequest::parse(&words, entry.normal_params, entry.buffer_count);
                    let sess = self
                        .services
                        .sessions
                        .get_mut(session.0)
                        .expect("session behind a live handle");
                    // One guest thread drives a session at a time, so a
                    // request while another is pending cannot happen.
                    assert!(
                        sess.pending.is_none(),
                        "session {:?} driven by two threads at once",
                        session
                    );
                    let mut ctx = HandlerCtx {
                        timing,
                        kernel: &mut self.kernel,
                        memory: &mut self.memory,
                        session: sess,
                        thread,
                    };
                    Some((entry.handler)(&mut ctx, &request))
                }
            }
        };

        match outcome {
            None => self.write_response(thread, header, &IpcResponse::unimplemented()),
            Some(HandlerOutcome::Respond(response)) => {
                self.write_response(thread, header, &response)
            }
            Some(HandlerOutcome::Defer) => {
                self.kernel.threads.suspend(thread);
                self.services
                    .sessions
                    .get_mut(session.0)
                    .expect("session behind a live handle")
                    .set_pending(thread, header);
            }
            Some(HandlerOutcome::Connect(name)) => {
                let response = match self.services.connect(&name, &mut self.kernel.handles) {
                    Ok(handle) => IpcResponse::success([handle.as_raw()]),
                    Err(code) => IpcResponse::error(code),
                };
                self.write_response(thread, header, &response);
            }
        }
    }

    /// Finish a request whose handler chose [`HandlerOutcome::Defer`]:
    /// write the retained response location and wake the thread.
    pub fn complete_deferred(&mut self, session: SessionId, response: IpcResponse) {
        let Some(sess) = self.services.sessions.get_mut(session.0) else {
            warn!(?session, "deferred completion for a closed session");
            return;
        };
        let Some(pending) = sess.take_pending() else {
            warn!(?session, "deferred completion with no pending request");
            return;
        };
        self.write_response(pending.thread, pending.header, &response);
        self.kernel.threads.wake(pending.thread);
    }

    fn write_response(&mut self, thread: ThreadId, request_header: u32, response: &IpcResponse) {
        let words = response.encode(request_header);
        self.kernel.write_cmd_words(&mut self.memory, thread, &words);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMode;
    use crate::service::{make_header, HandlerEntry, SessionId};
    use crate::kernel::ThreadState;
    use pretty_assertions::assert_eq;

    struct SinkOutput;

    impl OutputSink for SinkOutput {
        fn is_output_allowed(&self) -> bool {
            true
        }
        fn swap_buffers(&mut self) {}
    }

    fn test_board() -> (TimingScheduler<Board>, Board, ThreadId) {
        let mut memory = MemorySystem::new(MemoryMode::Prod);
        let mut kernel = Kernel::new();
        let thread = kernel.spawn_thread(&mut memory, "main", 0).unwrap();
        kernel.threads.reschedule();
        let board = Board::new(
            memory,
            kernel,
            crate::service::ServiceRegistry::new(),
            Box::new(SinkOutput),
        );
        (TimingScheduler::new(), board, thread)
    }

    #[test]
    fn unregistered_header_gets_a_benign_default_and_execution_continues() {
        let (mut timing, mut board, thread) = test_board();
        board.services.register(
            "app:test",
            1,
            vec![HandlerEntry::new(make_header(1, 1, 0), 1, 0, |_, req| {
                HandlerOutcome::Respond(IpcResponse::success([req.params[0]]))
            })],
        );
        let handle = board
            .services
            .connect("app:test", &mut board.kernel.handles)
            .unwrap();

        // A header nothing registered: same service, different command.
        let request = [make_header(2, 1, 0), 0x1234];
        board
            .kernel
            .write_cmd_words(&mut board.memory, thread, &request);
        board.dispatch(&mut timing, handle, thread);

        let words = board.kernel.read_cmd_buffer(&board.memory, thread);
        assert_eq!(words[0], make_header(2, 1, 0));
        assert!(ResultCode(words[1]).is_success());
        // The calling thread keeps running.
        assert_eq!(board.kernel.threads.get(thread).state, ThreadState::Running);
        assert_eq!(board.kernel.threads.current(), Some(thread));
    }

    #[test]
    fn registered_handler_answers_in_place() {
        let (mut timing, mut board, thread) = test_board();
        board.services.register(
            "app:test",
            1,
            vec![HandlerEntry::new(make_header(1, 1, 0), 1, 0, |_, req| {
                HandlerOutcome::Respond(IpcResponse::success([req.params[0] + 1]))
            })],
        );
        let handle = board
            .services
            .connect("app:test", &mut board.kernel.handles)
            .unwrap();

        board
            .kernel
            .write_cmd_words(&mut board.memory, thread, &[make_header(1, 1, 0), 41]);
        board.dispatch(&mut timing, handle, thread);

        let words = board.kernel.read_cmd_buffer(&board.memory, thread);
        assert_eq!(words[0], make_header(1, 2, 0));
        assert_eq!(ResultCode(words[1]), ResultCode::SUCCESS);
        assert_eq!(words[2], 42);
    }

    #[test]
    fn deferred_response_is_written_when_the_thread_resumes() {
        let (mut timing, mut board, thread) = test_board();
        let wake = timing.register_event("ipc-wake", |_sched, board: &mut Board, data, _late| {
            board.complete_deferred(
                SessionId::from_user_data(data),
                IpcResponse::success([7]),
            );
        });
        board.services.register(
            "app:wait",
            1,
            vec![HandlerEntry::new(
                make_header(3, 0, 0),
                0,
                0,
                move |ctx, _req| {
                    let session = ctx.session.id;
                    ctx.timing.schedule_event(wake, 100, session.as_user_data());
                    HandlerOutcome::Defer
                },
            )],
        );
        let handle = board
            .services
            .connect("app:wait", &mut board.kernel.handles)
            .unwrap();

        board
            .kernel
            .write_cmd_words(&mut board.memory, thread, &[make_header(3, 0, 0)]);
        board.dispatch(&mut timing, handle, thread);

        // Suspended, and nothing has touched the response area yet.
        assert_eq!(board.kernel.threads.get(thread).state, ThreadState::WaitIpc);
        let words = board.kernel.read_cmd_buffer(&board.memory, thread);
        assert_eq!(words[0], make_header(3, 0, 0));

        timing.add_ticks(100);
        timing.advance(&mut board);

        let words = board.kernel.read_cmd_buffer(&board.memory, thread);
        assert_eq!(words[0], make_header(3, 2, 0));
        assert_eq!(ResultCode(words[1]), ResultCode::SUCCESS);
        assert_eq!(words[2], 7);
        assert_eq!(board.kernel.threads.get(thread).state, ThreadState::Ready);
    }

    #[test]
    fn sync_request_on_a_bad_handle_answers_with_an_error_code() {
        let (mut timing, mut board, thread) = test_board();
        board
            .kernel
            .write_cmd_words(&mut board.memory, thread, &[make_header(9, 0, 0)]);
        board.dispatch(&mut timing, Handle::from_raw(0xDEAD), thread);

        let words = board.kernel.read_cmd_buffer(&board.memory, thread);
        assert!(ResultCode(words[1]).is_error());
        assert_eq!(board.kernel.threads.get(thread).state, ThreadState::Running);
    }

    #[test]
    fn frame_event_rearms_itself() {
        let (mut timing, mut board, _thread) = test_board();
        board.frame_event = Some(Board::install_frame_event(&mut timing));

        timing.add_ticks(crate::types::FRAME_CYCLES * 3);
        timing.advance(&mut board);
        // Fired late once, then re-armed relative to its actual due time.
        assert!(board.frames_presented() >= 1);
        assert!(timing.cycles_until_next_event().is_some());
    }
}
