//! The emulation session: bring-up, the run loop and its controller.
//!
//! One [`System`] value owns an entire session — there is no global
//! state. Exactly one host thread (the emulation thread) calls
//! [`System::run_loop`] and is the sole writer of kernel state; a
//! controller thread starts and stops it through [`SystemController`],
//! and background work marshals in through [`HostInvoker`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::board::{Board, OutputSink};
use crate::cpu::{CpuBackend, SliceExit};
use crate::error::{BringUpError, CoreError};
use crate::invoke::{host_call_channel, HostCall, HostInvoker};
use crate::kernel::{Handle, Kernel, KernelObject};
use crate::loader::{self, GuestImage};
use crate::memory::MemorySystem;
use crate::result::ResultCode;
use crate::service::{make_header, HandlerEntry, HandlerOutcome, ServiceId, ServiceRegistry};
use crate::timing::{EventType, TimingScheduler};
use crate::types::{Cycles, FRAME_INTERVAL, MAX_SLICE_CYCLES};

/// Lifecycle of an emulation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunState {
    NotInitialized,
    Stopped,
    Running,
    Idling,
    ShuttingDown,
    Terminated,
}

/// What one `run_loop` step reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// A shutdown was requested since the last step. Reported exactly once
    /// per request; the caller is responsible for tearing the session down.
    ShutdownRequested,
}

struct ControlState {
    running: Mutex<bool>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl ControlState {
    fn new() -> Self {
        Self {
            running: Mutex::new(false),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }

    /// Block until the controller sets the running flag (or a shutdown is
    /// requested, which must also wake a paused loop).
    fn wait_while_paused(&self) {
        let mut running = self.running.lock();
        while !*running && !self.shutdown.load(Ordering::Acquire) {
            self.wake.wait(&mut running);
        }
    }
}

/// Cloneable handle used by the controller thread to start/stop the
/// session and request shutdown. Stopping is cooperative: it is observed
/// once per step and never preempts an in-flight step.
#[derive(Clone)]
pub struct SystemController {
    control: Arc<ControlState>,
}

impl SystemController {
    pub fn set_running(&self, running: bool) {
        *self.control.running.lock() = running;
        self.control.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Ask the emulation thread to stop. The very next `run_loop` call
    /// reports [`StepOutcome::ShutdownRequested`], exactly once.
    pub fn request_shutdown(&self) {
        self.control.shutdown.store(true, Ordering::Release);
        self.control.wake.notify_all();
    }
}

/// The windowing/GUI side of the emulator. Only bring-up hooks live here;
/// everything else about presentation goes through [`OutputSink`].
pub trait Frontend {
    fn create_output(&mut self) -> Result<Box<dyn OutputSink>, String>;
}

pub struct System {
    timing: TimingScheduler<Board>,
    board: Board,
    cpu: Box<dyn CpuBackend>,
    control: Arc<ControlState>,
    invoker: HostInvoker,
    host_calls: Receiver<HostCall>,
    run_state: RunState,
    reschedule_pending: bool,
    title: String,
}

impl System {
    /// Bring up a session for the guest image at `path`.
    ///
    /// Subsystems are constructed in dependency order (timing → memory →
    /// kernel objects → services → output); a failure at any stage returns
    /// a typed error and drops the already-built stages in reverse order,
    /// so no partially-initialized session is ever observable.
    pub fn load(
        frontend: &mut dyn Frontend,
        path: &Path,
        cpu: Box<dyn CpuBackend>,
    ) -> Result<System, BringUpError> {
        let image = loader::load_image(path)?;
        Self::assemble(frontend, image, cpu)
    }

    fn assemble(
        frontend: &mut dyn Frontend,
        image: GuestImage,
        cpu: Box<dyn CpuBackend>,
    ) -> Result<System, BringUpError> {
        let mut timing = TimingScheduler::new();
        let memory = MemorySystem::new(image.mode);
        let kernel = Kernel::new();

        let mut services = ServiceRegistry::new();
        register_service_manager(&mut services);

        let output = frontend.create_output().map_err(BringUpError::OutputInit)?;
        let mut board = Board::new(memory, kernel, services, output);

        // Map the code segment at the bottom of the Program region and
        // start the main thread at the image's entry point.
        let code_size = image.header.code_size;
        let code_base = board
            .memory
            .program
            .linear_allocate(code_size)
            .ok_or_else(|| {
                BringUpError::KernelInit("program region cannot hold the code segment".into())
            })?;
        board.memory.write_bytes(code_base, &image.code);
        let entry = code_base + image.header.entry_offset;
        let main = board
            .kernel
            .spawn_thread(&mut board.memory, "main", entry)
            .map_err(|code| {
                BringUpError::KernelInit(format!("main thread creation failed: {code:?}"))
            })?;
        board.kernel.handles.insert(KernelObject::Thread(main));

        board.frame_event = Some(Board::install_frame_event(&mut timing));

        let title = image.header.title_str();
        info!(%title, "session ready");

        let (invoker, host_calls) = host_call_channel();
        Ok(System {
            timing,
            board,
            cpu,
            control: Arc::new(ControlState::new()),
            invoker,
            host_calls,
            run_state: RunState::Stopped,
            reschedule_pending: true,
            title,
        })
    }

    #[inline]
    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    #[inline]
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    pub fn timing(&self) -> &TimingScheduler<Board> {
        &self.timing
    }

    pub fn controller(&self) -> SystemController {
        SystemController {
            control: self.control.clone(),
        }
    }

    pub fn host_invoker(&self) -> HostInvoker {
        self.invoker.clone()
    }

    /// Swap or inspect the CPU interpreter collaborator. The shell wires a
    /// real interpreter in after bring-up; tests install scripted ones.
    pub fn cpu_backend_mut(&mut self) -> &mut Box<dyn CpuBackend> {
        &mut self.cpu
    }

    /// See [`SystemController::request_shutdown`]; callable from any
    /// thread holding a controller, and from the emulation thread itself.
    pub fn request_shutdown(&self) {
        self.control.shutdown.store(true, Ordering::Release);
        self.control.wake.notify_all();
    }

    // -- Timing surface -----------------------------------------------------

    pub fn register_event(
        &mut self,
        name: impl Into<String>,
        callback: impl FnMut(&mut TimingScheduler<Board>, &mut Board, u64, Cycles) + Send + 'static,
    ) -> EventType {
        self.timing.register_event(name, callback)
    }

    pub fn schedule_event(&mut self, ty: EventType, delay: Cycles, user_data: u64) {
        self.timing.schedule_event(ty, delay, user_data);
    }

    pub fn unschedule_event(&mut self, ty: EventType, user_data: u64) {
        self.timing.unschedule_event(ty, user_data);
    }

    // -- Service surface ----------------------------------------------------

    /// Register a host-implemented service.
    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        max_sessions: usize,
        handlers: Vec<HandlerEntry>,
    ) -> ServiceId {
        self.board.services.register(name, max_sessions, handlers)
    }

    /// Host-side connect, bypassing the service manager IPC path.
    pub fn connect_service(&mut self, name: &str) -> Result<Handle, ResultCode> {
        self.board
            .services
            .connect(name, &mut self.board.kernel.handles)
    }

    // -- The run loop -------------------------------------------------------

    /// Perform exactly one emulation step.
    ///
    /// Errors are surfaced without changing the run state; the caller
    /// decides whether to keep stepping.
    pub fn run_loop(&mut self) -> Result<StepOutcome, CoreError> {
        self.drain_host_calls();

        // Block until the controller lets the session run. A shutdown
        // request must get through even while paused.
        if !self.control.is_running() && !self.control.shutdown.load(Ordering::Acquire) {
            self.run_state = RunState::Stopped;
            self.control.wait_while_paused();
        }

        // One-shot shutdown: the swap clears the flag, so it is reported
        // exactly once per request.
        if self.control.shutdown.swap(false, Ordering::AcqRel) {
            debug!("shutdown requested");
            self.run_state = RunState::ShuttingDown;
            return Ok(StepOutcome::ShutdownRequested);
        }

        // The output collaborator cannot take frames right now: show a
        // blank frame, throttle for one frame interval, skip guest code.
        if !self.board.output.is_output_allowed() {
            self.board.present_frame();
            thread::sleep(FRAME_INTERVAL);
            return Ok(StepOutcome::Continue);
        }

        // Nothing to run: jump virtual time to the next event so the
        // machine keeps making progress, then pay out due events.
        if !self.board.kernel.threads.has_runnable() {
            self.run_state = RunState::Idling;
            self.timing.idle();
            self.timing.advance(&mut self.board);
            self.reschedule_pending = true;
            return Ok(StepOutcome::Continue);
        }

        self.run_state = RunState::Running;
        if self.reschedule_pending || self.board.kernel.threads.current().is_none() {
            self.reschedule_pending = false;
            self.cpu.prepare_reschedule();
            self.board.kernel.threads.reschedule();
        }

        self.timing.advance(&mut self.board);

        let budget = self
            .timing
            .cycles_until_next_event()
            .unwrap_or(MAX_SLICE_CYCLES)
            .clamp(1, MAX_SLICE_CYCLES);
        let slice = self.cpu.run(&mut self.board, budget)?;
        self.timing.add_ticks(slice.cycles);
        self.board.tick_hardware(slice.cycles);

        match slice.exit {
            SliceExit::Yield => {}
            SliceExit::SwitchThread => self.reschedule_pending = true,
            SliceExit::SyncRequest { handle } => {
                let thread = self
                    .board
                    .kernel
                    .threads
                    .current()
                    .expect("a running thread issued the request");
                self.board.dispatch(&mut self.timing, handle, thread);
                if self.board.kernel.threads.current().is_none() {
                    // The handler deferred and suspended the caller.
                    self.reschedule_pending = true;
                }
            }
            SliceExit::Exit => {
                self.board.kernel.threads.exit_current();
                self.reschedule_pending = true;
            }
        }

        Ok(StepOutcome::Continue)
    }

    /// Tear the session down after a shutdown request was observed.
    /// Subsystems drop in reverse construction order.
    pub fn shutdown(&mut self) {
        info!(frames = self.board.frames_presented(), "session terminated");
        self.run_state = RunState::Terminated;
    }

    fn drain_host_calls(&mut self) {
        while let Ok(call) = self.host_calls.try_recv() {
            (call.run)(self);
        }
    }
}

/// The `srv:` service manager: guest code asks it for service handles by
/// name. Registered at bring-up before any title code runs.
fn register_service_manager(services: &mut ServiceRegistry) {
    const GET_SERVICE_HANDLE: u32 = make_header(0x5, 4, 0);

    services.register(
        "srv:",
        64,
        vec![HandlerEntry::new(GET_SERVICE_HANDLE, 4, 0, |_ctx, req| {
            // Service name: 8 NUL-padded bytes in two words, then a length.
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&req.params[0].to_le_bytes());
            bytes[4..].copy_from_slice(&req.params[1].to_le_bytes());
            let len = (req.params[2] as usize).min(8);
            let name = String::from_utf8_lossy(&bytes[..len]).into_owned();
            HandlerOutcome::Connect(name)
        })],
    );
}
