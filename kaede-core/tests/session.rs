//! Boots a session from a real image file and drives it through the whole
//! IPC surface: service-manager lookup, an immediate reply, a deferred
//! reply completed by a timing event, the session bound, and shutdown.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use binrw::BinWrite;

use kaede_core::board::Board;
use kaede_core::cpu::{CpuBackend, CpuError, Slice, SliceExit};
use kaede_core::kernel::Handle;
use kaede_core::loader::ImageHeader;
use kaede_core::service::{make_header, HandlerEntry, HandlerOutcome, IpcResponse, SessionId};
use kaede_core::types::Cycles;
use kaede_core::{Frontend, OutputSink, ResultCode, RunState, StepOutcome, System};

const GET_SERVICE_HANDLE: u32 = make_header(0x5, 4, 0);
const TIMER_WAIT: u32 = make_header(0x1, 1, 0);

struct CountingOutput {
    frames: Arc<AtomicU64>,
}

impl OutputSink for CountingOutput {
    fn is_output_allowed(&self) -> bool {
        true
    }
    fn swap_buffers(&mut self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

struct TestFrontend {
    frames: Arc<AtomicU64>,
}

impl Frontend for TestFrontend {
    fn create_output(&mut self) -> Result<Box<dyn OutputSink>, String> {
        Ok(Box::new(CountingOutput {
            frames: self.frames.clone(),
        }))
    }
}

fn write_image(name: &str) -> Result<std::path::PathBuf> {
    let mut title = [0u8; 32];
    title[..10].copy_from_slice(b"ipc sample");
    let code = vec![0xEAu8; 256];
    let header = ImageHeader {
        version: 1,
        mem_mode: 0,
        flags: 0,
        entry_offset: 0,
        code_size: code.len() as u32,
        title,
    };

    let mut out = Cursor::new(Vec::new());
    header.write(&mut out)?;
    out.get_mut().extend_from_slice(&code);

    let path = std::env::temp_dir().join(format!("kaede-session-{}-{name}", std::process::id()));
    std::fs::write(&path, out.into_inner())?;
    Ok(path)
}

/// What the guest observed, in order.
#[derive(Debug, PartialEq, Eq)]
enum Observed {
    Connected,
    WaitCompleted(u32),
    SecondConnectRejected,
}

/// Acts as the guest program: connects to `app:timer`, waits on it, then
/// trips over the session bound.
struct GuestCpu {
    srv_handle: Handle,
    step: usize,
    log: Arc<Mutex<Vec<Observed>>>,
}

impl GuestCpu {
    fn connect_request(board: &mut Board) {
        let thread = board.kernel.threads.current().unwrap();
        let words = [
            GET_SERVICE_HANDLE,
            u32::from_le_bytes(*b"app:"),
            u32::from_le_bytes(*b"time"),
            8,
            0,
        ];
        board
            .kernel
            .write_cmd_words(&mut board.memory, thread, &words);
    }
}

impl CpuBackend for GuestCpu {
    fn run(&mut self, board: &mut Board, _max_cycles: Cycles) -> Result<Slice, CpuError> {
        let thread = board.kernel.threads.current().expect("scheduled thread");
        let response = board.kernel.read_cmd_buffer(&board.memory, thread);

        let exit = match self.step {
            0 => {
                Self::connect_request(board);
                SliceExit::SyncRequest {
                    handle: self.srv_handle,
                }
            }
            1 => {
                assert!(ResultCode(response[1]).is_success());
                self.log.lock().unwrap().push(Observed::Connected);
                let timer = Handle::from_raw(response[2]);

                board
                    .kernel
                    .write_cmd_words(&mut board.memory, thread, &[TIMER_WAIT, 5000]);
                SliceExit::SyncRequest { handle: timer }
            }
            2 => {
                // We only run again once the deferred response landed.
                assert!(ResultCode(response[1]).is_success());
                self.log
                    .lock()
                    .unwrap()
                    .push(Observed::WaitCompleted(response[2]));

                Self::connect_request(board);
                SliceExit::SyncRequest {
                    handle: self.srv_handle,
                }
            }
            3 => {
                assert!(ResultCode(response[1]).is_error());
                self.log.lock().unwrap().push(Observed::SecondConnectRejected);
                SliceExit::Exit
            }
            _ => SliceExit::Yield,
        };
        self.step += 1;
        Ok(Slice { cycles: 200, exit })
    }

    fn prepare_reschedule(&mut self) {}
}

#[test]
fn full_session_lifecycle() -> Result<()> {
    let path = write_image("lifecycle.kxe")?;
    let frames = Arc::new(AtomicU64::new(0));
    let mut frontend = TestFrontend {
        frames: frames.clone(),
    };

    let log = Arc::new(Mutex::new(Vec::new()));
    // The CPU needs the srv: handle before load; connect afterwards and
    // swap the backend in, like the shell would wire a real interpreter.
    let mut system = System::load(
        &mut frontend,
        &path,
        Box::new(kaede_core::cpu::NullCpu),
    )?;
    assert_eq!(system.title(), "ipc sample");
    assert_eq!(system.run_state(), RunState::Stopped);

    // `app:time` answers wait requests after a virtual-time delay.
    let wake = system.register_event("timer-done", |_sched, board: &mut Board, data, _late| {
        board.complete_deferred(SessionId::from_user_data(data), IpcResponse::success([99]));
    });
    system.register_service(
        "app:time",
        1,
        vec![HandlerEntry::new(TIMER_WAIT, 1, 0, move |ctx, req| {
            let delay = req.params[0] as u64;
            ctx.timing
                .schedule_event(wake, delay, ctx.session.id.as_user_data());
            HandlerOutcome::Defer
        })],
    );

    let srv_handle = system.connect_service("srv:").expect("srv: registered");
    *system.cpu_backend_mut() = Box::new(GuestCpu {
        srv_handle,
        step: 0,
        log: log.clone(),
    });

    let controller = system.controller();
    controller.set_running(true);

    for _ in 0..8 {
        assert_eq!(system.run_loop()?, StepOutcome::Continue);
    }

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            Observed::Connected,
            Observed::WaitCompleted(99),
            Observed::SecondConnectRejected,
        ]
    );
    // With the guest gone the loop idles through frame events.
    assert!(frames.load(Ordering::Relaxed) >= 1);

    // Shutdown is reported exactly once, then the flag is clear.
    controller.request_shutdown();
    assert_eq!(system.run_loop()?, StepOutcome::ShutdownRequested);
    assert_eq!(system.run_state(), RunState::ShuttingDown);
    assert_eq!(system.run_loop()?, StepOutcome::Continue);

    system.shutdown();
    assert_eq!(system.run_state(), RunState::Terminated);
    Ok(())
}
