//! This crate implements the core of the kaede emulator
//!
//! This mostly includes the HLE kernel: virtual-time scheduling, the
//! physical memory region allocator, the cooperative run loop and the
//! synchronous service IPC framework. Presentation, input and the CPU
//! interpreter are collaborators behind traits; see [`board::OutputSink`]
//! and [`cpu::CpuBackend`].

#![allow(clippy::uninlined_format_args)]

pub mod board;
pub mod cpu;
pub mod error;
pub mod invoke;
pub mod kernel;
pub mod loader;
pub mod memory;
pub mod result;
pub mod service;
pub mod system;
pub mod timing;
pub mod types;

// re-export the session surface for convenience
pub use board::{Board, HardwareTick, OutputSink};
pub use error::{BringUpError, CoreError};
pub use invoke::{HostInvoker, InvokeError};
pub use result::ResultCode;
pub use system::{Frontend, RunState, StepOutcome, System, SystemController};
