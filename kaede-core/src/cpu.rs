//! The CPU interpreter seam.
//!
//! Guest instruction execution is an external collaborator; the kernel only
//! needs to hand it bounded slices and learn why each slice ended. A
//! backend reads and writes guest state through the [`Board`] it is given.

use thiserror::Error;

use crate::board::Board;
use crate::kernel::Handle;
use crate::types::Cycles;

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("invalid instruction at {addr:#010X}")]
    InvalidInstruction { addr: u32 },

    #[error("memory fault at {addr:#010X}")]
    MemoryFault { addr: u32 },
}

/// Why an execution slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExit {
    /// Slice budget exhausted or the thread voluntarily yielded.
    Yield,
    /// The running thread trapped into the kernel with a synchronous IPC
    /// request on `handle`; its command buffer holds the request.
    SyncRequest { handle: Handle },
    /// The running thread asked for a thread switch; the kernel should
    /// reschedule before the next slice.
    SwitchThread,
    /// The running thread terminated.
    Exit,
}

/// Outcome of one execution slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub cycles: Cycles,
    pub exit: SliceExit,
}

pub trait CpuBackend: Send {
    /// Execute up to `max_cycles` of the current guest thread.
    fn run(&mut self, board: &mut Board, max_cycles: Cycles) -> Result<Slice, CpuError>;

    /// Tell the backend to end its current slice early so the kernel can
    /// reschedule.
    fn prepare_reschedule(&mut self);
}

/// A backend that executes nothing: every slice burns its full budget and
/// yields. Stands in for a real interpreter in the headless shell and in
/// tests.
#[derive(Default)]
pub struct NullCpu;

impl CpuBackend for NullCpu {
    fn run(&mut self, _board: &mut Board, max_cycles: Cycles) -> Result<Slice, CpuError> {
        Ok(Slice {
            cycles: max_cycles,
            exit: SliceExit::Yield,
        })
    }

    fn prepare_reschedule(&mut self) {}
}
