//! Error taxonomy.
//!
//! Bring-up failures and run-loop faults are typed values reported upward;
//! guest-visible failures travel as [`crate::result::ResultCode`] data;
//! host invariant violations (double frees, impossible command shapes)
//! panic and halt the run loop instead of corrupting state.

use std::path::PathBuf;

use thiserror::Error;

use crate::cpu::CpuError;

/// One enumerator per subsystem that can fail during session bring-up.
/// On any of these the session is left uninitialized; previously
/// constructed subsystems unwind in reverse order.
#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("guest image not found: {0}")]
    ImageNotFound(PathBuf),

    #[error("failed to read guest image: {0}")]
    ImageRead(#[from] std::io::Error),

    #[error("invalid guest image: {0}")]
    InvalidFormat(String),

    #[error("guest image is encrypted; decrypt it before loading")]
    EncryptedImage,

    #[error("guest image requests unknown memory layout mode {0:#04X}")]
    MemoryModeInvalid(u8),

    #[error("output initialisation failed: {0}")]
    OutputInit(String),

    #[error("kernel bring-up failed: {0}")]
    KernelInit(String),
}

/// Faults surfaced by a single run-loop step. The caller decides whether
/// to keep stepping; the run state is not changed on its behalf.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Cpu(#[from] CpuError),
}
