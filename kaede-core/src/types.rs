use std::time::Duration;

/// A guest physical address. The console has a 32-bit physical address space.
pub type PAddr = u32;

/// A count of virtual clock cycles.
pub type Cycles = u64;

/// Clock rate of the emulated CPU core, in Hz.
///
/// Virtual time is counted in cycles of this clock; wall-clock time never
/// enters the scheduler.
pub const BASE_CLOCK_RATE: u64 = 268_111_856;

/// Virtual cycles per presented frame (59.94 Hz screen, rounded to 60).
pub const FRAME_CYCLES: u64 = BASE_CLOCK_RATE / 60;

/// Nominal wall-clock duration of one frame, used only to throttle the
/// emulation thread when the output collaborator cannot accept frames.
pub const FRAME_INTERVAL: Duration = Duration::from_micros(1_000_000 / 60);

/// Upper bound on a single guest execution slice when no event is pending.
pub const MAX_SLICE_CYCLES: u64 = FRAME_CYCLES;

/// Size of a thread's IPC command buffer, in 32-bit words.
pub const CMD_BUFFER_WORDS: usize = 64;

/// Size of the thread-local storage block each guest thread owns. The
/// command buffer lives at [`CMD_BUFFER_OFFSET`] inside it.
pub const TLS_BLOCK_SIZE: u32 = 0x200;

/// Byte offset of the IPC command buffer inside a thread's TLS block.
pub const CMD_BUFFER_OFFSET: u32 = 0x80;
