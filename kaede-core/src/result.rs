//! IPC result codes.
//!
//! Every dispatch path answers the guest with exactly one 32-bit result
//! word. The word packs a description, the originating module, a summary
//! and a severity level; error levels occupy the high bits, so any failing
//! code is negative when viewed as `i32`. Guest software branches on these
//! values exactly as on real hardware — they are data, never panics.

use proc_bitfield::bitfield;

bitfield! {
    /// A packed 32-bit IPC result word.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ResultCode(pub u32): Debug {
        pub raw: u32 @ ..,
        pub description: u16 @ 0..=9,
        pub module: u8 @ 10..=17,
        pub summary: u8 @ 21..=26,
        pub level: u8 @ 27..=31,
    }
}

/// Module that produced a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorModule {
    Common = 0,
    Kernel = 1,
    Os = 3,
    Srv = 47,
    Application = 254,
}

/// Coarse classification of what went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorSummary {
    Success = 0,
    NothingHappened = 1,
    WouldBlock = 2,
    OutOfResource = 3,
    NotFound = 4,
    InvalidState = 5,
    NotSupported = 6,
    InvalidArgument = 7,
    WrongArgument = 8,
    Canceled = 9,
    Internal = 11,
}

/// Severity of a result. Levels at `Status` and above set the sign bit,
/// which is what makes [`ResultCode::is_error`] a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorLevel {
    Success = 0,
    Info = 1,
    Status = 25,
    Temporary = 26,
    Permanent = 27,
    Usage = 28,
    Fatal = 31,
}

impl ResultCode {
    /// The all-zero success word.
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub fn new(
        description: u16,
        module: ErrorModule,
        summary: ErrorSummary,
        level: ErrorLevel,
    ) -> Self {
        ResultCode(0)
            .with_description(description)
            .with_module(module as u8)
            .with_summary(summary as u8)
            .with_level(level as u8)
    }

    #[inline]
    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }
}
