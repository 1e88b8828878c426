//! IPC command buffer wire format.
//!
//! One synchronous request occupies the calling thread's command buffer:
//!
//! ```text
//! word 0              header: command id and declared argument shape
//! words 1..=n         n "normal" 32-bit parameters
//! words n+1..         one (descriptor, address) pair per declared buffer
//! ```
//!
//! All words are 32-bit, guest-endian as stored in guest memory. The
//! header value is the lookup key for the handler table, so a request with
//! a different shape is simply a different (and likely unregistered)
//! header.

use smallvec::SmallVec;

use crate::result::ResultCode;
use crate::types::CMD_BUFFER_WORDS;

/// Pack a header word: command id plus the declared parameter shape.
/// Buffer descriptors occupy two words each (descriptor + address).
pub const fn make_header(command_id: u16, normal_params: u32, buffer_words: u32) -> u32 {
    if normal_params > 0x3F || buffer_words > 0x3F {
        panic!("header shape fields are 6 bits wide");
    }
    ((command_id as u32) << 16) | (normal_params << 6) | buffer_words
}

#[inline]
pub const fn header_command_id(header: u32) -> u16 {
    (header >> 16) as u16
}

#[inline]
pub const fn header_normal_count(header: u32) -> usize {
    ((header >> 6) & 0x3F) as usize
}

#[inline]
pub const fn header_buffer_words(header: u32) -> usize {
    (header & 0x3F) as usize
}

/// One declared buffer: a descriptor word followed by the guest address of
/// the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub descriptor: u32,
    pub address: u32,
}

impl BufferDescriptor {
    /// Byte length encoded in the descriptor.
    #[inline]
    pub fn size(self) -> u32 {
        self.descriptor >> 4
    }

    /// Whether the service is expected to write the buffer back.
    #[inline]
    pub fn is_write(self) -> bool {
        self.descriptor & 0b10 != 0
    }
}

/// A parsed request view, valid for the duration of one dispatch.
#[derive(Debug, Clone)]
pub struct IpcRequest {
    pub header: u32,
    pub params: SmallVec<[u32; 8]>,
    pub buffers: SmallVec<[BufferDescriptor; 2]>,
}

impl IpcRequest {
    /// Parse the command buffer according to the handler's declared shape.
    ///
    /// # Panics
    ///
    /// A declared shape that does not fit the fixed command buffer is an
    /// emulator bug (a handler registered with an impossible signature) and
    /// halts the run loop.
    pub fn parse(words: &[u32; CMD_BUFFER_WORDS], normal_params: usize, buffer_count: usize) -> Self {
        let needed = 1 + normal_params + 2 * buffer_count;
        assert!(
            needed <= CMD_BUFFER_WORDS,
            "command buffer shorter than its declared shape ({needed} words)"
        );

        let params = SmallVec::from_slice(&words[1..1 + normal_params]);
        let mut buffers = SmallVec::new();
        let mut at = 1 + normal_params;
        for _ in 0..buffer_count {
            buffers.push(BufferDescriptor {
                descriptor: words[at],
                address: words[at + 1],
            });
            at += 2;
        }
        Self {
            header: words[0],
            params,
            buffers,
        }
    }

    #[inline]
    pub fn command_id(&self) -> u16 {
        header_command_id(self.header)
    }
}

/// A response to be written back into the calling thread's command buffer:
/// the result word plus any output words.
#[derive(Debug, Clone)]
pub struct IpcResponse {
    pub result: ResultCode,
    pub words: SmallVec<[u32; 8]>,
}

impl IpcResponse {
    pub fn success(words: impl IntoIterator<Item = u32>) -> Self {
        Self {
            result: ResultCode::SUCCESS,
            words: words.into_iter().collect(),
        }
    }

    pub fn error(result: ResultCode) -> Self {
        Self {
            result,
            words: SmallVec::new(),
        }
    }

    /// The benign default written for unimplemented requests: success with
    /// no payload, so unrelated guest code paths keep functioning.
    pub fn unimplemented() -> Self {
        Self::success([])
    }

    /// Encode as command buffer words: response header, result word, then
    /// the output words.
    pub fn encode(&self, request_header: u32) -> SmallVec<[u32; 10]> {
        let mut out = SmallVec::new();
        out.push(make_header(
            header_command_id(request_header),
            1 + self.words.len() as u32,
            0,
        ));
        out.push(self.result.0);
        out.extend_from_slice(&self.words);
        out
    }
}
