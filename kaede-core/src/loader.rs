//! Guest image loading.
//!
//! Titles ship as a small container: a fixed header naming the memory
//! layout mode, entry point and code size, followed by the raw code
//! segment. Anything wrong with the container is a typed bring-up error —
//! the session is left uninitialized, never half-loaded.

use std::io::Cursor;
use std::path::Path;

use binrw::BinRead;
use bitflags::bitflags;
use tracing::info;

use crate::error::BringUpError;
use crate::memory::MemoryMode;

bitflags! {
    /// Flag bits in the image header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageFlags: u8 {
        /// The code segment is encrypted; we do not ship keys, so loading
        /// stops with a typed error.
        const ENCRYPTED = 1 << 0;
    }
}

/// Fixed-size container header. All fields little-endian.
#[binrw::binrw]
#[brw(little, magic = b"KXE0")]
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub version: u16,
    pub mem_mode: u8,
    pub flags: u8,
    /// Entry point, as an offset into the code segment.
    pub entry_offset: u32,
    pub code_size: u32,
    /// Title name, NUL-padded.
    pub title: [u8; 32],
}

impl ImageHeader {
    pub fn flag_bits(&self) -> ImageFlags {
        ImageFlags::from_bits_truncate(self.flags)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flag_bits().contains(ImageFlags::ENCRYPTED)
    }

    pub fn title_str(&self) -> String {
        let end = self
            .title
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.title.len());
        String::from_utf8_lossy(&self.title[..end]).into_owned()
    }
}

/// A fully validated guest image, ready to map.
#[derive(Debug)]
pub struct GuestImage {
    pub header: ImageHeader,
    pub mode: MemoryMode,
    pub code: Vec<u8>,
}

pub fn load_image(path: &Path) -> Result<GuestImage, BringUpError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BringUpError::ImageNotFound(path.to_owned()),
        _ => BringUpError::ImageRead(e),
    })?;

    let mut cursor = Cursor::new(bytes.as_slice());
    let header =
        ImageHeader::read(&mut cursor).map_err(|e| BringUpError::InvalidFormat(e.to_string()))?;

    if header.is_encrypted() {
        return Err(BringUpError::EncryptedImage);
    }
    let mode = MemoryMode::from_repr(header.mem_mode)
        .ok_or(BringUpError::MemoryModeInvalid(header.mem_mode))?;

    let code_start = cursor.position() as usize;
    let code_end = code_start + header.code_size as usize;
    if header.code_size == 0 || bytes.len() < code_end {
        return Err(BringUpError::InvalidFormat(format!(
            "truncated code segment: header claims {:#X} bytes",
            header.code_size
        )));
    }
    if header.entry_offset >= header.code_size {
        return Err(BringUpError::InvalidFormat(format!(
            "entry point {:#X} outside code segment",
            header.entry_offset
        )));
    }

    info!(
        title = %header.title_str(),
        ?mode,
        code_size = %format!("{:#X}", header.code_size),
        "loaded guest image"
    );
    Ok(GuestImage {
        mode,
        code: bytes[code_start..code_end].to_vec(),
        header,
    })
}
