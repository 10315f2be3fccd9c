//! header.rs — Multiboot v1 image header
//!
//! Layout (native endian, 4-byte aligned, within the first 8 KiB of the image):
//!   +----------------------+ 0
//!   | magic = 0x1BADB002   | u32   mandatory
//!   | flags                | u32   mandatory
//!   | checksum             | u32   mandatory, magic + flags + checksum == 0
//!   +----------------------+ 12
//!   | header_addr .. depth | 9 x u32, optional (a.out kludge + video mode)
//!   +----------------------+ 48

use bitflags::bitflags;
use log::warn;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};

pub const HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Handed to the kernel in EAX.
pub const BOOT_MAGIC: u32 = 0x2BAD_B002;

/// The header must sit entirely within this prefix of the image.
pub const HEADER_WINDOW: usize = 8192;

pub const MANDATORY_SIZE: usize = 12;

/// Flag bits in this mask request features this loader cannot provide.
pub const UNSUPPORTED_FLAGS: u32 = 0x0000_FFF8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        const PAGE_ALIGN  = 1 << 0;
        const MEMORY_INFO = 1 << 1;
        const VIDEO_MODE  = 1 << 2;
        const AOUT_KLUDGE = 1 << 16;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromBytes)]
pub struct Header {
    pub magic: u32,
    pub flags: u32,
    pub checksum: u32,
    pub header_addr: u32,
    pub load_addr: u32,
    pub load_end_addr: u32,
    pub bss_end_addr: u32,
    pub entry_addr: u32,
    pub mode_type: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Header {
    /// Header with a valid checksum for `flags`; optional fields zeroed.
    pub fn new(flags: HeaderFlags) -> Self {
        let flags = flags.bits();
        Self {
            magic: HEADER_MAGIC,
            flags,
            checksum: 0u32.wrapping_sub(HEADER_MAGIC).wrapping_sub(flags),
            ..Self::default()
        }
    }

    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.flags)
    }

    #[inline]
    pub fn checksum_valid(&self) -> bool {
        self.magic.wrapping_add(self.flags).wrapping_add(self.checksum) == 0
    }
}

/// Walk `image` (clamped to [`HEADER_WINDOW`]) at `stride` and return the
/// first decoded `T` for which `accept` holds.
///
/// A candidate needs `mandatory` bytes inside the window; whatever of `T`
/// lies past the window decodes as zero.
pub(crate) fn scan_window<T: FromBytes>(
    image: &[u8],
    stride: usize,
    mandatory: usize,
    accept: impl Fn(&T) -> bool,
) -> Result<Option<T>> {
    let len = image.len().min(HEADER_WINDOW);
    if len < mandatory {
        return Err(Error::TruncatedInput { needed: mandatory, available: len });
    }
    let mut buf = image[..len].to_vec();
    buf.resize(len + std::mem::size_of::<T>(), 0);

    let mut off = 0;
    while off + mandatory <= len {
        if let Some(hdr) = T::read_from_prefix(&buf[off..]) {
            if accept(&hdr) {
                return Ok(Some(hdr));
            }
        }
        off += stride;
    }
    Ok(None)
}

/// Find and validate the classic multiboot header in `image`.
pub fn parse_header(image: &[u8]) -> Result<Header> {
    let hdr = scan_window::<Header>(image, 4, MANDATORY_SIZE, |h| {
        h.magic == HEADER_MAGIC && h.checksum_valid()
    })?
    .ok_or(Error::HeaderNotFound)?;

    if hdr.flags & UNSUPPORTED_FLAGS != 0 {
        return Err(Error::UnsupportedFlags(hdr.flags & UNSUPPORTED_FLAGS));
    }
    if hdr.flags().contains(HeaderFlags::VIDEO_MODE) {
        warn!("[multiboot] video mode flag is not supported yet, trying to load anyway");
    }
    Ok(hdr)
}
