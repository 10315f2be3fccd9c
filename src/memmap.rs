//! memmap.rs — planner memory map to Multiboot wire entries
//!
//! Entry layout (native endian, packed, 24 bytes):
//!   +-----------+ 0
//!   | size  u32 | = 20, bytes following this field
//!   | base  u64 |
//!   | len   u64 |
//!   | type  u32 |
//!   +-----------+ 24

use std::mem::size_of;

use log::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::kexec::{MemoryMap, RangeType, M1};

pub const MMAP_AVAILABLE: u32 = 1;
pub const MMAP_RESERVED: u32 = 2;
pub const MMAP_ACPI_RECLAIMABLE: u32 = 3;
pub const MMAP_NVS: u32 = 4;

const K640: u32 = 640 * 1024;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromBytes)]
pub struct MemoryMapEntry {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    pub ty: u32,
}

pub const ENTRY_SIZE: usize = size_of::<MemoryMapEntry>();

/// Wire type for a planner range type. Default and Reserved share a code.
pub fn wire_type(ty: RangeType) -> u32 {
    match ty {
        RangeType::Ram => MMAP_AVAILABLE,
        RangeType::Acpi => MMAP_ACPI_RECLAIMABLE,
        RangeType::Nvs => MMAP_NVS,
        RangeType::Default | RangeType::Reserved => MMAP_RESERVED,
    }
}

/// One entry per planner range, in planner order.
pub fn project(phys: &MemoryMap) -> Vec<MemoryMapEntry> {
    let entries: Vec<MemoryMapEntry> = phys
        .iter()
        .map(|tr| MemoryMapEntry {
            size: (ENTRY_SIZE - size_of::<u32>()) as u32,
            base_addr: tr.range.start,
            length: tr.range.size,
            ty: wire_type(tr.ty),
        })
        .collect();
    debug!("[multiboot] memory map: {} entries", entries.len());
    entries
}

pub fn marshal(entries: &[MemoryMapEntry]) -> Vec<u8> {
    entries.as_bytes().to_vec()
}

/// Lower and upper memory in bytes, the way Multiboot kernels expect them:
/// lower is the furthest RAM end reachable from a region starting at or
/// below 640 KiB; upper is the furthest RAM end reachable from a region
/// starting at or below 1 MiB, minus 1 MiB. Ends wrap at 32 bits.
pub fn memory_boundaries(phys: &MemoryMap) -> (u32, u32) {
    let m1 = M1 as u32;
    let (mut lower, mut upper) = (0u32, 0u32);
    for tr in phys.iter().filter(|tr| tr.ty == RangeType::Ram) {
        let end = (tr.range.start as u32).wrapping_add(tr.range.size as u32);
        if tr.range.start <= K640 as u64 && end > lower {
            lower = end;
        }
        if tr.range.start <= M1 && end > upper.wrapping_add(m1) {
            upper = end.wrapping_sub(m1);
        }
    }
    (lower, upper)
}
