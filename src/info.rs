//! info.rs — classic Multiboot information block
//!
//! Segments committed by [`build_info`], in order:
//!   1. memory map entries            (mmap_addr)
//!   2. strings + module payloads     (cmdline, boot_loader_name, module data)
//!   3. module record array           (mods_addr), only with modules
//!   4. the info block itself         (handed to the kernel in EBX)
//!
//! Every pointer is a 32-bit physical address and is filled in only after the
//! buffer it points into has been placed.

use bitflags::bitflags;
use log::info;
use zerocopy::{AsBytes, FromBytes};

use crate::error::Result;
use crate::header::{Header, HeaderFlags};
use crate::kexec::MemoryPlanner;
use crate::memmap::{self, MemoryMapEntry};
use crate::module::{addr32, marshal_records, Module, ModuleRecord, ModuleStager};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        const MEMORY           = 1 << 0;
        const BOOTDEV          = 1 << 1;
        const CMDLINE          = 1 << 2;
        const MODS             = 1 << 3;
        const AOUT_SYMS        = 1 << 4;
        const ELF_SHDR         = 1 << 5;
        const MEM_MAP          = 1 << 6;
        const DRIVE_INFO       = 1 << 7;
        const CONFIG_TABLE     = 1 << 8;
        const BOOT_LOADER_NAME = 1 << 9;
        const APM_TABLE        = 1 << 10;
        const VBE              = 1 << 11;
        const FRAMEBUFFER      = 1 << 12;
    }
}

/// Multiboot 0.6.96 boot information, 116 bytes.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromBytes)]
pub struct InfoBlock {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub drives_length: u32,
    pub drives_addr: u32,
    pub config_table: u32,
    pub boot_loader_name: u32,
    pub apm_table: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
    pub vbe_mode: u16,
    pub vbe_interface_seg: u16,
    pub vbe_interface_off: u16,
    pub vbe_interface_len: u16,
    pub framebuffer_addr: u64,
    pub framebuffer_pitch: u32,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_bpp: u8,
    pub framebuffer_type: u8,
    pub color_info: [u8; 6],
}

impl InfoBlock {
    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_retain(self.flags)
    }
}

/// Strings the info builders need from the caller.
#[derive(Debug, Clone, Copy)]
pub struct InfoRequest<'a> {
    pub cmdline: &'a str,
    pub bootloader_name: &'a str,
}

/// Everything an info builder placed, with final physical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoLayout {
    /// Address handed to the kernel.
    pub addr: u64,
    /// Classic info block; `None` for the TLV variant.
    pub info: Option<InfoBlock>,
    pub cmdline: String,
    pub bootloader: Option<String>,
    pub memory_map: Vec<MemoryMapEntry>,
    pub modules: Vec<ModuleRecord>,
    pub module_cmdlines: Vec<String>,
    pub module_hashes: Vec<[u8; 32]>,
}

/// Lay out a classic info block and everything it points to.
pub fn build_info<P: MemoryPlanner>(
    hdr: &Header,
    planner: &mut P,
    req: &InfoRequest<'_>,
    modules: &mut [Module],
) -> Result<InfoLayout> {
    let mut inf = InfoBlock::default();

    let memory_map = memmap::project(planner.phys());
    let mmap = planner.add_segment(memmap::marshal(&memory_map))?;
    info!("[multiboot] memory map at {mmap}");

    if hdr.flags().contains(HeaderFlags::MEMORY_INFO) {
        let (lower, upper) = memmap::memory_boundaries(planner.phys());
        inf.flags |= (InfoFlags::MEMORY | InfoFlags::MEM_MAP).bits();
        inf.mem_lower = lower >> 10;
        inf.mem_upper = upper >> 10;
        inf.mmap_addr = addr32(mmap.start)?;
        inf.mmap_length = (memory_map.len() * memmap::ENTRY_SIZE) as u32;
    }

    let mut stager = ModuleStager::new();
    let name_off = stager.push_str(req.bootloader_name)?;
    let cmdline_off = stager.push_str(req.cmdline)?;
    let staged = stager.stage(modules)?.commit(planner)?;
    info!(
        "[multiboot] {} module(s) staged at {:#x}",
        staged.records.len(),
        staged.base
    );

    if !staged.records.is_empty() {
        let r = planner.add_segment(marshal_records(&staged.records))?;
        inf.flags |= InfoFlags::MODS.bits();
        inf.mods_addr = addr32(r.start)?;
        inf.mods_count = staged.records.len() as u32;
    }

    inf.flags |= (InfoFlags::CMDLINE | InfoFlags::BOOT_LOADER_NAME).bits();
    inf.cmdline = staged.addr(cmdline_off);
    inf.boot_loader_name = staged.addr(name_off);

    let r = planner.add_segment(inf.as_bytes().to_vec())?;
    addr32(r.start)?;
    info!("[multiboot] info block at {r}, flags {:#x}", { inf.flags });

    Ok(InfoLayout {
        addr: r.start,
        info: Some(inf),
        cmdline: req.cmdline.to_owned(),
        bootloader: Some(req.bootloader_name.to_owned()),
        memory_map,
        modules: staged.records,
        module_cmdlines: modules.iter().map(|m| m.cmdline.clone()).collect(),
        module_hashes: staged.hashes,
    })
}
