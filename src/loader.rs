//! loader.rs — NØNOS multiboot load orchestrator
//!
//! Runs the load as a fixed sequence of stages against one memory planner:
//! - probe the boot header (classic, then ESX-style)
//! - resolve the ELF entry point and place the ELF segments
//! - read the physical memory map
//! - reserve the firmware table, if one was supplied
//! - lay out the protocol's boot information
//! - patch and place the handover trampoline
//!
//! A failing stage aborts the load with the stage attached to the error.
//! Segments already placed are not rolled back; discard the planner.

use std::io::{Read, Seek};

use log::{info, warn};

use crate::config::LoadOptions;
use crate::description::{Description, DEBUG_PREFIX};
use crate::error::{Result, Stage, StageExt};
use crate::image::{self, ImageKind};
use crate::info::{InfoLayout, InfoRequest};
use crate::kexec::{MemoryPlanner, Range, Segment};
use crate::module::Module;
use crate::trampoline;

/// Firmware tables such as the iBFT are found by scanning 512 KiB..1 MiB.
pub const FIRMWARE_TABLE_WINDOW: Range = Range::new(0x80000, 0x80000);

#[derive(Debug, Default)]
pub struct LoadRequest {
    pub cmdline: String,
    pub modules: Vec<Module>,
    /// Pre-serialized table placed inside [`FIRMWARE_TABLE_WINDOW`].
    pub firmware_table: Option<Vec<u8>>,
    pub options: LoadOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub segments: Vec<Segment>,
    /// Trampoline address; never the kernel's own entry point.
    pub entry_point: u64,
}

/// Plan a multiboot load of `kernel` through `planner`.
pub fn load<P, R>(planner: &mut P, mut kernel: R, req: LoadRequest) -> Result<LoadResult>
where
    P: MemoryPlanner,
    R: Read + Seek,
{
    let LoadRequest {
        cmdline,
        mut modules,
        firmware_table,
        options,
    } = req;

    info!("[multiboot] parsing header");
    let kind = image::probe(&mut kernel).stage(Stage::ParseHeader)?;
    info!("[multiboot] found {} image", kind.name());

    let image = kernel
        .rewind()
        .map_err(Into::into)
        .and_then(|()| image::read_image(&mut kernel))
        .stage(Stage::ResolveEntryPoint)?;
    let kernel_entry = image::entry_point(&image).stage(Stage::ResolveEntryPoint)?;
    info!("[multiboot] kernel entry point at {kernel_entry:#x}");

    planner.load_elf_segments(&image).stage(Stage::LoadElfSegments)?;
    info!("[multiboot] ELF segments placed");

    planner.parse_memory_map().stage(Stage::ParseMemoryMap)?;

    // Nothing else is placed yet; this is the tightest constraint of the load.
    if let Some(table) = firmware_table {
        let r = planner
            .reserve_in(table.len() as u64, FIRMWARE_TABLE_WINDOW)
            .and_then(|r| planner.insert_segment(Segment::new(table, r)).map(|()| r))
            .stage(Stage::ReserveFirmwareTable)?;
        info!("[multiboot] firmware table at {r}");
    }

    info!("[multiboot] preparing {} info", kind.name());
    let req = InfoRequest {
        cmdline: &cmdline,
        bootloader_name: &options.bootloader_name,
    };
    let layout = kind
        .build_info(planner, &req, &mut modules)
        .stage(Stage::BuildInfo)?;

    let entry_point = trampoline::setup(options.arch, layout.addr, kernel_entry, kind.boot_magic())
        .and_then(|code| planner.add_segment(code))
        .stage(Stage::BuildTrampoline)?
        .start;
    info!("[multiboot] trampoline entry point at {entry_point:#x}");

    if options.debug {
        emit_description(&kind, &layout);
    }

    Ok(LoadResult {
        segments: planner.segments().to_vec(),
        entry_point,
    })
}

fn emit_description(kind: &ImageKind, layout: &InfoLayout) {
    match Description::from_layout(kind, layout).debug_line() {
        Ok(line) => info!("{line}"),
        Err(e) => warn!("{DEBUG_PREFIX} cannot create debug info: {e}"),
    }
}
