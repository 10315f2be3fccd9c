//! NØNOS multiboot — kexec loader for Multiboot v1 and ESX-style kernels
//!
//! Given a kernel image, boot modules and a command line, [`load`] plans
//! every buffer the kernel expects to find in physical memory and returns
//! them as kexec segments together with the address to jump to:
//!
//! ```text
//!   kernel ──probe──> ImageKind ──ELF──> entry, PT_LOAD segments
//!                        │
//!   planner memory map ──┼──> [firmware table] ──> info block ──> trampoline
//!                        │                            ▲
//!   modules + cmdline ───┴──> staging buffer ─────────┘
//! ```
//!
//! The memory planner is a trait ([`MemoryPlanner`]); [`Memory`] is the
//! reference first-fit planner backed by `/sys/firmware/memmap`.

pub mod config;
pub mod description;
pub mod error;
pub mod esx;
pub mod header;
pub mod image;
pub mod info;
pub mod kexec;
pub mod loader;
pub mod memmap;
pub mod module;
pub mod trampoline;

pub use config::{Arch, LoadOptions};
pub use description::{Description, DEBUG_PREFIX};
pub use error::{Error, Result, Stage};
pub use image::{probe, ImageKind};
pub use info::{InfoLayout, InfoRequest};
pub use kexec::{Memory, MemoryPlanner, Range, Segment};
pub use loader::{load, LoadRequest, LoadResult, FIRMWARE_TABLE_WINDOW};
pub use module::{lazy_open_modules, open_modules, Module};
