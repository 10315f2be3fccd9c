//! mod.rs — NØNOS kexec plumbing
//!
//! Physical ranges, the firmware memory map and the segment planner the
//! loader places its buffers through.

pub mod memmap;
pub mod memory;
pub mod range;

pub use memmap::{MemoryMap, RangeType, TypedRange, SYSFS_MEMMAP_ROOT};
pub use memory::{Memory, MemoryPlanner, Segment};
pub use range::{FindOpts, Range, Ranges, M1, PAGE_SIZE};
