//! memory.rs — NØNOS kexec memory planner: segments and the RAM left over for them
//!
//! The planner owns two pieces of bookkeeping:
//! - the typed physical memory map (what firmware says is RAM, ACPI, ...)
//! - the kexec segments placed so far (buffer + physical destination)
//!
//! Free space is always derived, never stored: RAM minus every segment.
//! One planner serves one load; sharing it between concurrent loads
//! double-books physical memory.

use std::fmt;
use std::path::PathBuf;

use log::info;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use super::memmap::{MemoryMap, RangeType, TypedRange, SYSFS_MEMMAP_ROOT};
use super::range::{align_up, FindOpts, Range, Ranges, M1, PAGE_SIZE};
use crate::error::{Error, Result};

/// One piece of data to be placed in physical memory before the jump.
///
/// `buf` may be shorter than `phys`; kexec zero-fills the remainder.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    pub buf: Vec<u8>,
    pub phys: Range,
}

impl Segment {
    pub fn new(buf: Vec<u8>, phys: Range) -> Self {
        Self { buf, phys }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(phys: {}, buffer: size {:#x})", self.phys, self.buf.len())
    }
}

/// The seam between the loader and whoever decides physical placement.
pub trait MemoryPlanner {
    /// Place every `PT_LOAD` program header of `kernel` at its physical address.
    fn load_elf_segments(&mut self, kernel: &[u8]) -> Result<()>;

    /// Populate the typed physical range list.
    fn parse_memory_map(&mut self) -> Result<()>;

    fn phys(&self) -> &MemoryMap;

    /// Free, page-aligned space for `size` bytes above 1 MiB. Reserves nothing.
    fn find_space(&self, size: u64) -> Result<Range>;

    /// Reserve `size` bytes (rounded to a page) inside `limit` and mark them
    /// reserved in the memory map.
    fn reserve_in(&mut self, size: u64, limit: Range) -> Result<Range>;

    /// Commit `buf` wherever it fits and return the chosen range.
    fn add_segment(&mut self, buf: Vec<u8>) -> Result<Range>;

    /// Commit a segment at a caller-chosen range.
    fn insert_segment(&mut self, seg: Segment) -> Result<()>;

    fn segments(&self) -> &[Segment];
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MemmapSource {
    Sysfs(PathBuf),
    Fixed,
}

/// Reference planner: first-fit over available RAM.
#[derive(Debug, Clone)]
pub struct Memory {
    phys: MemoryMap,
    segments: Vec<Segment>,
    source: MemmapSource,
}

impl Default for Memory {
    fn default() -> Self {
        Self::with_sysfs(SYSFS_MEMMAP_ROOT)
    }
}

impl Memory {
    /// Planner that reads the firmware memory map from `dir` on
    /// [`MemoryPlanner::parse_memory_map`].
    pub fn with_sysfs(dir: impl Into<PathBuf>) -> Self {
        Self {
            phys: MemoryMap::default(),
            segments: Vec::new(),
            source: MemmapSource::Sysfs(dir.into()),
        }
    }

    /// Planner over a caller-supplied memory map.
    pub fn with_phys(phys: MemoryMap) -> Self {
        Self {
            phys,
            segments: Vec::new(),
            source: MemmapSource::Fixed,
        }
    }

    /// RAM not covered by any segment, with page-aligned starts.
    pub fn available_ram(&self) -> Ranges {
        let mut ram = self.phys.ram();
        for s in &self.segments {
            ram = ram.minus(&s.phys);
        }
        ram.iter()
            .filter_map(|r| {
                let start = align_up(r.start, PAGE_SIZE);
                (start < r.end()).then(|| Range::from_interval(start, r.end()))
            })
            .collect()
    }

    fn push_sorted(&mut self, seg: Segment) {
        let at = self
            .segments
            .partition_point(|s| s.phys.start <= seg.phys.start);
        self.segments.insert(at, seg);
    }
}

impl MemoryPlanner for Memory {
    fn load_elf_segments(&mut self, kernel: &[u8]) -> Result<()> {
        let elf = ElfFile::new(kernel).map_err(Error::Elf)?;
        for ph in elf.program_iter() {
            if ph.get_type().map_err(Error::Elf)? != Type::Load {
                continue;
            }
            // Only file-backed bytes are copied; kexec zeroes up to memsz.
            let buf = if ph.file_size() == 0 {
                Vec::new()
            } else {
                let start = usize::try_from(ph.offset()).map_err(|_| Error::Elf("segment offset too large"))?;
                let len = usize::try_from(ph.file_size()).map_err(|_| Error::Elf("segment too large"))?;
                let end = start.checked_add(len).ok_or(Error::Elf("segment size overflow"))?;
                kernel
                    .get(start..end)
                    .ok_or(Error::TruncatedInput { needed: end, available: kernel.len() })?
                    .to_vec()
            };
            self.insert_segment(Segment::new(
                buf,
                Range::new(ph.physical_addr(), ph.mem_size()),
            ))?;
        }
        Ok(())
    }

    fn parse_memory_map(&mut self) -> Result<()> {
        if let MemmapSource::Sysfs(dir) = &self.source {
            self.phys = MemoryMap::from_sysfs(dir)?;
            info!("[kexec] memory map from {}: {} ranges", dir.display(), self.phys.0.len());
        }
        Ok(())
    }

    fn phys(&self) -> &MemoryMap {
        &self.phys
    }

    fn find_space(&self, size: u64) -> Result<Range> {
        let size = align_up(size, PAGE_SIZE);
        let opts = FindOpts::above(M1).aligned(PAGE_SIZE);
        self.available_ram()
            .find_space(size, opts)
            .ok_or(Error::NotEnoughSpace { size, limit: opts.limit })
    }

    fn reserve_in(&mut self, size: u64, limit: Range) -> Result<Range> {
        let size = align_up(size, PAGE_SIZE);
        let r = self
            .available_ram()
            .find_space(size, FindOpts::within(limit).aligned(PAGE_SIZE))
            .ok_or(Error::NotEnoughSpace { size, limit })?;
        self.phys.insert(TypedRange { range: r, ty: RangeType::Reserved });
        Ok(r)
    }

    fn add_segment(&mut self, buf: Vec<u8>) -> Result<Range> {
        let r = self.find_space(buf.len() as u64)?;
        self.push_sorted(Segment::new(buf, r));
        Ok(r)
    }

    fn insert_segment(&mut self, seg: Segment) -> Result<()> {
        if self.segments.iter().any(|s| s.phys.overlaps(&seg.phys)) {
            return Err(Error::SegmentOverlap(seg.phys));
        }
        self.push_sorted(seg);
        Ok(())
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// 0..640K and 1M..64M of RAM, a reserved hole in between.
    pub(crate) fn pc_memory() -> Memory {
        Memory::with_phys(MemoryMap(vec![
            TypedRange::new(0, 0xa0000, RangeType::Ram),
            TypedRange::new(0xa0000, 0x60000, RangeType::Reserved),
            TypedRange::new(M1, 63 * M1, RangeType::Ram),
        ]))
    }

    #[test]
    fn available_ram_subtracts_segments() {
        let mut mem = Memory::with_phys(MemoryMap(vec![
            TypedRange::new(0, 8192, RangeType::Ram),
            TypedRange::new(8192, 8000, RangeType::Ram),
        ]));
        mem.insert_segment(Segment::new(vec![], Range::new(40, 50))).unwrap();
        mem.insert_segment(Segment::new(vec![], Range::new(8000, 2000))).unwrap();
        assert_eq!(
            mem.available_ram().0,
            vec![
                Range::new(0, 40),
                Range::new(4096, 8000 - 4096),
                Range::new(12288, 16192 - 12288),
            ]
        );
    }

    #[test]
    fn add_segment_stays_above_1m() {
        let mut mem = pc_memory();
        let r = mem.add_segment(vec![1, 2, 3]).unwrap();
        assert_eq!(r, Range::new(M1, PAGE_SIZE));
        let r2 = mem.add_segment(vec![0; 5000]).unwrap();
        assert_eq!(r2, Range::new(M1 + PAGE_SIZE, 2 * PAGE_SIZE));
        assert_eq!(mem.segments().len(), 2);
    }

    #[test]
    fn reserve_in_window() {
        let mut mem = pc_memory();
        let window = Range::new(0x80000, 0x80000);
        let r = mem.reserve_in(100, window).unwrap();
        assert_eq!(r, Range::new(0x80000, PAGE_SIZE));
        assert!(mem
            .phys()
            .iter()
            .any(|tr| tr.range == r && tr.ty == RangeType::Reserved));

        // 0x80000..0xa0000 is all the RAM the window holds.
        let err = mem.reserve_in(0x20000, window).unwrap_err();
        assert!(matches!(err, Error::NotEnoughSpace { .. }));
    }

    #[test]
    fn reserve_in_unaligned_window_starts_on_page() {
        let mut mem = pc_memory();
        let r = mem.reserve_in(100, Range::new(0x80010, 0x10000)).unwrap();
        assert_eq!(r, Range::new(0x81000, PAGE_SIZE));
        assert_eq!(mem.find_space(1).unwrap().start % PAGE_SIZE, 0);
    }

    #[test]
    fn overlapping_insert_rejected() {
        let mut mem = pc_memory();
        mem.insert_segment(Segment::new(vec![], Range::new(M1, 0x100))).unwrap();
        assert!(matches!(
            mem.insert_segment(Segment::new(vec![], Range::new(M1 + 0x80, 0x100))),
            Err(Error::SegmentOverlap(_))
        ));
    }

    #[test]
    fn fixed_map_survives_parse() {
        let mut mem = pc_memory();
        let before = mem.phys().clone();
        mem.parse_memory_map().unwrap();
        assert_eq!(mem.phys(), &before);
    }
}
