//! esx.rs — ESX-style boot header and TLV boot information
//!
//! Header (native endian, 8-byte aligned, first 8 KiB):
//!   +--------------------+ 0
//!   | magic = 0x1BADB005 | u32 ┐
//!   | flags              | u32 ├ mandatory, same checksum rule as Multiboot v1
//!   | checksum           | u32 ┘
//!   | reserved           | u32
//!   | min_width/height/depth | 3 x u32
//!   | reserved2          | u32
//!   | rts_vaddr          | u64
//!   | rts_size           | u64
//!   +--------------------+ 48
//!
//! Info block (little endian, no padding):
//!   cmdline u64 | elem_count u64 | { type u32 | length u64 | payload }*
//! where each element's length counts its own 12-byte type/length prefix.

use bitflags::bitflags;
use log::info;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::header::{scan_window, MANDATORY_SIZE};
use crate::info::{InfoLayout, InfoRequest};
use crate::kexec::{range::align_up, MemoryPlanner, PAGE_SIZE};
use crate::memmap;
use crate::module::{Module, ModuleRecord, ModuleStager};

pub const HEADER_MAGIC: u32 = 0x1BAD_B005;

/// Handed to the kernel in EAX.
pub const BOOT_MAGIC: u32 = 0x2BAD_B005;

const ELEM_HEADER_SIZE: u64 = 12;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EsxFlags: u32 {
        const VIDEO           = 1 << 2;
        const EFI_RTS_OLD     = 1 << 17;
        const EFI_RTS_NEW     = 1 << 18;
        const LOADESX_VERSION = 1 << 19;
        const VIDEO_MIN       = 1 << 20;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromBytes)]
pub struct EsxHeader {
    pub magic: u32,
    pub flags: u32,
    pub checksum: u32,
    pub reserved: u32,
    pub min_width: u32,
    pub min_height: u32,
    pub min_depth: u32,
    pub reserved2: u32,
    pub rts_vaddr: u64,
    pub rts_size: u64,
}

impl EsxHeader {
    pub fn new(flags: EsxFlags) -> Self {
        let flags = flags.bits();
        Self {
            magic: HEADER_MAGIC,
            flags,
            checksum: 0u32.wrapping_sub(HEADER_MAGIC).wrapping_sub(flags),
            ..Self::default()
        }
    }

    pub fn flags(&self) -> EsxFlags {
        EsxFlags::from_bits_retain(self.flags)
    }

    pub fn checksum_valid(&self) -> bool {
        self.magic.wrapping_add(self.flags).wrapping_add(self.checksum) == 0
    }
}

pub fn parse_header(image: &[u8]) -> Result<EsxHeader> {
    scan_window::<EsxHeader>(image, 8, MANDATORY_SIZE, |h| {
        h.magic == HEADER_MAGIC && h.checksum_valid()
    })?
    .ok_or(Error::HeaderNotFound)
}

/// Element type tags of the info block. Only `MemRange` and `Module` are
/// emitted; `Vbe`, `Efi` and `LoadEsx` are reserved wire values a kernel
/// may still see from other loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ElemKind {
    MemRange = 1,
    Module = 2,
    Vbe = 3,
    Efi = 4,
    LoadEsx = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    pub start_page: u64,
    pub num_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elem {
    MemRange { start: u64, length: u64, mem_type: u32 },
    Module { size: u64, ranges: Vec<ModuleRange> },
}

impl Elem {
    pub fn kind(&self) -> ElemKind {
        match self {
            Elem::MemRange { .. } => ElemKind::MemRange,
            Elem::Module { .. } => ElemKind::Module,
        }
    }

    /// One contiguous page run covering a committed module.
    pub fn module(rec: &ModuleRecord) -> Self {
        let size = rec.len() as u64;
        Elem::Module {
            size,
            ranges: vec![ModuleRange {
                start_page: rec.start as u64 / PAGE_SIZE,
                num_pages: (align_up(size, PAGE_SIZE) / PAGE_SIZE) as u32,
            }],
        }
    }

    fn payload(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Elem::MemRange { start, length, mem_type } => {
                p.extend_from_slice(&start.to_le_bytes());
                p.extend_from_slice(&length.to_le_bytes());
                p.extend_from_slice(&mem_type.to_le_bytes());
            }
            Elem::Module { size, ranges } => {
                p.extend_from_slice(&size.to_le_bytes());
                p.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
                for r in ranges {
                    p.extend_from_slice(&r.start_page.to_le_bytes());
                    p.extend_from_slice(&r.num_pages.to_le_bytes());
                    p.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }
        p
    }

    fn marshal_into(&self, out: &mut Vec<u8>) {
        let payload = self.payload();
        out.extend_from_slice(&(self.kind() as u32).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64 + ELEM_HEADER_SIZE).to_le_bytes());
        out.extend_from_slice(&payload);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsxInfo {
    pub cmdline: u64,
    pub elems: Vec<Elem>,
}

impl EsxInfo {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.cmdline.to_le_bytes());
        out.extend_from_slice(&(self.elems.len() as u64).to_le_bytes());
        for e in &self.elems {
            e.marshal_into(&mut out);
        }
        out
    }
}

/// Lay out the TLV info block: memory ranges, then one element per module.
/// The kernel command line rides in the module staging buffer.
pub fn build_info<P: MemoryPlanner>(
    planner: &mut P,
    req: &InfoRequest<'_>,
    modules: &mut [Module],
) -> Result<InfoLayout> {
    let memory_map = memmap::project(planner.phys());
    let mut elems: Vec<Elem> = memory_map
        .iter()
        .map(|e| Elem::MemRange {
            start: e.base_addr,
            length: e.length,
            mem_type: e.ty,
        })
        .collect();

    let mut stager = ModuleStager::new();
    let cmdline_off = stager.push_str(req.cmdline)?;
    let staged = stager.stage(modules)?.commit(planner)?;
    elems.extend(staged.records.iter().map(Elem::module));

    let esx = EsxInfo {
        cmdline: staged.addr(cmdline_off) as u64,
        elems,
    };
    let r = planner.add_segment(esx.marshal())?;
    info!("[multiboot] esxbootinfo at {r}, {} elements", esx.elems.len());

    Ok(InfoLayout {
        addr: r.start,
        info: None,
        cmdline: req.cmdline.to_owned(),
        bootloader: None,
        memory_map,
        modules: staged.records,
        module_cmdlines: modules.iter().map(|m| m.cmdline.clone()).collect(),
        module_hashes: staged.hashes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kexec::memory::tests::pc_memory;
    use crate::kexec::M1;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_is_48_bytes() {
        assert_eq!(std::mem::size_of::<EsxHeader>(), 48);
    }

    #[test]
    fn header_found_at_8_byte_stride_only() {
        let hdr = EsxHeader {
            min_width: 1024,
            rts_size: 0x1000,
            ..EsxHeader::new(EsxFlags::EFI_RTS_NEW | EsxFlags::VIDEO)
        };
        let mut img = vec![0u8; 4096];
        img[128..176].copy_from_slice(hdr.as_bytes());
        assert_eq!(parse_header(&img).unwrap(), hdr);

        let mut img = vec![0u8; 4096];
        img[132..180].copy_from_slice(hdr.as_bytes());
        assert!(matches!(parse_header(&img), Err(Error::HeaderNotFound)));
    }

    #[test]
    fn header_at_window_edges() {
        use crate::header::HEADER_WINDOW;

        let hdr = EsxHeader {
            rts_vaddr: 0xffff_8000_0000_0000,
            rts_size: 0x2000,
            ..EsxHeader::new(EsxFlags::EFI_RTS_NEW)
        };
        let image_at = |off: usize| {
            let mut img = vec![0u8; HEADER_WINDOW + 64];
            img[off..off + 48].copy_from_slice(hdr.as_bytes());
            img
        };

        // Mandatory part ends 4 bytes before the window; the tail past it reads as zero.
        let got = parse_header(&image_at(HEADER_WINDOW - 16)).unwrap();
        assert_eq!(got.magic, HEADER_MAGIC);
        assert_eq!(got.flags, hdr.flags);
        assert_eq!(got.rts_vaddr, 0);
        assert_eq!(got.rts_size, 0);

        for off in [HEADER_WINDOW - 8, HEADER_WINDOW] {
            assert!(
                matches!(parse_header(&image_at(off)), Err(Error::HeaderNotFound)),
                "offset {off}"
            );
        }

        let short = &hdr.as_bytes()[..16];
        let got = parse_header(short).unwrap();
        assert_eq!(got.checksum, hdr.checksum);
        assert_eq!(got.rts_size, 0);
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut hdr = EsxHeader::new(EsxFlags::empty());
        hdr.checksum ^= 1;
        let mut img = vec![0u8; 64];
        img[..48].copy_from_slice(hdr.as_bytes());
        assert!(matches!(parse_header(&img), Err(Error::HeaderNotFound)));
    }

    #[test]
    fn empty_info_bytes() {
        let info = EsxInfo { cmdline: 0xdeadbeef, elems: vec![] };
        assert_eq!(
            info.marshal(),
            vec![0xEF, 0xBE, 0xAD, 0xDE, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn sample_info_bytes() {
        let info = EsxInfo {
            cmdline: 0x0010_2000,
            elems: vec![
                Elem::MemRange { start: 0x1000, length: 0x2000, mem_type: 1 },
                Elem::module(&ModuleRecord { start: 0x0010_3000, end: 0x0010_4005, cmdline: 0, reserved: 0 }),
                Elem::module(&ModuleRecord { start: 0x0010_5000, end: 0x0010_5000, cmdline: 0, reserved: 0 }),
            ],
        };
        #[rustfmt::skip]
        let expected: Vec<u8> = [
            // cmdline, elem count
            &[0x00, 0x20, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00][..],
            &[0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            // memrange: type 1, length 32
            &[0x01, 0x00, 0x00, 0x00],
            &[0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x01, 0x00, 0x00, 0x00],
            // module: type 2, length 40, size 0x1005, 1 range, page 0x103, 2 pages
            &[0x02, 0x00, 0x00, 0x00],
            &[0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x05, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x01, 0x00, 0x00, 0x00],
            &[0x03, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x02, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x00, 0x00],
            // empty module: size 0, 1 range, page 0x105, 0 pages
            &[0x02, 0x00, 0x00, 0x00],
            &[0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x01, 0x00, 0x00, 0x00],
            &[0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x00, 0x00],
        ]
        .concat();
        assert_eq!(info.marshal(), expected);
    }

    #[test]
    fn build_places_cmdline_in_staging() {
        let mut mem = pc_memory();
        let mut mods = vec![Module::from_bytes("m0", vec![9; 4097])];
        let req = InfoRequest { cmdline: "vmkernel -v", bootloader_name: "unused" };
        let layout = build_info(&mut mem, &req, &mut mods).unwrap();

        assert!(layout.info.is_none());
        assert_eq!(layout.bootloader, None);
        // staging buffer, then info
        let segs = mem.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].phys.start, M1);
        assert_eq!(&segs[0].buf[..12], b"vmkernel -v\0");
        assert_eq!(layout.addr, segs[1].phys.start);

        let info = &segs[1].buf;
        assert_eq!(&info[0..8], &M1.to_le_bytes());
        // 3 memory ranges + 1 module
        assert_eq!(&info[8..16], &4u64.to_le_bytes());
        let module_elem = 16 + 3 * 32;
        assert_eq!(&info[module_elem..module_elem + 4], &2u32.to_le_bytes());
        let page = (M1 + PAGE_SIZE) / PAGE_SIZE;
        assert_eq!(&info[module_elem + 24..module_elem + 32], &page.to_le_bytes());
        assert_eq!(&info[module_elem + 32..module_elem + 36], &2u32.to_le_bytes());
    }
}
