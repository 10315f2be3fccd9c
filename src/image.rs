//! image.rs — kernel image intake: gzip unwrap, header probe, header-kind dispatch

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};

use flate2::read::GzDecoder;
use xmas_elf::ElfFile;

use crate::error::{Error, Result};
use crate::esx::{self, EsxHeader};
use crate::header::{self, Header, HEADER_WINDOW};
use crate::info::{self, InfoLayout, InfoRequest};
use crate::kexec::MemoryPlanner;
use crate::module::Module;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wrap `r` in a gzip decoder if it starts with the gzip magic.
pub fn gzip_filter<'a, R: Read + 'a>(r: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut br = BufReader::new(r);
    if br.fill_buf()?.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(br)))
    } else {
        Ok(Box::new(br))
    }
}

/// Read a whole (possibly gzip'ed) image into memory.
pub fn read_image(r: impl Read) -> Result<Vec<u8>> {
    let mut image = Vec::new();
    gzip_filter(r)?.read_to_end(&mut image)?;
    Ok(image)
}

/// Check whether `kernel` is a multiboot v1 or ESX-style image.
///
/// Reads from the start of the source and puts the read position back where
/// it was, so probing twice yields the same answer.
pub fn probe<R: Read + Seek>(kernel: &mut R) -> Result<ImageKind> {
    let pos = kernel.stream_position()?;
    let window = read_window(kernel);
    kernel.seek(SeekFrom::Start(pos))?;
    ImageKind::detect(&window?)
}

fn read_window<R: Read + Seek>(kernel: &mut R) -> Result<Vec<u8>> {
    kernel.seek(SeekFrom::Start(0))?;
    let mut window = Vec::with_capacity(HEADER_WINDOW);
    gzip_filter(kernel.by_ref())?
        .take(HEADER_WINDOW as u64)
        .read_to_end(&mut window)?;
    Ok(window)
}

/// ELF entry point of the kernel.
pub fn entry_point(kernel: &[u8]) -> Result<u64> {
    let elf = ElfFile::new(kernel).map_err(Error::Elf)?;
    Ok(elf.header.pt2.entry_point())
}

/// The closed set of boot protocols this loader speaks, keyed by which
/// header matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Multiboot(Header),
    EsxBootInfo(EsxHeader),
}

impl ImageKind {
    /// Classic header first; the ESX-style header only if no classic one exists.
    pub fn detect(image: &[u8]) -> Result<Self> {
        match header::parse_header(image) {
            Ok(hdr) => Ok(ImageKind::Multiboot(hdr)),
            Err(Error::HeaderNotFound) => esx::parse_header(image).map(ImageKind::EsxBootInfo),
            Err(e) => Err(e),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImageKind::Multiboot(_) => "multiboot",
            ImageKind::EsxBootInfo(_) => "esxbootinfo",
        }
    }

    /// Value the trampoline loads into EAX before the jump.
    pub fn boot_magic(&self) -> u32 {
        match self {
            ImageKind::Multiboot(_) => header::BOOT_MAGIC,
            ImageKind::EsxBootInfo(_) => esx::BOOT_MAGIC,
        }
    }

    /// Lay out this protocol's boot information through `planner`.
    pub fn build_info<P: MemoryPlanner>(
        &self,
        planner: &mut P,
        req: &InfoRequest<'_>,
        modules: &mut [Module],
    ) -> Result<InfoLayout> {
        match self {
            ImageKind::Multiboot(hdr) => info::build_info(hdr, planner, req, modules),
            ImageKind::EsxBootInfo(_) => esx::build_info(planner, req, modules),
        }
    }
}
