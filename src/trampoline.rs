//! trampoline.rs — handover stub: byte template + relocation table
//!
//! The stub is entered by the kexec purgatory in 64-bit long mode with the
//! low 4 GiB identity mapped. It loads the three patched slots, drops to
//! 32-bit protected mode with paging off, and jumps to the kernel with
//! EAX = boot magic and EBX = info address.
//!
//! x86_64 template:
//!   0x00  code (64-bit part, then 32-bit part at 0x37)
//!   0x68  gdtr  { limit u16, base u64 }   base filled in at run time
//!   0x78  gdt   { null, code32 = 0x08, data32 = 0x10 }
//!   0x90  info  u64 slot
//!   0x98  entry u64 slot
//!   0xA0  magic u64 slot

use log::debug;

use crate::config::Arch;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    Info,
    Entry,
    Magic,
}

/// One patch site: `width` little-endian bytes at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    pub offset: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Template {
    pub arch: Arch,
    pub code: &'static [u8],
    pub relocs: &'static [Reloc],
}

#[rustfmt::skip]
const X86_64_CODE: [u8; 0xA8] = [
    // 0x00: 64-bit
    0xFA,                                       // cli
    0x48, 0x8B, 0x1D, 0x88, 0x00, 0x00, 0x00,   // mov rbx, [rip + info]
    0x48, 0x8B, 0x35, 0x91, 0x00, 0x00, 0x00,   // mov rsi, [rip + magic]
    0x48, 0x8B, 0x3D, 0x82, 0x00, 0x00, 0x00,   // mov rdi, [rip + entry]
    0x48, 0x8D, 0x05, 0x5B, 0x00, 0x00, 0x00,   // lea rax, [rip + gdt]
    0x48, 0x89, 0x05, 0x46, 0x00, 0x00, 0x00,   // mov [rip + gdtr.base], rax
    0x0F, 0x01, 0x15, 0x3D, 0x00, 0x00, 0x00,   // lgdt [rip + gdtr]
    0x6A, 0x08,                                 // push 0x08
    0x48, 0x8D, 0x05, 0x03, 0x00, 0x00, 0x00,   // lea rax, [rip + prot32]
    0x50,                                       // push rax
    0x48, 0xCB,                                 // retfq
    // 0x37: 32-bit compatibility mode
    0x0F, 0x20, 0xC0,                           // mov eax, cr0
    0x25, 0xFF, 0xFF, 0xFF, 0x7F,               // and eax, ~CR0.PG
    0x0F, 0x22, 0xC0,                           // mov cr0, eax
    0xB9, 0x80, 0x00, 0x00, 0xC0,               // mov ecx, IA32_EFER
    0x0F, 0x32,                                 // rdmsr
    0x25, 0xFF, 0xFE, 0xFF, 0xFF,               // and eax, ~EFER.LME
    0x0F, 0x30,                                 // wrmsr
    0x66, 0xB8, 0x10, 0x00,                     // mov ax, 0x10
    0x8E, 0xD8,                                 // mov ds, ax
    0x8E, 0xC0,                                 // mov es, ax
    0x8E, 0xE0,                                 // mov fs, ax
    0x8E, 0xE8,                                 // mov gs, ax
    0x8E, 0xD0,                                 // mov ss, ax
    0x89, 0xF0,                                 // mov eax, esi
    0xFF, 0xE7,                                 // jmp edi
    0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC,
    // 0x68: gdtr
    0x17, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // 0x78: gdt
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00,
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0xCF, 0x00,
    // 0x90: info, entry, magic
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const X86_64_RELOCS: [Reloc; 3] = [
    Reloc { kind: RelocKind::Info, offset: 0x90, width: 4 },
    Reloc { kind: RelocKind::Entry, offset: 0x98, width: 4 },
    Reloc { kind: RelocKind::Magic, offset: 0xA0, width: 4 },
];

pub const X86_64: Template = Template {
    arch: Arch::X86_64,
    code: &X86_64_CODE,
    relocs: &X86_64_RELOCS,
};

/// Template for `arch`, or [`Error::PlatformUnsupported`].
pub fn template_for(arch: Arch) -> Result<&'static Template> {
    match arch {
        Arch::X86_64 => Ok(&X86_64),
        other => Err(Error::PlatformUnsupported(other)),
    }
}

impl Template {
    /// Copy the template and write the three handover values into it.
    pub fn patch(&self, info: u64, entry: u64, magic: u32) -> Result<Vec<u8>> {
        let mut code = self.code.to_vec();
        for r in self.relocs {
            let value = match r.kind {
                RelocKind::Info => info,
                RelocKind::Entry => entry,
                RelocKind::Magic => magic as u64,
            };
            let end = r.offset.checked_add(r.width).unwrap_or(usize::MAX);
            if end > code.len() {
                return Err(Error::TruncatedInput { needed: end, available: code.len() });
            }
            if r.width < 8 && value >> (r.width * 8) != 0 {
                return Err(Error::AddressOverflow(value));
            }
            code[r.offset..end].copy_from_slice(&value.to_le_bytes()[..r.width]);
            debug!("[multiboot] trampoline {:?} = {value:#x} at {:#x}", r.kind, r.offset);
        }
        Ok(code)
    }
}

/// Patched trampoline bytes for `arch`.
pub fn setup(arch: Arch, info: u64, entry: u64, magic: u32) -> Result<Vec<u8>> {
    template_for(arch)?.patch(info, entry, magic)
}
