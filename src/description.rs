//! description.rs — one-line JSON summary of a finished layout
//!
//! Verification tooling greps boot logs for [`DEBUG_PREFIX`] and parses the
//! JSON that follows. The line format is a contract; keep it single-line.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::image::ImageKind;
use crate::info::InfoLayout;

pub const DEBUG_PREFIX: &str = "MULTIBOOT_DEBUG_INFO:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmapDesc {
    pub size: u32,
    pub base_addr: u64,
    pub length: u64,
    #[serde(rename = "type")]
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDesc {
    pub start: u32,
    pub end: u32,
    pub cmdline: String,
    /// Hex SHA-256 of the staged payload.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub kind: String,
    pub status: String,
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub mmap_addr: u32,
    pub mmap_length: u32,
    pub cmdline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<String>,
    pub mmap: Vec<MmapDesc>,
    pub modules: Vec<ModuleDesc>,
}

impl Description {
    /// Summarize an already-built layout. Reads only; never places anything.
    pub fn from_layout(kind: &ImageKind, layout: &InfoLayout) -> Self {
        let (flags, mem_lower, mem_upper, mmap_addr, mmap_length) = match layout.info {
            Some(inf) => (inf.flags, inf.mem_lower, inf.mem_upper, inf.mmap_addr, inf.mmap_length),
            None => (0, 0, 0, 0, 0),
        };

        let mmap = layout
            .memory_map
            .iter()
            .map(|e| MmapDesc {
                size: e.size,
                base_addr: e.base_addr,
                length: e.length,
                ty: e.ty,
            })
            .collect();

        let modules = layout
            .modules
            .iter()
            .zip(&layout.module_cmdlines)
            .zip(&layout.module_hashes)
            .map(|((rec, cmdline), hash)| ModuleDesc {
                start: rec.start,
                end: rec.end,
                cmdline: cmdline.clone(),
                sha256: hex::encode(hash),
            })
            .collect();

        Self {
            kind: kind.name().to_owned(),
            status: "ok".to_owned(),
            flags,
            mem_lower,
            mem_upper,
            mmap_addr,
            mmap_length,
            cmdline: layout.cmdline.clone(),
            bootloader: layout.bootloader.clone(),
            mmap,
            modules,
        }
    }

    /// `MULTIBOOT_DEBUG_INFO: {...}`
    pub fn debug_line(&self) -> Result<String> {
        Ok(format!("{DEBUG_PREFIX} {}", serde_json::to_string(self)?))
    }

    /// Inverse of [`Description::debug_line`], for log scrapers.
    pub fn parse_debug_line(line: &str) -> Option<Self> {
        let json = line.split_once(DEBUG_PREFIX)?.1;
        serde_json::from_str(json.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Header, HeaderFlags};
    use crate::info::{build_info, InfoRequest};
    use crate::kexec::memory::tests::pc_memory;
    use crate::module::Module;
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};

    fn layout() -> (ImageKind, InfoLayout) {
        let hdr = Header::new(HeaderFlags::MEMORY_INFO);
        let mut mem = pc_memory();
        let mut mods = vec![Module::from_bytes("initrd.img ro\nquiet", b"payload".to_vec())];
        let req = InfoRequest { cmdline: "a \"quoted\" cmdline", bootloader_name: "loader" };
        let layout = build_info(&hdr, &mut mem, &req, &mut mods).unwrap();
        (ImageKind::Multiboot(hdr), layout)
    }

    #[test]
    fn single_line_with_prefix() {
        let (kind, layout) = layout();
        let line = Description::from_layout(&kind, &layout).debug_line().unwrap();
        assert!(line.starts_with("MULTIBOOT_DEBUG_INFO: {"));
        assert!(!line.contains('\n'));
    }

    #[test]
    fn fields_follow_layout() {
        let (kind, layout) = layout();
        let desc = Description::from_layout(&kind, &layout);
        let inf = layout.info.unwrap();

        assert_eq!(desc.kind, "multiboot");
        assert_eq!(desc.flags, { inf.flags });
        assert_eq!(desc.mem_lower, 640);
        assert_eq!(desc.mmap.len(), 3);
        assert_eq!(desc.mmap[0].ty, 1);
        assert_eq!(desc.bootloader.as_deref(), Some("loader"));
        assert_eq!(desc.modules[0].start, layout.modules[0].start);
        assert_eq!(desc.modules[0].sha256, hex::encode(Sha256::digest(b"payload")));
    }

    #[test]
    fn parse_round_trips_log_line() {
        let (kind, layout) = layout();
        let desc = Description::from_layout(&kind, &layout);
        let logged = format!("[INFO] {}", desc.debug_line().unwrap());
        assert_eq!(Description::parse_debug_line(&logged), Some(desc));
        assert_eq!(Description::parse_debug_line("unrelated"), None);
    }

    #[test]
    fn json_keys() {
        let (kind, layout) = layout();
        let v = serde_json::to_value(Description::from_layout(&kind, &layout)).unwrap();
        for key in ["kind", "status", "flags", "mem_lower", "mem_upper", "mmap_addr", "mmap_length", "cmdline", "bootloader", "mmap", "modules"] {
            assert!(v.get(key).is_some(), "{key}");
        }
        assert!(v["mmap"][0].get("type").is_some());
        assert!(v["modules"][0].get("sha256").is_some());
    }
}
