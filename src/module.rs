//! module.rs — boot module staging
//!
//! All module command lines (and any extra strings the info builder needs)
//! go first, each NUL-terminated. Payloads follow, each starting on a page
//! boundary. The buffer is committed in one piece; record offsets are
//! relative until then and absolute afterwards.
//!
//!   +----------------------+ 0
//!   | "name\0cmd\0m1 a\0.."| strings
//!   +----------------------+ page
//!   | module 0 payload     |
//!   +----------------------+ page
//!   | module 1 payload     |
//!   +----------------------+

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::image::gzip_filter;
use crate::kexec::{range::align_up, MemoryPlanner, PAGE_SIZE};

/// A boot module: a payload source plus the command line the kernel sees.
pub struct Module {
    pub cmdline: String,
    payload: Box<dyn Read>,
}

impl Module {
    pub fn new(cmdline: impl Into<String>, payload: impl Read + 'static) -> Self {
        Self {
            cmdline: cmdline.into(),
            payload: Box::new(payload),
        }
    }

    pub fn from_bytes(cmdline: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(cmdline, Cursor::new(payload))
    }

    /// Open `"path arg1 arg2"`: the first field names the file, the whole
    /// string is the module's command line.
    pub fn open(cmd: &str) -> Result<Self> {
        let path = cmd.split_whitespace().next().unwrap_or_default();
        let f = File::open(path).map_err(|source| Error::Module {
            name: path.to_owned(),
            source,
        })?;
        Ok(Self::new(cmd, f))
    }

    /// Like [`Module::open`], but the file is opened on the first read, so a
    /// long module list does not hold every descriptor at once.
    pub fn lazy(cmd: &str) -> Self {
        let path = cmd.split_whitespace().next().unwrap_or_default();
        Self::new(cmd, LazyFile { path: PathBuf::from(path), file: None })
    }

    /// First field of the command line, if any.
    pub fn name(&self) -> &str {
        self.cmdline.split_whitespace().next().unwrap_or_default()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module").field("cmdline", &self.cmdline).finish_non_exhaustive()
    }
}

pub fn open_modules<S: AsRef<str>>(cmds: &[S]) -> Result<Vec<Module>> {
    cmds.iter().map(|c| Module::open(c.as_ref())).collect()
}

pub fn lazy_open_modules<S: AsRef<str>>(cmds: &[S]) -> Vec<Module> {
    cmds.iter().map(|c| Module::lazy(c.as_ref())).collect()
}

struct LazyFile {
    path: PathBuf,
    file: Option<File>,
}

impl Read for LazyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.file.is_none() {
            let f = File::open(&self.path).map_err(|e| {
                io::Error::new(e.kind(), format!("module {}: {e}", self.path.display()))
            })?;
            self.file = Some(f);
        }
        match self.file.as_mut() {
            Some(f) => f.read(buf),
            None => Ok(0),
        }
    }
}

/// Wire record the kernel walks at `mods_addr`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsBytes, FromBytes)]
pub struct ModuleRecord {
    pub start: u32,
    /// Exclusive.
    pub end: u32,
    pub cmdline: u32,
    pub reserved: u32,
}

impl ModuleRecord {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Records as the flat array the classic info block points at.
pub fn marshal_records(records: &[ModuleRecord]) -> Vec<u8> {
    records.as_bytes().to_vec()
}

/// Builds the combined strings + payloads buffer.
#[derive(Debug, Default)]
pub struct ModuleStager {
    buf: Vec<u8>,
}

impl ModuleStager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `s` NUL-terminated; returns its offset in the buffer.
    pub fn push_str(&mut self, s: &str) -> Result<u32> {
        let off = offset32(self.buf.len())?;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(off)
    }

    /// Write every module's command line, then every payload page-aligned.
    pub fn stage(mut self, modules: &mut [Module]) -> Result<StagedModules> {
        let mut records = vec![ModuleRecord::default(); modules.len()];
        for (rec, m) in records.iter_mut().zip(modules.iter()) {
            rec.cmdline = self.push_str(&m.cmdline)?;
        }

        let mut hashes: Vec<[u8; 32]> = Vec::with_capacity(modules.len());
        for (rec, m) in records.iter_mut().zip(modules.iter_mut()) {
            let start = align_up(self.buf.len() as u64, PAGE_SIZE) as usize;
            self.buf.resize(start, 0);
            gzip_filter(&mut m.payload)?.read_to_end(&mut self.buf)?;
            rec.start = offset32(start)?;
            rec.end = offset32(self.buf.len())?;
            hashes.push(Sha256::digest(&self.buf[start..]).into());
        }

        Ok(StagedModules {
            buf: self.buf,
            records,
            hashes,
        })
    }
}

/// Staged buffer with buffer-relative records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedModules {
    pub buf: Vec<u8>,
    pub records: Vec<ModuleRecord>,
    pub hashes: Vec<[u8; 32]>,
}

impl StagedModules {
    /// Hand the buffer to `planner` and rebase every record onto the
    /// physical address it landed at. Consumes `self`, so the fix-up runs
    /// exactly once per commit.
    pub fn commit<P: MemoryPlanner>(self, planner: &mut P) -> Result<CommittedModules> {
        let r = planner.add_segment(self.buf)?;
        let base = addr32(r.start)?;
        addr32(r.end())?;
        let records = fix(self.records, base);
        Ok(CommittedModules {
            base,
            records,
            hashes: self.hashes,
        })
    }
}

fn fix(mut records: Vec<ModuleRecord>, base: u32) -> Vec<ModuleRecord> {
    for rec in &mut records {
        rec.start += base;
        rec.end += base;
        rec.cmdline += base;
    }
    records
}

/// Staged buffer after commit: records hold physical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedModules {
    pub base: u32,
    pub records: Vec<ModuleRecord>,
    pub hashes: Vec<[u8; 32]>,
}

impl CommittedModules {
    /// Physical address of something pushed at buffer offset `off`.
    pub fn addr(&self, off: u32) -> u32 {
        self.base + off
    }
}

fn offset32(off: usize) -> Result<u32> {
    u32::try_from(off).map_err(|_| Error::AddressOverflow(off as u64))
}

pub(crate) fn addr32(addr: u64) -> Result<u32> {
    u32::try_from(addr).map_err(|_| Error::AddressOverflow(addr))
}
