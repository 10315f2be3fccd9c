//! error.rs — NØNOS multiboot loader errors
//!
//! Every failure the loader can surface is a variant of [`Error`]. The load
//! orchestrator wraps each failure with the [`Stage`] it happened in, so a
//! caller can tell a bad kernel image apart from an exhausted memory planner
//! or from a platform that cannot multiboot at all.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Arch;
use crate::kexec::Range;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// No aligned window in the scanned prefix held a valid header.
    #[error("multiboot header not found")]
    HeaderNotFound,

    /// A checksum-valid classic header requested features we do not implement.
    #[error("multiboot header requests unsupported flags {0:#010x}")]
    UnsupportedFlags(u32),

    #[error("truncated input: need {needed} bytes, have {available}")]
    TruncatedInput { needed: usize, available: usize },

    /// No trampoline template exists for this architecture. Fatal for
    /// multiboot; callers should pick a different boot method.
    #[error("no multiboot trampoline for platform {0}")]
    PlatformUnsupported(Arch),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("module {name}: {source}")]
    Module {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("ELF: {0}")]
    Elf(&'static str),

    #[error("not enough space to allocate {size:#x} bytes in {limit}")]
    NotEnoughSpace { size: u64, limit: Range },

    /// Multiboot info pointers and trampoline slots are 32 bits wide.
    #[error("address {0:#x} does not fit in 32 bits")]
    AddressOverflow(u64),

    #[error("segment {0} overlaps an existing segment")]
    SegmentOverlap(Range),

    #[error("memory map {}: {reason}", path.display())]
    Memmap { path: PathBuf, reason: String },

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("description: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Strip stage wrappers and return the underlying failure.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Stage { source, .. } = err {
            err = source;
        }
        err
    }

    /// Stage the failure was tagged with, if it came out of the orchestrator.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_platform_unsupported(&self) -> bool {
        matches!(self.root(), Error::PlatformUnsupported(_))
    }
}

/// Orchestrator stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ParseHeader,
    ResolveEntryPoint,
    LoadElfSegments,
    ParseMemoryMap,
    ReserveFirmwareTable,
    BuildInfo,
    BuildTrampoline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ParseHeader => "parse header",
            Stage::ResolveEntryPoint => "resolve entry point",
            Stage::LoadElfSegments => "load ELF segments",
            Stage::ParseMemoryMap => "parse memory map",
            Stage::ReserveFirmwareTable => "reserve firmware table",
            Stage::BuildInfo => "build info",
            Stage::BuildTrampoline => "build trampoline",
        };
        f.write_str(s)
    }
}

/// Tag a failing result with the stage that produced it.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| Error::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}
