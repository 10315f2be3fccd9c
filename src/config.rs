//! config.rs — NØNOS multiboot loader configuration
//!
//! `LoadOptions` can be built in code or read from a TOML table, e.g.
//!
//! ```toml
//! debug = true
//! bootloader_name = "NØNOS kexec"
//! arch = "x86_64"
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

pub const DEFAULT_BOOTLOADER_NAME: &str = "NØNOS kexec";

/// Target architecture the trampoline is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
    Other,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Arch::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else if cfg!(target_arch = "riscv64") {
            Arch::Riscv64
        } else {
            Arch::Other
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::host()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadOptions {
    /// Emit the `MULTIBOOT_DEBUG_INFO:` description line after a load.
    pub debug: bool,
    /// Advertised in the classic info block's boot loader name field.
    pub bootloader_name: String,
    pub arch: Arch,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            debug: false,
            bootloader_name: DEFAULT_BOOTLOADER_NAME.into(),
            arch: Arch::host(),
        }
    }
}

impl LoadOptions {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_fill_missing_keys() {
        let opts = LoadOptions::from_toml_str("debug = true").unwrap();
        assert!(opts.debug);
        assert_eq!(opts.bootloader_name, DEFAULT_BOOTLOADER_NAME);
        assert_eq!(opts.arch, Arch::host());
    }

    #[test]
    fn reads_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bootloader_name = \"test loader\"\narch = \"aarch64\"").unwrap();
        let opts = LoadOptions::from_path(f.path()).unwrap();
        assert_eq!(opts.bootloader_name, "test loader");
        assert_eq!(opts.arch, Arch::Aarch64);
        assert!(!opts.debug);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(LoadOptions::from_toml_str("trampoline = \"/bin/x\"").is_err());
    }
}
