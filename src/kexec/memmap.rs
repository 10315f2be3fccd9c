//! memmap.rs — NØNOS kexec typed physical memory map, as firmware reports it to Linux

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use log::warn;

use super::range::{Range, Ranges};
use crate::error::{Error, Result};

pub const SYSFS_MEMMAP_ROOT: &str = "/sys/firmware/memmap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeType {
    Ram,
    Default,
    Acpi,
    Nvs,
    Reserved,
}

impl RangeType {
    /// Parse a `/sys/firmware/memmap/*/type` string.
    pub fn from_sysfs(s: &str) -> Option<Self> {
        match s {
            "System RAM" => Some(RangeType::Ram),
            "Default" => Some(RangeType::Default),
            "ACPI Tables" => Some(RangeType::Acpi),
            "ACPI Non-volatile Storage" => Some(RangeType::Nvs),
            "Reserved" | "reserved" => Some(RangeType::Reserved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeType::Ram => "System RAM",
            RangeType::Default => "Default",
            RangeType::Acpi => "ACPI Tables",
            RangeType::Nvs => "ACPI Non-volatile Storage",
            RangeType::Reserved => "Reserved",
        }
    }
}

impl fmt::Display for RangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedRange {
    pub range: Range,
    pub ty: RangeType,
}

impl TypedRange {
    pub fn new(start: u64, size: u64, ty: RangeType) -> Self {
        Self { range: Range::new(start, size), ty }
    }
}

impl fmt::Display for TypedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{addr: {}, type: {}}}", self.range, self.ty)
    }
}

/// Layout of physical memory: which ranges are usable RAM and which are not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMap(pub Vec<TypedRange>);

impl MemoryMap {
    pub fn iter(&self) -> impl Iterator<Item = &TypedRange> {
        self.0.iter()
    }

    pub fn filter_by_type(&self, ty: RangeType) -> Ranges {
        self.0.iter().filter(|tr| tr.ty == ty).map(|tr| tr.range).collect()
    }

    pub fn ram(&self) -> Ranges {
        self.filter_by_type(RangeType::Ram)
    }

    /// Insert `r`, cutting its points out of every existing range.
    pub fn insert(&mut self, r: TypedRange) {
        let mut out: Vec<TypedRange> = self
            .0
            .iter()
            .flat_map(|q| {
                q.range
                    .minus(&r.range)
                    .into_iter()
                    .map(move |range| TypedRange { range, ty: q.ty })
            })
            .collect();
        out.push(r);
        out.sort_by_key(|tr| tr.range.start);
        self.0 = out;
    }

    /// Read the firmware memory map Linux exports under `dir`
    /// (`<n>/start`, `<n>/end`, `<n>/type`; `end` is inclusive).
    pub fn from_sysfs(dir: &Path) -> Result<Self> {
        #[derive(Default)]
        struct Raw {
            start: Option<u64>,
            end: Option<u64>,
            ty: Option<RangeType>,
        }

        let mut raw: BTreeMap<String, Raw> = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            let r = raw.entry(key).or_default();
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let path = file.path();
                let name = file.file_name().to_string_lossy().into_owned();
                let data = fs::read_to_string(&path)?;
                let data = data.trim();
                match name.as_str() {
                    "type" => {
                        r.ty = Some(RangeType::from_sysfs(data).unwrap_or_else(|| {
                            warn!(
                                "[kexec] {} has unrecognized memory map type {:?}, defaulting to Reserved",
                                path.display(),
                                data
                            );
                            RangeType::Reserved
                        }));
                    }
                    "start" | "end" => {
                        let v = parse_u64(data).ok_or_else(|| Error::Memmap {
                            path: path.clone(),
                            reason: format!("bad address {data:?}"),
                        })?;
                        if name == "start" {
                            r.start = Some(v);
                        } else {
                            r.end = Some(v);
                        }
                    }
                    _ => {
                        return Err(Error::Memmap {
                            path,
                            reason: "unexpected file".into(),
                        })
                    }
                }
            }
        }

        let mut phys = Vec::with_capacity(raw.len());
        for (key, r) in raw {
            let bad = |reason: &str| Error::Memmap {
                path: dir.join(&key),
                reason: reason.into(),
            };
            let (Some(start), Some(end)) = (r.start, r.end) else {
                return Err(bad("missing start/end"));
            };
            if end < start || end == u64::MAX {
                return Err(bad("bad range"));
            }
            phys.push(TypedRange {
                range: Range::from_interval(start, end + 1),
                ty: r.ty.unwrap_or(RangeType::Reserved),
            });
        }
        phys.sort_by_key(|tr| tr.range.start);
        Ok(MemoryMap(phys))
    }
}

/// `0x`-prefixed hex, `0`-prefixed octal, or decimal.
fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_entry(dir: &Path, n: &str, start: &str, end: &str, ty: &str) {
        let d = dir.join(n);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("start"), format!("{start}\n")).unwrap();
        fs::write(d.join("end"), format!("{end}\n")).unwrap();
        fs::write(d.join("type"), format!("{ty}\n")).unwrap();
    }

    #[test]
    fn sysfs_memmap() {
        let tmp = tempfile::tempdir().unwrap();
        write_entry(tmp.path(), "0", "0x0", "0x9fbff", "System RAM");
        write_entry(tmp.path(), "1", "0x100000", "0x7ffdffff", "System RAM");
        write_entry(tmp.path(), "2", "0x9fc00", "0x9ffff", "Reserved");
        write_entry(tmp.path(), "3", "0xfeffc000", "0xfeffffff", "Bogus");

        let mm = MemoryMap::from_sysfs(tmp.path()).unwrap();
        assert_eq!(
            mm.0,
            vec![
                TypedRange::new(0, 0x9fc00, RangeType::Ram),
                TypedRange::new(0x9fc00, 0x400, RangeType::Reserved),
                TypedRange::new(0x100000, 0x7fee0000, RangeType::Ram),
                TypedRange::new(0xfeffc000, 0x4000, RangeType::Reserved),
            ]
        );
    }

    #[test]
    fn sysfs_rejects_stray_files() {
        let tmp = tempfile::tempdir().unwrap();
        write_entry(tmp.path(), "0", "0x0", "0xfff", "System RAM");
        fs::write(tmp.path().join("0").join("flags"), "1").unwrap();
        assert!(matches!(
            MemoryMap::from_sysfs(tmp.path()),
            Err(Error::Memmap { .. })
        ));
    }

    #[test]
    fn sysfs_rejects_missing_end() {
        let tmp = tempfile::tempdir().unwrap();
        let d = tmp.path().join("0");
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("start"), "0x100000\n").unwrap();
        fs::write(d.join("type"), "System RAM\n").unwrap();
        match MemoryMap::from_sysfs(tmp.path()) {
            Err(Error::Memmap { path, reason }) => {
                assert_eq!(path, d);
                assert_eq!(reason, "missing start/end");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sysfs_rejects_inverted_range() {
        let tmp = tempfile::tempdir().unwrap();
        write_entry(tmp.path(), "0", "0x2000", "0xfff", "System RAM");
        assert!(matches!(
            MemoryMap::from_sysfs(tmp.path()),
            Err(Error::Memmap { reason, .. }) if reason == "bad range"
        ));

        let tmp = tempfile::tempdir().unwrap();
        write_entry(tmp.path(), "0", "0x0", "0xffffffffffffffff", "Reserved");
        assert!(matches!(
            MemoryMap::from_sysfs(tmp.path()),
            Err(Error::Memmap { reason, .. }) if reason == "bad range"
        ));
    }

    #[test]
    fn insert_carves_hole() {
        let mut mm = MemoryMap(vec![TypedRange::new(0, 0x10000, RangeType::Ram)]);
        mm.insert(TypedRange::new(0x4000, 0x1000, RangeType::Reserved));
        assert_eq!(
            mm.0,
            vec![
                TypedRange::new(0, 0x4000, RangeType::Ram),
                TypedRange::new(0x4000, 0x1000, RangeType::Reserved),
                TypedRange::new(0x5000, 0xb000, RangeType::Ram),
            ]
        );
        assert_eq!(mm.ram().len(), 2);
    }

    #[test]
    fn parse_numbers() {
        assert_eq!(parse_u64("0x10"), Some(16));
        assert_eq!(parse_u64("010"), Some(8));
        assert_eq!(parse_u64("10"), Some(10));
        assert_eq!(parse_u64("0"), Some(0));
        assert_eq!(parse_u64("zz"), None);
    }
}
