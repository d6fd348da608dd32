//! Parser for the DfuSe alternate-setting name string that describes a
//! target's memory layout, e.g. `@Internal Flash/0x08000000/4*016Kg,1*064Kg,7*128Kg`.
//!
//! Grounded on `sourcebox-dfu-buddy`'s `dfudev/dfuse.rs` `MemorySegment`
//! parser, adapted from its `regex`-based approach to a hand-rolled scanner
//! since this crate does not otherwise depend on `regex`.

use bitflags::bitflags;

use crate::error::Error;

bitflags! {
    /// Per-sector capability flags, the single letter suffix after the
    /// sector size. AN3156 assigns each sector type letter a..g a 1-based
    /// bitmask of `readable=1`, `erasable=2`, `writeable=4`: `a`=readable,
    /// `b`=erasable, `c`=readable+erasable, `d`=writeable,
    /// `e`=readable+writeable, `f`=erasable+writeable,
    /// `g`=readable+erasable+writeable.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SectorFlags: u8 {
        const READABLE = 0x01;
        const ERASABLE = 0x02;
        const WRITEABLE = 0x04;
    }
}

/// One `count*size<unit><flags>` run within a memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRun {
    pub count: u32,
    pub size: u32,
    pub flags: SectorFlags,
}

/// One `/`-delimited memory region, e.g. `Internal Flash` at
/// `0x08000000` made up of several [`SectorRun`]s.
#[derive(Debug, Clone)]
pub struct MemorySegment {
    pub name: String,
    pub start: u32,
    pub runs: Vec<SectorRun>,
}

impl MemorySegment {
    pub fn total_size(&self) -> u32 {
        self.runs.iter().map(|r| r.count * r.size).sum()
    }

    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.total_size())
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end()
    }

    /// Find the sector run covering `address`, and that run's start address.
    pub fn sector_at(&self, address: u32) -> Option<(u32, SectorRun)> {
        if !self.contains(address) {
            return None;
        }
        let mut cursor = self.start;
        for run in &self.runs {
            let run_len = run.count * run.size;
            if address < cursor + run_len {
                let sector_index = (address - cursor) / run.size;
                return Some((cursor + sector_index * run.size, *run));
            }
            cursor += run_len;
        }
        None
    }
}

/// Parse every `@...` segment out of an interface's alternate-setting name,
/// corresponding to dfu-util's `dfuse_parse_memory_layout` (`dfuse.c`).
pub fn parse_memory_layout(alt_name: &str) -> Result<Vec<MemorySegment>, Error> {
    parse_segments(alt_name)
}

fn parse_segments(alt_name: &str) -> Result<Vec<MemorySegment>, Error> {
    let alt_name = alt_name.trim();
    if !alt_name.starts_with('@') {
        return Err(Error::FileFormatError(format!(
            "alternate setting name \"{alt_name}\" is not a DfuSe memory layout string"
        )));
    }

    // Layout: "@name/addr/run,run,...[;/name2/addr2/run2,...]"
    // dfu-util accepts repeated "/name/addr/runs" groups separated by '/'
    // after the first; in practice one name precedes one address and one
    // run list, so we parse a single segment per call and the caller loops
    // over ';'-joined alternate settings if a device uses more than one.
    let body = &alt_name[1..];
    let mut parts = body.splitn(3, '/');
    let name = parts
        .next()
        .ok_or_else(|| Error::FileFormatError("missing segment name".into()))?
        .trim()
        .to_string();
    let addr_str = parts
        .next()
        .ok_or_else(|| Error::FileFormatError("missing segment start address".into()))?;
    let runs_str = parts
        .next()
        .ok_or_else(|| Error::FileFormatError("missing segment sector list".into()))?;

    let start = parse_hex_u32(addr_str)?;
    let runs = runs_str
        .trim_end_matches('/')
        .split(',')
        .map(parse_run)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(vec![MemorySegment { name, start, runs }])
}

fn parse_hex_u32(s: &str) -> Result<u32, Error> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u32::from_str_radix(s, 16)
        .map_err(|_| Error::FileFormatError(format!("invalid address \"{s}\"")))
}

/// Parse one `count*sizeUNITflags` run, e.g. `4*016Kg`.
fn parse_run(run: &str) -> Result<SectorRun, Error> {
    let run = run.trim();
    let (count_str, rest) = run
        .split_once('*')
        .ok_or_else(|| Error::FileFormatError(format!("malformed sector run \"{run}\"")))?;
    let count: u32 = count_str
        .parse()
        .map_err(|_| Error::FileFormatError(format!("bad sector count in \"{run}\"")))?;

    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (size_str, rest) = rest.split_at(digits_end);
    let mut size: u32 = size_str
        .parse()
        .map_err(|_| Error::FileFormatError(format!("bad sector size in \"{run}\"")))?;

    let mut chars = rest.chars();
    let unit = chars.next();
    let flag_str: String = match unit {
        Some('K') => {
            size *= 1024;
            chars.collect()
        }
        Some('M') => {
            size *= 1024 * 1024;
            chars.collect()
        }
        Some(c) => std::iter::once(c).chain(chars).collect(),
        None => String::new(),
    };

    let mut flags = SectorFlags::empty();
    for c in flag_str.chars() {
        flags |= match c {
            'a' => SectorFlags::READABLE,
            'b' => SectorFlags::ERASABLE,
            'c' => SectorFlags::READABLE | SectorFlags::ERASABLE,
            'd' => SectorFlags::WRITEABLE,
            'e' => SectorFlags::READABLE | SectorFlags::WRITEABLE,
            'f' => SectorFlags::ERASABLE | SectorFlags::WRITEABLE,
            'g' => SectorFlags::READABLE | SectorFlags::ERASABLE | SectorFlags::WRITEABLE,
            _ => {
                return Err(Error::FileFormatError(format!(
                    "unknown sector flag '{c}' in \"{run}\""
                )))
            }
        };
    }

    Ok(SectorRun { count, size, flags })
}

/// Find the memory segment (if any) that contains `address`, across every
/// parsed alternate setting's layout.
pub fn find_segment(segments: &[MemorySegment], address: u32) -> Option<&MemorySegment> {
    segments.iter().find(|s| s.contains(address))
}
