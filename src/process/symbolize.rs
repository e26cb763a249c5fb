//! # Symbolization
//!
//! DWARF-based address to source resolution, built on a vmlinux image with
//! debug information. Used to annotate native stack frames with file/line
//! info and inline chains, and to expand compile-unit filters into function
//! lists.

use std::{borrow::Cow, fs, path::{Path, PathBuf}};

use addr2line::{
    gimli,
    object::{self, Object, ObjectSection},
    Context,
};
use anyhow::{anyhow, Result};
use log::debug;
use memmap2::Mmap;
use nix::sys::utsname::uname;

/// Symbolization level, as selected with -s/-ss/-sn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum SymbMode {
    /// Line info when a debug image can be found.
    #[default]
    Default,
    /// No extra symbolization.
    None,
    /// Line info; the debug image is mandatory.
    LineInfo,
    /// Line info plus inline function chains.
    Inlines,
}

/// One resolved frame. A single address yields several of those when the
/// location is inside inlined functions.
#[derive(Clone)]
pub(crate) struct SymbolizedFrame {
    pub(crate) name: String,
    /// "file:line", empty when unknown.
    pub(crate) location: String,
}

pub(crate) struct Symbolizer {
    ctx: Context<gimli::EndianRcSlice<gimli::RunTimeEndian>>,
    inlines: bool,
}

impl Symbolizer {
    /// Build a symbolizer from a vmlinux image carrying DWARF info.
    pub(crate) fn from_image(path: &Path, inlines: bool) -> Result<Symbolizer> {
        let file = fs::File::open(path)
            .map_err(|e| anyhow!("Could not open {}: {e}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };
        let object = object::File::parse(&mmap[..])?;
        // The context copies the debug sections it needs, the mapping does
        // not have to outlive this function.
        let ctx = Context::new(&object)?;

        Ok(Symbolizer { ctx, inlines })
    }

    /// Resolve an address to its source location, including the inline chain
    /// when enabled. Frames are returned innermost first; the last one is the
    /// actual (non-inlined) function. Empty on resolution miss.
    pub(crate) fn symbolize(&self, addr: u64) -> Vec<SymbolizedFrame> {
        match self.try_symbolize(addr) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("Could not symbolize {addr:#x}: {e}");
                Vec::new()
            }
        }
    }

    fn try_symbolize(&self, addr: u64) -> Result<Vec<SymbolizedFrame>> {
        let mut frames = Vec::new();
        let mut iter = self.ctx.find_frames(addr).skip_all_loads()?;

        while let Some(frame) = iter.next()? {
            let name = match frame.function.as_ref() {
                Some(function) => function.raw_name()?.to_string(),
                None => String::new(),
            };
            let location = match frame.location.as_ref() {
                Some(location) => match (location.file, location.line) {
                    (Some(file), Some(line)) => format!("{file}:{line}"),
                    (Some(file), None) => file.to_string(),
                    _ => String::new(),
                },
                None => String::new(),
            };

            frames.push(SymbolizedFrame { name, location });
        }

        // Without inlines requested, keep only the outermost frame, aka. the
        // actual function.
        if !self.inlines && frames.len() > 1 {
            frames.drain(..frames.len() - 1);
        }

        Ok(frames)
    }
}

/// List the functions defined in a DWARF compile unit whose name ends with
/// `cu`. Used to expand ":CU" filter arguments.
pub(crate) fn compile_unit_functions(path: &Path, cu: &str) -> Result<Vec<String>> {
    let file = fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let object = object::File::parse(&mmap[..])?;

    let endian = match object.is_little_endian() {
        true => gimli::RunTimeEndian::Little,
        false => gimli::RunTimeEndian::Big,
    };

    let load_section = |id: gimli::SectionId| -> Result<Cow<[u8]>, gimli::Error> {
        Ok(match object.section_by_name(id.name()) {
            Some(section) => section.uncompressed_data().unwrap_or(Cow::Borrowed(&[])),
            None => Cow::Borrowed(&[]),
        })
    };
    let dwarf_cow = gimli::Dwarf::load(load_section)?;
    let dwarf = dwarf_cow.borrow(|section| gimli::EndianSlice::new(section, endian));

    let mut funcs = Vec::new();
    let mut units = dwarf.units();

    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;

        let name = match unit.name {
            Some(name) => String::from_utf8_lossy(name.slice()).into_owned(),
            None => continue,
        };
        if !name.ends_with(cu) {
            continue;
        }

        let mut entries = unit.entries();
        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_subprogram {
                continue;
            }
            if let Some(attr) = entry.attr_value(gimli::DW_AT_name)? {
                if let Ok(name) = dwarf.attr_string(&unit, attr) {
                    funcs.push(String::from_utf8_lossy(name.slice()).into_owned());
                }
            }
        }
    }

    if funcs.is_empty() {
        Err(anyhow!("Compile unit '{cu}' matched no function"))
    } else {
        Ok(funcs)
    }
}

/// Look for a vmlinux image with debug information for the running kernel in
/// the usual locations.
pub(crate) fn find_vmlinux() -> Option<PathBuf> {
    let release = uname().ok()?.release().to_str()?.to_string();

    let locations = [
        format!("/boot/vmlinux-{release}"),
        format!("/lib/modules/{release}/vmlinux-{release}"),
        format!("/lib/modules/{release}/build/vmlinux"),
        format!("/usr/lib/modules/{release}/kernel/vmlinux"),
        format!("/usr/lib/debug/boot/vmlinux-{release}"),
        format!("/usr/lib/debug/boot/vmlinux-{release}.debug"),
        format!("/usr/lib/debug/lib/modules/{release}/vmlinux"),
    ];

    for location in locations.iter() {
        let path = PathBuf::from(location);
        if path.exists() {
            debug!("Using vmlinux image at {}", path.display());
            return Some(path);
        }
        debug!("No vmlinux image at {location}");
    }

    None
}
