//! # Probe
//!
//! Function instrumentation support: the attachment planner resolving globs
//! into a function table, and the backends installing the actual probes.

pub(crate) mod backend;
pub(crate) mod planner;
pub(crate) mod tracefs;

use std::fmt;

/// Cap on the number of instrumented functions. Function ids are dense and
/// used as direct indexes on both sides of the event channel.
pub(crate) const MAX_FUNC_CNT: usize = 65536;

/// How a function return value has to be interpreted, derived from its BTF
/// signature. See `BtfInfo::func_flags`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FuncFlags(u32);

impl FuncFlags {
    pub(crate) const IS_ENTRY: FuncFlags = FuncFlags(1 << 0);
    pub(crate) const CANT_FAIL: FuncFlags = FuncFlags(1 << 1);
    pub(crate) const NEEDS_SIGN_EXT: FuncFlags = FuncFlags(1 << 2);
    pub(crate) const RET_PTR: FuncFlags = FuncFlags(1 << 3);
    pub(crate) const RET_VOID: FuncFlags = FuncFlags(1 << 4);
    pub(crate) const RET_BOOL: FuncFlags = FuncFlags(1 << 5);

    pub(crate) fn empty() -> FuncFlags {
        FuncFlags(0)
    }

    pub(crate) fn contains(&self, other: FuncFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FuncFlags {
    type Output = FuncFlags;

    fn bitor(self, rhs: FuncFlags) -> FuncFlags {
        FuncFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FuncFlags {
    fn bitor_assign(&mut self, rhs: FuncFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FuncFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (FuncFlags::IS_ENTRY, "entry"),
            (FuncFlags::CANT_FAIL, "cant_fail"),
            (FuncFlags::NEEDS_SIGN_EXT, "sign_ext"),
            (FuncFlags::RET_PTR, "ret_ptr"),
            (FuncFlags::RET_VOID, "ret_void"),
            (FuncFlags::RET_BOOL, "ret_bool"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        write!(f, "{}", names.join("|"))
    }
}

/// A single instrumented function.
#[derive(Clone)]
pub(crate) struct FuncInfo {
    pub(crate) name: String,
    /// Address of the function entry point.
    pub(crate) addr: u64,
    /// Size of the function body, 0 when unknown.
    pub(crate) size: u64,
    pub(crate) flags: FuncFlags,
}

/// The set of instrumented functions, indexed by their dense id. Built once
/// by the planner and immutable afterwards.
#[derive(Default)]
pub(crate) struct FuncTable {
    funcs: Vec<FuncInfo>,
}

impl FuncTable {
    pub(crate) fn new(funcs: Vec<FuncInfo>) -> FuncTable {
        FuncTable { funcs }
    }

    pub(crate) fn len(&self) -> usize {
        self.funcs.len()
    }

    pub(crate) fn get(&self, id: u32) -> Option<&FuncInfo> {
        self.funcs.get(id as usize)
    }

    pub(crate) fn flags(&self, id: u32) -> FuncFlags {
        self.get(id).map(|f| f.flags).unwrap_or_default()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &FuncInfo)> {
        self.funcs.iter().enumerate().map(|(i, f)| (i as u32, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        let mut flags = FuncFlags::CANT_FAIL | FuncFlags::RET_VOID;
        assert!(flags.contains(FuncFlags::CANT_FAIL));
        assert!(flags.contains(FuncFlags::CANT_FAIL | FuncFlags::RET_VOID));
        assert!(!flags.contains(FuncFlags::RET_PTR));

        flags |= FuncFlags::IS_ENTRY;
        assert!(flags.contains(FuncFlags::IS_ENTRY));
    }
}
