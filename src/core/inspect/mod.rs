//! # Inspection helpers
//!
//! Provides support for inspecting the system: kernel symbols, version,
//! configuration and type information. Used as a singleton.

mod btf;
mod kernel;
pub(crate) mod kernel_version;

pub(crate) use kernel::KernelInspector;

use anyhow::Result;
use once_cell::sync::OnceCell;

static INSPECTOR: OnceCell<Inspector> = OnceCell::new();

/// Inspection context, initialized on first access.
pub(crate) struct Inspector {
    pub(crate) kernel: KernelInspector,
}

impl Inspector {
    fn new() -> Result<Inspector> {
        Ok(Inspector {
            kernel: KernelInspector::new()?,
        })
    }
}

/// Get a reference on the inspector. The first call triggers the inspection
/// itself (kallsyms and BTF parsing, etc).
pub(crate) fn inspector() -> Result<&'static Inspector> {
    INSPECTOR.get_or_try_init(Inspector::new)
}

/// Address to kernel symbol resolution, as consumed by the stack renderer.
/// Abstracted so the processing side can be exercised without a live kernel.
pub(crate) trait KsymResolver {
    /// Resolve an address to the (name, base address) of the containing
    /// symbol, if any.
    fn resolve_ksym(&self, addr: u64) -> Option<(String, u64)>;
}

impl KsymResolver for KernelInspector {
    fn resolve_ksym(&self, addr: u64) -> Option<(String, u64)> {
        self.find_nearest_symbol(addr)
            .map(|(name, base)| (name.to_string(), base))
    }
}
