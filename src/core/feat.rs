//! # Feature detection
//!
//! Probes what the running kernel supports before anything is attached, so
//! the backend and capture mechanisms can be picked accordingly.

use anyhow::Result;
use log::debug;
use nix::unistd::{sysconf, SysconfVar};

use super::{inspect::inspector, probe::tracefs};

/// Capabilities of the running kernel the tool cares about.
#[derive(Clone, Copy, Default)]
pub(crate) struct Features {
    /// BPF ring buffer maps.
    pub(crate) has_ringbuf: bool,
    /// bpf_get_func_ip() helper.
    pub(crate) has_get_func_ip: bool,
    /// bpf_get_branch_snapshot() helper.
    pub(crate) has_branch_snapshot: bool,
    /// Cookies on kprobes.
    pub(crate) has_bpf_cookie: bool,
    /// Multi-attach kprobes (fprobe).
    pub(crate) has_kprobe_multi: bool,
    /// A usable tracefs mount.
    pub(crate) has_tracefs: bool,
}

impl Features {
    pub(crate) fn detect() -> Result<Features> {
        let kernel = &inspector()?.kernel;
        let version = kernel.version();

        let features = Features {
            has_ringbuf: version.at_least(5, 8),
            has_get_func_ip: version.at_least(5, 15),
            has_bpf_cookie: version.at_least(5, 15),
            has_branch_snapshot: version.at_least(5, 16),
            // Multi-attach kprobes are built on fprobe, which is optional.
            has_kprobe_multi: version.at_least(5, 18)
                && kernel.get_config_option("CONFIG_FPROBE").unwrap_or("n") == "y",
            has_tracefs: tracefs::tracefs_root().is_ok(),
        };

        debug!(
            "Feature detection results: ringbuf:{} get_func_ip:{} branch_snapshot:{} bpf_cookie:{} kprobe_multi:{} tracefs:{}",
            features.has_ringbuf,
            features.has_get_func_ip,
            features.has_branch_snapshot,
            features.has_bpf_cookie,
            features.has_kprobe_multi,
            features.has_tracefs,
        );

        Ok(features)
    }
}

/// Number of logical CPUs the kernel can bring up; per-CPU state is sized
/// using this.
pub(crate) fn cpu_count() -> usize {
    match sysconf(SysconfVar::_NPROCESSORS_CONF) {
        Ok(Some(count)) if count > 0 => count as usize,
        _ => 1,
    }
}
