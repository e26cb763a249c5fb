//! # Stack
//!
//! Per-CPU call stack tracking: the `CallStack` record describing one traced
//! logical stack and the engine maintaining it from function entry/exit
//! events.

pub(crate) mod engine;

/// Maximum depth of a traced logical stack. Deeper entries are ignored.
pub(crate) const MAX_FSTACK_DEPTH: usize = 64;
/// Maximum number of native (kernel) stack addresses kept per record.
pub(crate) const MAX_KSTACK_DEPTH: usize = 128;
/// Maximum number of branch samples kept per record.
pub(crate) const MAX_LBR_CNT: usize = 32;
/// Kernel task comm length, including the trailing NUL.
pub(crate) const TASK_COMM_LEN: usize = 16;

/// A single hardware-recorded branch, from the newest-first branch stack.
#[derive(Clone, Copy, Default)]
pub(crate) struct BranchEntry {
    pub(crate) from: u64,
    pub(crate) to: u64,
}

/// One traced logical stack, owned by a single CPU and mutated only by the
/// engine handlers running for that CPU. Completed records are boxed and sent
/// as-is through the events channel.
///
/// Live frames are in `[0..depth)` (`func_lat` holds the entry timestamp);
/// frames in `[depth..max_depth)` completed as part of the deepest failing
/// path (`func_lat` holds the duration, `func_res` the return value).
#[derive(Clone)]
pub(crate) struct CallStack {
    pub(crate) depth: usize,
    pub(crate) max_depth: usize,
    pub(crate) func_ids: [u32; MAX_FSTACK_DEPTH],
    pub(crate) func_res: [u64; MAX_FSTACK_DEPTH],
    pub(crate) func_lat: [u64; MAX_FSTACK_DEPTH],
    /// The current path hit a failing return.
    pub(crate) is_err: bool,

    /// Native kernel stack captured at the first failing return, leaf first.
    pub(crate) kstack: [u64; MAX_KSTACK_DEPTH],
    pub(crate) kstack_sz: usize,

    /// Branch samples captured at the first failing return, newest first.
    pub(crate) lbrs: [BranchEntry; MAX_LBR_CNT],
    pub(crate) lbrs_sz: usize,

    /// Stitch slot: a failing sibling sub-path preserved when the caller
    /// recovered and went on calling. See `StackEngine::save_stitch_stack`.
    pub(crate) saved_ids: [u32; MAX_FSTACK_DEPTH],
    pub(crate) saved_res: [u64; MAX_FSTACK_DEPTH],
    pub(crate) saved_lat: [u64; MAX_FSTACK_DEPTH],
    pub(crate) saved_depth: usize,
    pub(crate) saved_max_depth: usize,

    /// Task identity, captured at the top-level entry.
    pub(crate) pid: u32,
    pub(crate) tgid: u32,
    pub(crate) comm: [u8; TASK_COMM_LEN],

    /// Monotonic timestamp at emission time.
    pub(crate) emit_ts: u64,
}

impl Default for CallStack {
    fn default() -> CallStack {
        CallStack {
            depth: 0,
            max_depth: 0,
            func_ids: [0; MAX_FSTACK_DEPTH],
            func_res: [0; MAX_FSTACK_DEPTH],
            func_lat: [0; MAX_FSTACK_DEPTH],
            is_err: false,
            kstack: [0; MAX_KSTACK_DEPTH],
            kstack_sz: 0,
            lbrs: [BranchEntry::default(); MAX_LBR_CNT],
            lbrs_sz: 0,
            saved_ids: [0; MAX_FSTACK_DEPTH],
            saved_res: [0; MAX_FSTACK_DEPTH],
            saved_lat: [0; MAX_FSTACK_DEPTH],
            saved_depth: 0,
            saved_max_depth: 0,
            pid: 0,
            tgid: 0,
            comm: [0; TASK_COMM_LEN],
            emit_ts: 0,
        }
    }
}

impl CallStack {
    /// Reset all mutable state so the next top-level entry begins clean.
    pub(crate) fn reset(&mut self) {
        self.depth = 0;
        self.max_depth = 0;
        self.is_err = false;
        self.kstack_sz = 0;
        self.lbrs_sz = 0;
        self.saved_depth = 0;
        self.saved_max_depth = 0;
    }

    /// Does the record carry a stitched sibling stack adjacent to the current
    /// one? The saved slot qualifies when its divergence point lies within
    /// the record's completed frames (or right past them, when the caller
    /// itself failed); stale slots saved under deeper, since-truncated paths
    /// don't.
    pub(crate) fn has_stitched(&self) -> bool {
        self.saved_depth > 0 && self.saved_depth <= self.max_depth + 1
    }

    /// Task comm as a printable string.
    pub(crate) fn comm_str(&self) -> &str {
        let len = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.comm.len());
        std::str::from_utf8(&self.comm[..len]).unwrap_or("<invalid>")
    }

    pub(crate) fn set_comm(&mut self, comm: &str) {
        self.comm = [0; TASK_COMM_LEN];
        let bytes = comm.as_bytes();
        let len = bytes.len().min(TASK_COMM_LEN - 1);
        self.comm[..len].copy_from_slice(&bytes[..len]);
    }

    /// Total latency of the record, aka. the duration of its outermost
    /// completed frame. Only meaningful once the stack completed.
    pub(crate) fn total_latency(&self) -> u64 {
        match self.max_depth {
            0 => 0,
            _ => self.func_lat[0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm() {
        let mut stack = CallStack::default();
        stack.set_comm("systemd");
        assert_eq!(stack.comm_str(), "systemd");

        // Over-long comms are truncated to TASK_COMM_LEN - 1 bytes.
        stack.set_comm("a-very-long-process-name");
        assert_eq!(stack.comm_str(), "a-very-long-pro");
    }

    #[test]
    fn stitch_adjacency() {
        let mut stack = CallStack::default();
        assert!(!stack.has_stitched());

        // Caller failed right after a sibling was saved.
        stack.max_depth = 1;
        stack.saved_depth = 2;
        stack.saved_max_depth = 2;
        assert!(stack.has_stitched());

        // Caller recovered and kept calling siblings.
        stack.max_depth = 2;
        assert!(stack.has_stitched());

        // Stale slot saved under a deeper, since-truncated path.
        stack.saved_depth = 4;
        stack.saved_max_depth = 5;
        assert!(!stack.has_stitched());
    }
}
