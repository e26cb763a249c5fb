//! # Stack filter
//!
//! User-side gating of dequeued records: success suppression, total latency
//! floor and the allow/deny error masks. The engine emits everything, all
//! policy lives here.

use crate::core::{
    errno::ErrnoMask,
    probe::{FuncFlags, FuncTable},
    stack::CallStack,
};

pub(crate) struct StackFilter {
    /// Report successful stacks too (-S).
    pub(crate) emit_successes: bool,
    /// Only report stacks at least this long, in milliseconds (-L).
    pub(crate) longer_than_ms: u64,
    pub(crate) allow_errors: ErrnoMask,
    pub(crate) deny_errors: ErrnoMask,
    /// Any non-default error mask was given (-x/-X).
    pub(crate) has_error_filter: bool,
}

impl Default for StackFilter {
    fn default() -> StackFilter {
        StackFilter {
            emit_successes: false,
            longer_than_ms: 0,
            allow_errors: ErrnoMask::full(),
            deny_errors: ErrnoMask::empty(),
            has_error_filter: false,
        }
    }
}

/// Sign-extend a raw return value when its function returns a 32-bit signed
/// integer, pass it through otherwise.
pub(crate) fn frame_result(flags: FuncFlags, res: u64) -> i64 {
    match flags.contains(FuncFlags::NEEDS_SIGN_EXT) {
        true => res as u32 as i32 as i64,
        false => res as i64,
    }
}

impl StackFilter {
    /// Decide if a record is worth rendering. A record counts as an error
    /// record when its own path failed or when it carries an adjacent
    /// stitched sibling (which, by construction, failed).
    pub(crate) fn should_report(&self, stack: &CallStack, funcs: &FuncTable) -> bool {
        let is_err = stack.is_err || stack.has_stitched();

        if !is_err && !self.emit_successes {
            return false;
        }

        if self.longer_than_ms > 0 && stack.total_latency() < self.longer_than_ms * 1_000_000 {
            return false;
        }

        if is_err && self.has_error_filter && !self.errors_pass(stack, funcs) {
            return false;
        }

        true
    }

    /// Scan the frame results against the error masks: any deny match
    /// rejects, and at least one allow match is required. Frames that can't
    /// carry a meaningful error don't participate.
    fn errors_pass(&self, stack: &CallStack, funcs: &FuncTable) -> bool {
        let mut allowed = false;

        let mut check = |id: u32, res: u64| -> Option<bool> {
            let flags = funcs.flags(id);

            if flags.contains(FuncFlags::CANT_FAIL) {
                return None;
            }
            let res = frame_result(flags, res);
            if res == 0 && !flags.contains(FuncFlags::RET_PTR) {
                return None;
            }

            // A denied error rejects the whole stack immediately; an allowed
            // one marks it reportable but the scan goes on, other frames
            // might still be denied.
            if self.deny_errors.contains(res) {
                return Some(false);
            }
            if self.allow_errors.contains(res) {
                allowed = true;
            }
            None
        };

        for i in 0..stack.max_depth {
            if let Some(verdict) = check(stack.func_ids[i], stack.func_res[i]) {
                return verdict;
            }
        }

        if stack.has_stitched() {
            for i in (stack.saved_depth - 1)..stack.saved_max_depth {
                if let Some(verdict) = check(stack.saved_ids[i], stack.saved_res[i]) {
                    return verdict;
                }
            }
        }

        allowed
    }
}
