//! # Stack engine
//!
//! Push/pop state machine fed by function entry/exit events. One `CallStack`
//! per CPU, mutated only from here; completed top-level stacks are boxed and
//! published on the events channel for the processing side to filter and
//! render. Handlers are bounded-time and never block.

use std::sync::Arc;

use log::trace;

use super::{CallStack, MAX_FSTACK_DEPTH};
use crate::core::{
    events::EventsTx,
    probe::{
        backend::{FuncEvent, FuncEventKind, StackCapturer},
        FuncFlags, FuncTable,
    },
};

/// Biggest kernel error value, as an absolute number. Return values at or
/// above (unsigned) -MAX_ERRNO are failing returns.
const MAX_ERRNO: u64 = 4095;

/// Failing return predicate for long/pointer sized values.
pub(crate) fn is_err_value(ret: u64) -> bool {
    ret >= 0u64.wrapping_sub(MAX_ERRNO)
}

/// Failing return predicate for 32-bit signed values. The value is checked
/// against the raw [-4095, -1] encoding (0xfffff001..0xffffffff) instead of
/// being sign extended, so pointer-looking values never match.
pub(crate) fn is_err_value32(ret: u64) -> bool {
    (0xfffff001..=0xffffffff).contains(&ret)
}

/// Decide if an exit event is a failing return, based on the function return
/// type flags.
pub(crate) fn exit_failed(flags: FuncFlags, ret: u64) -> bool {
    if flags.contains(FuncFlags::CANT_FAIL) {
        return false;
    }

    let mut failed = match flags.contains(FuncFlags::NEEDS_SIGN_EXT) {
        true => is_err_value32(ret),
        false => is_err_value(ret),
    };

    // NULL pointer returns are failures too.
    if flags.contains(FuncFlags::RET_PTR) && ret == 0 {
        failed = true;
    }

    failed
}

/// Engine tuning and task filtering, immutable once the engine is built.
#[derive(Default)]
pub(crate) struct EngineConfig {
    /// Also emit partial stacks every time a frame of a failing path
    /// completes below the top level.
    pub(crate) emit_intermediate: bool,
    /// Ask the capturer for branch samples on the first failing return.
    pub(crate) capture_lbr: bool,
    pub(crate) allow_pids: Vec<u32>,
    pub(crate) deny_pids: Vec<u32>,
    pub(crate) allow_comms: Vec<String>,
    pub(crate) deny_comms: Vec<String>,
}

impl EngineConfig {
    /// Check the task filters at top-level entry time. The deny lists
    /// override the allow lists on overlap.
    fn task_allowed(&self, ev: &FuncEvent) -> bool {
        if self.deny_pids.contains(&ev.tgid) {
            return false;
        }

        let comm_len = ev.comm.iter().position(|&b| b == 0).unwrap_or(ev.comm.len());
        let comm = std::str::from_utf8(&ev.comm[..comm_len]).unwrap_or("");
        if self.deny_comms.iter().any(|c| c == comm) {
            return false;
        }

        if !self.allow_pids.is_empty() && !self.allow_pids.contains(&ev.tgid) {
            return false;
        }
        if !self.allow_comms.is_empty() && !self.allow_comms.iter().any(|c| c == comm) {
            return false;
        }

        true
    }
}

/// Counters kept by the engine, reported at shutdown.
#[derive(Clone, Copy, Default)]
pub(crate) struct EngineStats {
    /// Stacks thrown away because an exit did not match the innermost live
    /// frame (missed events, overflows).
    pub(crate) desyncs: u64,
    /// Events referencing CPUs beyond the configured count.
    pub(crate) bad_cpus: u64,
}

/// The per-CPU stack tracking engine.
pub(crate) struct StackEngine {
    stacks: Vec<Box<CallStack>>,
    funcs: Arc<FuncTable>,
    config: EngineConfig,
    capturer: Box<dyn StackCapturer>,
    events: EventsTx,
    stats: EngineStats,
}

impl StackEngine {
    pub(crate) fn new(
        cpu_cnt: usize,
        funcs: Arc<FuncTable>,
        config: EngineConfig,
        capturer: Box<dyn StackCapturer>,
        events: EventsTx,
    ) -> StackEngine {
        let mut stacks = Vec::with_capacity(cpu_cnt);
        stacks.resize_with(cpu_cnt, Box::default);

        StackEngine {
            stacks,
            funcs,
            config,
            capturer,
            events,
            stats: EngineStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Feed one raw probe event into the per-CPU state machine.
    pub(crate) fn handle_event(&mut self, ev: &FuncEvent) {
        match ev.kind {
            FuncEventKind::Entry => self.handle_entry(ev),
            FuncEventKind::Exit => self.handle_exit(ev),
        }
    }

    fn handle_entry(&mut self, ev: &FuncEvent) {
        let flags = self.funcs.flags(ev.func_id);
        let Some(stack) = self.stacks.get_mut(ev.cpu as usize) else {
            self.stats.bad_cpus += 1;
            return;
        };

        let d = stack.depth;

        // Only entry functions can start a stack.
        if d == 0 && !flags.contains(FuncFlags::IS_ENTRY) {
            return;
        }
        // Overflowing entries are ignored; the matching exit will desync and
        // reset the stack.
        if d >= MAX_FSTACK_DEPTH {
            return;
        }
        if d == 0 && !self.config.task_allowed(ev) {
            return;
        }

        // Pushing over a frozen failing path would overwrite it; preserve it
        // in the stitch slot first.
        if stack.depth != stack.max_depth && stack.is_err {
            Self::save_stitch_stack(stack);
        }

        stack.func_ids[d] = ev.func_id;
        stack.func_lat[d] = ev.ts;
        stack.is_err = false;
        stack.depth = d + 1;
        stack.max_depth = d + 1;

        if d == 0 {
            stack.pid = ev.pid;
            stack.tgid = ev.tgid;
            stack.comm = ev.comm;
        }

        trace!("cpu {} push {} depth {}", ev.cpu, ev.func_id, d + 1);
    }

    fn handle_exit(&mut self, ev: &FuncEvent) {
        let flags = self.funcs.flags(ev.func_id);
        let Some(stack) = self.stacks.get_mut(ev.cpu as usize) else {
            self.stats.bad_cpus += 1;
            return;
        };

        if stack.depth == 0 {
            return;
        }
        let d = stack.depth - 1;

        // The exit does not match the innermost live frame: we lost events
        // somewhere. Start over from a clean state.
        if stack.func_ids[d] != ev.func_id {
            trace!(
                "cpu {} desync: got exit for {} while at {}",
                ev.cpu,
                ev.func_id,
                stack.func_ids[d]
            );
            stack.reset();
            self.stats.desyncs += 1;
            return;
        }

        let failed = exit_failed(flags, ev.ret);

        stack.func_res[d] = ev.ret;
        stack.func_lat[d] = ev.ts.saturating_sub(stack.func_lat[d]);

        if failed && !stack.is_err {
            // First failure along the path: freeze the failing depth and
            // snapshot the native context.
            stack.is_err = true;
            stack.max_depth = d + 1;
            stack.kstack_sz = self.capturer.capture_kernel_stack(ev.cpu, &mut stack.kstack);
            if self.config.capture_lbr {
                stack.lbrs_sz = self.capturer.capture_branch_stack(ev.cpu, &mut stack.lbrs);
            }
        }

        stack.depth = d;

        if d == 0 {
            stack.emit_ts = ev.ts;
            let record = Box::new(stack.as_ref().clone());
            stack.reset();
            self.events.send(record);
        } else if self.config.emit_intermediate && stack.is_err {
            let mut record = Box::new(stack.as_ref().clone());
            record.emit_ts = ev.ts;
            self.events.send(record);
        }
    }

    /// Preserve the current (partially failing) stack into the stitch slot.
    /// There is a single slot per CPU; newer saves overwrite older ones.
    fn save_stitch_stack(stack: &mut CallStack) {
        stack.saved_ids = stack.func_ids;
        stack.saved_res = stack.func_res;
        stack.saved_lat = stack.func_lat;
        stack.saved_depth = stack.depth + 1;
        stack.saved_max_depth = stack.max_depth;
    }

    /// Test helper: access a CPU stack state.
    #[cfg(test)]
    pub(crate) fn stack(&self, cpu: u32) -> &CallStack {
        &self.stacks[cpu as usize]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::{
        events,
        probe::{backend::NoCapture, FuncInfo},
        stack::{BranchEntry, MAX_KSTACK_DEPTH, MAX_LBR_CNT, TASK_COMM_LEN},
    };

    /// Scripted capturer handing out a fixed kernel stack.
    pub(crate) struct FixedCapture {
        pub(crate) kstack: Vec<u64>,
        pub(crate) lbrs: Vec<BranchEntry>,
    }

    impl StackCapturer for FixedCapture {
        fn capture_kernel_stack(&mut self, _: u32, out: &mut [u64; MAX_KSTACK_DEPTH]) -> usize {
            out[..self.kstack.len()].copy_from_slice(&self.kstack);
            self.kstack.len()
        }

        fn capture_branch_stack(&mut self, _: u32, out: &mut [BranchEntry; MAX_LBR_CNT]) -> usize {
            out[..self.lbrs.len()].copy_from_slice(&self.lbrs);
            self.lbrs.len()
        }
    }

    pub(crate) fn test_table() -> Arc<FuncTable> {
        // Function "a" is the only entry point; "d" returns a pointer.
        let mut funcs = Vec::new();
        for (name, flags) in [
            ("a", FuncFlags::IS_ENTRY | FuncFlags::NEEDS_SIGN_EXT),
            ("b", FuncFlags::NEEDS_SIGN_EXT),
            ("c", FuncFlags::NEEDS_SIGN_EXT),
            ("d", FuncFlags::RET_PTR),
        ] {
            funcs.push(FuncInfo {
                name: name.to_string(),
                addr: 0xffffffff81000000 + funcs.len() as u64 * 0x100,
                size: 0x100,
                flags,
            });
        }
        Arc::new(FuncTable::new(funcs))
    }

    pub(crate) fn event(kind: FuncEventKind, id: u32, ret: u64, ts: u64) -> FuncEvent {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"test");
        FuncEvent {
            kind,
            cpu: 0,
            func_id: id,
            ret,
            ts,
            pid: 42,
            tgid: 42,
            comm,
        }
    }

    pub(crate) fn enter(id: u32, ts: u64) -> FuncEvent {
        event(FuncEventKind::Entry, id, 0, ts)
    }

    /// Exit of an int-returning function: the raw register value carries the
    /// 32-bit result zero extended, as delivered by the probe mechanism.
    pub(crate) fn exit(id: u32, ret: i32, ts: u64) -> FuncEvent {
        event(FuncEventKind::Exit, id, ret as u32 as u64, ts)
    }

    fn engine(config: EngineConfig) -> (StackEngine, events::EventsRx) {
        let (tx, rx) = events::channel(16);
        (
            StackEngine::new(2, test_table(), config, Box::new(NoCapture), tx),
            rx,
        )
    }

    #[test]
    fn single_failing_entry() {
        let (mut engine, rx) = engine(EngineConfig::default());

        // a -> b, b fails with -ENOENT which propagates through a.
        engine.handle_event(&enter(0, 100));
        engine.handle_event(&enter(1, 200));
        engine.handle_event(&exit(1, -2, 300));
        engine.handle_event(&exit(0, -2, 500));

        let record = rx.try_recv().unwrap();
        assert_eq!(record.depth, 0);
        assert_eq!(record.max_depth, 2);
        assert!(record.is_err);
        assert_eq!(record.func_ids[..2], [0, 1]);
        assert_eq!(record.func_res[..2], [0xfffffffe; 2]);
        assert_eq!(record.func_lat[..2], [400, 100]);
        assert_eq!(record.pid, 42);
        assert_eq!(record.comm_str(), "test");
        assert_eq!(record.emit_ts, 500);

        // State is clean again.
        assert_eq!(engine.stack(0).depth, 0);
        assert_eq!(engine.stack(0).max_depth, 0);
        assert!(!engine.stack(0).is_err);
    }

    #[test]
    fn non_entry_start_ignored() {
        let (mut engine, rx) = engine(EngineConfig::default());

        // b is not an entry function, nothing may start.
        engine.handle_event(&enter(1, 100));
        engine.handle_event(&exit(1, -2, 200));

        assert!(rx.try_recv().is_none());
        assert_eq!(engine.stack(0).depth, 0);
    }

    #[test]
    fn recovery_keeps_failing_sibling() {
        let (mut engine, rx) = engine(EngineConfig::default());

        // a -> b fails, a recovers and calls c which succeeds.
        engine.handle_event(&enter(0, 100));
        engine.handle_event(&enter(1, 200));
        engine.handle_event(&exit(1, -12, 300));
        engine.handle_event(&enter(2, 400));
        engine.handle_event(&exit(2, 0, 500));
        engine.handle_event(&exit(0, 0, 600));

        let record = rx.try_recv().unwrap();
        assert!(!record.is_err);
        assert_eq!(record.max_depth, 2);
        assert_eq!(record.func_ids[..2], [0, 2]);

        // The failing sibling b survived in the stitch slot.
        assert!(record.has_stitched());
        assert_eq!(record.saved_depth, 2);
        assert_eq!(record.saved_max_depth, 2);
        assert_eq!(record.saved_ids[1], 1);
        assert_eq!(record.saved_res[1], 0xfffffff4);
    }

    #[test]
    fn desync_resets() {
        let (mut engine, rx) = engine(EngineConfig::default());

        // Exit for a while b is on top: missed b exit somewhere.
        engine.handle_event(&enter(0, 100));
        engine.handle_event(&enter(1, 200));
        engine.handle_event(&exit(0, 0, 300));

        assert!(rx.try_recv().is_none());
        let stack = engine.stack(0);
        assert_eq!(stack.depth, 0);
        assert_eq!(stack.max_depth, 0);
        assert_eq!(stack.saved_depth, 0);
        assert!(!stack.is_err);
        assert_eq!(engine.stats().desyncs, 1);

        // Next top-level entry proceeds normally.
        engine.handle_event(&enter(0, 400));
        engine.handle_event(&exit(0, 0, 500));
        assert!(rx.try_recv().is_some());
    }

    #[test]
    fn pointer_returns() {
        let table = test_table();
        let flags = table.flags(3);

        assert!(exit_failed(flags, 0)); // NULL
        assert!(!exit_failed(flags, 0xffff800000001234)); // valid pointer
        assert!(exit_failed(flags, -14i64 as u64)); // ERR_PTR(-EFAULT)
    }

    #[test]
    fn err_value_predicates() {
        assert!(is_err_value(-1i64 as u64));
        assert!(is_err_value(-4095i64 as u64));
        assert!(!is_err_value(-4096i64 as u64));
        assert!(!is_err_value(0));

        assert!(is_err_value32(0xffffffff));
        assert!(is_err_value32(0xfffff001));
        assert!(!is_err_value32(0xfffff000));
        // Sign extended or pointer-like values don't match.
        assert!(!is_err_value32(0xffffffffffffffff));
        assert!(!is_err_value32(0));
    }

    #[test]
    fn depth_invariants() {
        let (mut engine, rx) = engine(EngineConfig::default());

        // Random-ish mix of entries and exits; the depth invariant must hold
        // after every step.
        let seq = [
            enter(0, 1),
            enter(1, 2),
            enter(2, 3),
            exit(2, -2, 4),
            enter(2, 5),
            exit(2, 0, 6),
            exit(1, -2, 7),
            enter(1, 8),
            exit(1, 0, 9),
            exit(0, 0, 10),
            enter(0, 11),
            exit(1, 0, 12), // desync
            enter(0, 13),
            exit(0, -22, 14),
        ];

        for ev in seq.iter() {
            engine.handle_event(ev);
            let stack = engine.stack(0);
            assert!(stack.depth <= stack.max_depth);
            assert!(stack.max_depth <= MAX_FSTACK_DEPTH);
        }

        while rx.try_recv().is_some() {}
    }

    #[test]
    fn overflow_ignored() {
        let (mut engine, _rx) = engine(EngineConfig::default());

        engine.handle_event(&enter(0, 1));
        for i in 0..2 * MAX_FSTACK_DEPTH as u64 {
            engine.handle_event(&enter(1, 2 + i));
        }

        let stack = engine.stack(0);
        assert_eq!(stack.depth, MAX_FSTACK_DEPTH);
        assert_eq!(stack.max_depth, MAX_FSTACK_DEPTH);
    }

    #[test]
    fn task_filters() {
        let config = EngineConfig {
            deny_pids: vec![42],
            ..Default::default()
        };
        let (mut engine1, rx1) = engine(config);

        engine1.handle_event(&enter(0, 100));
        assert_eq!(engine1.stack(0).depth, 0);
        engine1.handle_event(&exit(0, -2, 200));
        assert!(rx1.try_recv().is_none());

        let config = EngineConfig {
            allow_comms: vec!["test".to_string()],
            ..Default::default()
        };
        let (mut engine, rx) = engine(config);

        engine.handle_event(&enter(0, 100));
        engine.handle_event(&exit(0, -2, 200));
        assert!(rx.try_recv().is_some());
    }

    #[test]
    fn intermediate_stacks() {
        let config = EngineConfig {
            emit_intermediate: true,
            ..Default::default()
        };
        let (mut engine, rx) = engine(config);

        // Each completed frame of a failing path emits a partial record.
        engine.handle_event(&enter(0, 100));
        engine.handle_event(&enter(1, 200));
        engine.handle_event(&enter(2, 300));
        engine.handle_event(&exit(2, -2, 400));

        let partial = rx.try_recv().unwrap();
        assert_eq!(partial.depth, 2);
        assert_eq!(partial.max_depth, 3);
        assert!(partial.is_err);

        engine.handle_event(&exit(1, -2, 500));
        assert!(rx.try_recv().is_some());

        engine.handle_event(&exit(0, -2, 600));
        let full = rx.try_recv().unwrap();
        assert_eq!(full.depth, 0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn kernel_stack_captured_on_first_failure() {
        let (tx, rx) = events::channel(16);
        let capturer = FixedCapture {
            kstack: vec![0xffffffff81000110, 0xffffffff81000042],
            lbrs: Vec::new(),
        };
        let mut engine = StackEngine::new(
            1,
            test_table(),
            EngineConfig::default(),
            Box::new(capturer),
            tx,
        );

        engine.handle_event(&enter(0, 100));
        engine.handle_event(&enter(1, 200));
        engine.handle_event(&exit(1, -2, 300));
        engine.handle_event(&exit(0, -2, 400));

        let record = rx.try_recv().unwrap();
        assert_eq!(record.kstack_sz, 2);
        assert_eq!(record.kstack[..2], [0xffffffff81000110, 0xffffffff81000042]);
    }
}
