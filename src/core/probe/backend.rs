//! # Backend
//!
//! Narrow interface to the instrumentation mechanism. A backend knows how to
//! install entry/exit probes on the planned function set and turns raw probe
//! hits into `FuncEvent`s feeding the stack engine. It also provides the
//! snapshot hooks the engine calls when an error is first detected.

use anyhow::Result;

use crate::core::stack::{BranchEntry, TASK_COMM_LEN, MAX_KSTACK_DEPTH, MAX_LBR_CNT};

/// Probe mechanisms a backend can use, as selected on the command line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum AttachMode {
    /// Pick the best supported mechanism.
    #[default]
    Default,
    /// Multi-attach kprobes/kretprobes.
    KprobeMulti,
    /// Single-attach kprobes/kretprobes.
    KprobeSingle,
    /// Fentry/fexit trampolines.
    Fentry,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum FuncEventKind {
    Entry,
    Exit,
}

/// A single probe hit, as delivered by the backend. `ret` is only meaningful
/// for exit events.
#[derive(Clone, Copy)]
pub(crate) struct FuncEvent {
    pub(crate) kind: FuncEventKind,
    pub(crate) cpu: u32,
    pub(crate) func_id: u32,
    pub(crate) ret: u64,
    /// Timestamp of the hit, in nanoseconds on the monotonic clock.
    pub(crate) ts: u64,
    pub(crate) pid: u32,
    pub(crate) tgid: u32,
    pub(crate) comm: [u8; TASK_COMM_LEN],
}

/// Snapshot hooks the engine calls from its handlers when a path first fails.
/// Implementations must be bounded-time: the engine runs on the event
/// consuming thread and must never fall behind because of a capture.
pub(crate) trait StackCapturer: Send {
    /// Capture the native kernel stack of the failing context, leaf first.
    /// Returns the number of addresses written.
    fn capture_kernel_stack(&mut self, cpu: u32, out: &mut [u64; MAX_KSTACK_DEPTH]) -> usize;

    /// Capture the most recent branch samples of the failing context, newest
    /// first. Returns the number of entries written.
    fn capture_branch_stack(&mut self, cpu: u32, out: &mut [BranchEntry; MAX_LBR_CNT]) -> usize;
}

/// Capturer used when no snapshot mechanism is available; the renderer
/// handles empty native stacks gracefully.
pub(crate) struct NoCapture;

impl StackCapturer for NoCapture {
    fn capture_kernel_stack(&mut self, _: u32, _: &mut [u64; MAX_KSTACK_DEPTH]) -> usize {
        0
    }

    fn capture_branch_stack(&mut self, _: u32, _: &mut [BranchEntry; MAX_LBR_CNT]) -> usize {
        0
    }
}

/// Counters a backend reports at shutdown.
#[derive(Clone, Copy, Default)]
pub(crate) struct BackendStats {
    /// Raw events that could not be decoded.
    pub(crate) parse_errors: u64,
}

/// Interface to the probe mechanism. The rest of the tool only manipulates
/// backends through this trait; `attach` failures must leave no partial
/// attachment behind.
pub(crate) trait ProbeBackend {
    /// Install entry and exit probes on all planned functions.
    fn attach(&mut self) -> Result<()>;

    /// Start feeding events to the engine. The engine is moved to the backend
    /// event thread and owns all per-CPU stacks from there on.
    fn start(&mut self, engine: crate::core::stack::engine::StackEngine) -> Result<()>;

    /// Remove all probes, stop the event thread.
    fn detach(&mut self) -> Result<()>;

    fn stats(&self) -> BackendStats;
}
