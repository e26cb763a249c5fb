//! # Perf capture
//!
//! Native stack and branch record capture through per-CPU perf sampling:
//! one cycles counter per logical CPU samples kernel callchains (and, when
//! LBR capture is on, hardware branch stacks) into an mmap'd ring. On a
//! failing return the engine asks for the most recent sample of the failing
//! CPU, which is at most one sampling period old.

use std::{
    mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr,
    sync::atomic::{fence, Ordering},
};

use anyhow::{bail, Result};
use log::debug;
use nix::unistd::{sysconf, SysconfVar};

use super::{
    probe::backend::StackCapturer,
    stack::{BranchEntry, MAX_KSTACK_DEPTH, MAX_LBR_CNT},
};

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
const PERF_SAMPLE_BRANCH_STACK: u64 = 1 << 11;
const PERF_SAMPLE_BRANCH_KERNEL: u64 = 1 << 1;
const PERF_SAMPLE_BRANCH_ANY: u64 = 1 << 3;
const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;
const PERF_RECORD_SAMPLE: u32 = 9;

// perf_event_attr flag bits.
const ATTR_EXCLUDE_USER: u64 = 1 << 4;
const ATTR_FREQ: u64 = 1 << 10;
const ATTR_EXCLUDE_CALLCHAIN_USER: u64 = 1 << 22;

/// Callchain entries at or above this value are context markers
/// (PERF_CONTEXT_KERNEL and friends), not return addresses.
const PERF_CONTEXT_FIRST: u64 = 0u64.wrapping_sub(4095);

/// Sampling frequency, in Hz. High enough for the latest sample to sit close
/// to the failing return, low enough to not disturb the traced system.
const SAMPLE_FREQ: u64 = 1000;

/// Size of each ring data area, in pages.
const RING_DATA_PAGES: usize = 8;

/// perf_event_attr, defined up to and including branch_sample_type
/// (PERF_ATTR_SIZE_VER4); the kernel accepts shortened versions. Only ever
/// read by the kernel, through the syscall.
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct PerfEventAttr {
    r#type: u32,
    size: u32,
    config: u64,
    /// sample_freq when ATTR_FREQ is set.
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
}

/// Leading part of the perf mmap control page. The data_* members live past
/// a large reserved block, at a fixed 1024 byte offset.
#[repr(C)]
#[allow(dead_code)]
struct PerfMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
}

fn read_u64(buf: &[u8], off: usize) -> Option<u64> {
    let bytes = buf.get(off..off + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().unwrap()))
}

/// Extract the kernel callchain of a raw PERF_RECORD_SAMPLE body, leaf
/// first, skipping context markers.
fn parse_callchain(sample: &[u8], out: &mut [u64; MAX_KSTACK_DEPTH]) -> usize {
    let Some(nr) = read_u64(sample, 0) else {
        return 0;
    };

    let mut n = 0;
    for i in 0..nr as usize {
        let Some(ip) = read_u64(sample, 8 + i * 8) else {
            break;
        };
        if ip >= PERF_CONTEXT_FIRST {
            continue;
        }
        if n >= MAX_KSTACK_DEPTH {
            break;
        }
        out[n] = ip;
        n += 1;
    }

    n
}

/// Extract the branch stack following the callchain in a raw
/// PERF_RECORD_SAMPLE body, newest first.
fn parse_branch_stack(sample: &[u8], out: &mut [BranchEntry; MAX_LBR_CNT]) -> usize {
    let Some(nr) = read_u64(sample, 0) else {
        return 0;
    };
    let off = 8 + nr as usize * 8;
    let Some(bnr) = read_u64(sample, off) else {
        return 0;
    };

    let mut n = 0;
    for i in 0..(bnr as usize).min(MAX_LBR_CNT) {
        // Each entry is { from, to, flags }.
        let entry = off + 8 + i * 24;
        let (Some(from), Some(to)) = (read_u64(sample, entry), read_u64(sample, entry + 8)) else {
            break;
        };
        out[n] = BranchEntry { from, to };
        n += 1;
    }

    n
}

/// One per-CPU sampling counter and its mmap'd ring.
struct CpuRing {
    _fd: OwnedFd,
    base: *mut u8,
    len: usize,
    /// Body of the most recent sample pulled out of the ring.
    last_sample: Vec<u8>,
}

// The ring is only ever touched from the thread owning the engine.
unsafe impl Send for CpuRing {}

impl CpuRing {
    fn page(&self) -> *mut PerfMmapPage {
        self.base as *mut PerfMmapPage
    }

    fn data_area(&self) -> (usize, usize) {
        let page_size = page_size();
        let (off, size) = unsafe { ((*self.page()).data_offset, (*self.page()).data_size) };
        // Old kernels don't fill those in; the data area then starts right
        // after the control page.
        match size {
            0 => (page_size, self.len - page_size),
            _ => (off as usize, size as usize),
        }
    }

    /// Copy `len` bytes out of the ring data area starting at logical
    /// position `pos`, handling the wrap-around.
    fn read_bytes(&self, pos: u64, len: usize) -> Vec<u8> {
        let (data_off, data_size) = self.data_area();
        let mut out = vec![0u8; len];

        for (i, byte) in out.iter_mut().enumerate() {
            let off = data_off + (pos as usize + i) % data_size;
            *byte = unsafe { ptr::read(self.base.add(off)) };
        }
        out
    }

    /// Consume everything new in the ring, keeping the newest sample body.
    fn refresh(&mut self) {
        let head = unsafe { ptr::read_volatile(&(*self.page()).data_head) };
        fence(Ordering::Acquire);
        let mut tail = unsafe { ptr::read_volatile(&(*self.page()).data_tail) };

        let (_, data_size) = self.data_area();

        while tail < head {
            let header = self.read_bytes(tail, 8);
            let r#type = u32::from_ne_bytes(header[0..4].try_into().unwrap());
            let size = u16::from_ne_bytes(header[6..8].try_into().unwrap()) as usize;

            if size < 8 || size > data_size {
                // Torn record, drop whatever is left.
                break;
            }
            if r#type == PERF_RECORD_SAMPLE {
                self.last_sample = self.read_bytes(tail + 8, size - 8);
            }
            tail += size as u64;
        }

        fence(Ordering::Release);
        unsafe { ptr::write_volatile(&mut (*self.page()).data_tail, head) };
    }
}

impl Drop for CpuRing {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => 4096,
    }
}

/// Per-CPU sample capture, handing the engine the native kernel stack (and
/// branch records, when enabled) of the most recent sample on a CPU.
/// Counters and rings are released on drop.
pub(crate) struct SampleCapture {
    cpus: Vec<CpuRing>,
    with_branches: bool,
}

impl SampleCapture {
    /// Open one sampling counter per CPU. `lbr_flags` overrides the captured
    /// branch types (defaults to any kernel branch).
    pub(crate) fn new(
        cpu_cnt: usize,
        with_branches: bool,
        lbr_flags: Option<u64>,
    ) -> Result<SampleCapture> {
        let mut attr = PerfEventAttr {
            r#type: PERF_TYPE_HARDWARE,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config: PERF_COUNT_HW_CPU_CYCLES,
            sample_period: SAMPLE_FREQ,
            sample_type: PERF_SAMPLE_CALLCHAIN,
            flags: ATTR_FREQ | ATTR_EXCLUDE_USER | ATTR_EXCLUDE_CALLCHAIN_USER,
            ..Default::default()
        };
        if with_branches {
            attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
            attr.branch_sample_type =
                PERF_SAMPLE_BRANCH_KERNEL | lbr_flags.unwrap_or(PERF_SAMPLE_BRANCH_ANY);
            debug!("LBR flags are {:#x}", attr.branch_sample_type);
        }

        let page_size = page_size();
        let len = (1 + RING_DATA_PAGES) * page_size;

        let mut cpus = Vec::with_capacity(cpu_cnt);
        for cpu in 0..cpu_cnt {
            let fd = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &mut attr as *mut PerfEventAttr,
                    -1,
                    cpu as libc::c_int,
                    -1,
                    PERF_FLAG_FD_CLOEXEC,
                )
            };
            if fd < 0 {
                // Dropping the already opened rings closes them.
                bail!(
                    "Could not open a sampling counter on cpu {cpu}: {}",
                    std::io::Error::last_os_error()
                );
            }
            let fd = unsafe { OwnedFd::from_raw_fd(fd as i32) };

            let base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                bail!(
                    "Could not map the sample ring of cpu {cpu}: {}",
                    std::io::Error::last_os_error()
                );
            }

            cpus.push(CpuRing {
                _fd: fd,
                base: base as *mut u8,
                len,
                last_sample: Vec::new(),
            });
        }

        Ok(SampleCapture {
            cpus,
            with_branches,
        })
    }

    pub(crate) fn cpu_cnt(&self) -> usize {
        self.cpus.len()
    }
}

impl StackCapturer for SampleCapture {
    fn capture_kernel_stack(&mut self, cpu: u32, out: &mut [u64; MAX_KSTACK_DEPTH]) -> usize {
        let Some(ring) = self.cpus.get_mut(cpu as usize) else {
            return 0;
        };
        ring.refresh();
        parse_callchain(&ring.last_sample, out)
    }

    fn capture_branch_stack(&mut self, cpu: u32, out: &mut [BranchEntry; MAX_LBR_CNT]) -> usize {
        if !self.with_branches {
            return 0;
        }
        let Some(ring) = self.cpus.get_mut(cpu as usize) else {
            return 0;
        };
        ring.refresh();
        parse_branch_stack(&ring.last_sample, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERF_CONTEXT_KERNEL: u64 = 0u64.wrapping_sub(128);

    /// Build a raw sample body: a callchain and, optionally, branch entries.
    fn sample(ips: &[u64], branches: &[(u64, u64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend((ips.len() as u64).to_ne_bytes());
        for ip in ips {
            buf.extend(ip.to_ne_bytes());
        }
        buf.extend((branches.len() as u64).to_ne_bytes());
        for (from, to) in branches {
            buf.extend(from.to_ne_bytes());
            buf.extend(to.to_ne_bytes());
            buf.extend(0u64.to_ne_bytes()); // flags
        }
        buf
    }

    #[test]
    fn callchain_parsing() {
        let mut out = [0u64; MAX_KSTACK_DEPTH];

        // The context marker is skipped, the leaf-first order kept.
        let body = sample(
            &[PERF_CONTEXT_KERNEL, 0xffffffff81000042, 0xffffffff81000110],
            &[],
        );
        let n = parse_callchain(&body, &mut out);
        assert_eq!(n, 2);
        assert_eq!(out[..2], [0xffffffff81000042, 0xffffffff81000110]);

        assert_eq!(parse_callchain(&[], &mut out), 0);

        // Truncated bodies don't read past the end.
        let body = sample(&[0xffffffff81000042], &[]);
        assert_eq!(parse_callchain(&body[..12], &mut out), 0);
    }

    #[test]
    fn branch_stack_parsing() {
        let mut out = [BranchEntry::default(); MAX_LBR_CNT];

        let body = sample(
            &[PERF_CONTEXT_KERNEL, 0xffffffff81000042],
            &[(0x2000, 0x2010), (0x1080, 0x1090)],
        );
        let n = parse_branch_stack(&body, &mut out);
        assert_eq!(n, 2);
        assert_eq!(out[0].from, 0x2000);
        assert_eq!(out[0].to, 0x2010);
        assert_eq!(out[1].from, 0x1080);

        // No branch data at all.
        let body = sample(&[0xffffffff81000042], &[]);
        assert_eq!(parse_branch_stack(&body, &mut out), 0);
    }

    #[test]
    fn branch_stack_capped() {
        let branches: Vec<(u64, u64)> = (0..2 * MAX_LBR_CNT as u64)
            .map(|i| (0x1000 + i, 0x2000 + i))
            .collect();
        let body = sample(&[], &branches);

        let mut out = [BranchEntry::default(); MAX_LBR_CNT];
        assert_eq!(parse_branch_stack(&body, &mut out), MAX_LBR_CNT);
        assert_eq!(out[0].from, 0x1000);
    }
}
