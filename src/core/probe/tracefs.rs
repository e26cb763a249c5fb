//! # Tracefs backend
//!
//! Probe backend built on dynamic kprobe events: entry and return probes are
//! registered through tracefs `kprobe_events`, and hits are decoded from
//! `trace_pipe`. Needs no kernel-side program at all. Native stack and
//! branch snapshots are not the backend's job, they come from the capturer
//! wired into the engine (see `core::perf`).

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use super::{
    backend::{AttachMode, BackendStats, FuncEvent, FuncEventKind, ProbeBackend},
    FuncTable,
};
use crate::{
    core::{stack::engine::StackEngine, stack::TASK_COMM_LEN, RetsnoopError},
    helpers::signals::Running,
};

/// Group our probes are registered under, also used to tell our events apart
/// in the trace output.
const PROBE_GROUP: &str = "retsnoop";

/// How long the reader sleeps when the trace pipe has no data.
const PIPE_IDLE_SLEEP_MS: u64 = 20;

/// Find the tracefs mount point.
pub(crate) fn tracefs_root() -> Result<PathBuf> {
    for root in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        let path = Path::new(root);
        if path.join("kprobe_events").exists() {
            return Ok(path.to_path_buf());
        }
    }
    Err(anyhow!(
        "Could not find a usable tracefs mount point; is tracefs mounted?"
    ))
}

/// Kprobe event definition for a function entry probe.
fn entry_spec(id: u32, func: &str) -> String {
    format!("p:{PROBE_GROUP}/e_{id} {func}")
}

/// Kprobe event definition for a function return probe.
fn exit_spec(id: u32, func: &str) -> String {
    format!("r:{PROBE_GROUP}/x_{id} {func} ret=$retval")
}

/// One decoded trace pipe line belonging to our probe group.
fn parse_trace_line(line: &str) -> Option<FuncEvent> {
    // <comm>-<pid> [<cpu>] <flags> <secs>.<usecs>: <event>: <args>
    let (task, rest) = line.split_once('[')?;
    let (comm_str, pid) = task.trim().rsplit_once('-')?;
    let pid: u32 = pid.parse().ok()?;

    let (cpu, rest) = rest.split_once(']')?;
    let cpu: u32 = cpu.trim().parse().ok()?;

    let (head, tail) = rest.split_once(": ")?;
    let ts_str = head.split_whitespace().last()?;
    let (secs, usecs) = ts_str.split_once('.')?;
    let ts = secs.parse::<u64>().ok()? * 1_000_000_000 + usecs.parse::<u64>().ok()? * 1_000;

    let (event, args) = tail.split_once(':')?;
    let (kind, id) = match event.split_once('_') {
        Some(("e", id)) => (FuncEventKind::Entry, id),
        Some(("x", id)) => (FuncEventKind::Exit, id),
        _ => return None,
    };
    let func_id: u32 = id.parse().ok()?;

    let ret = match kind {
        FuncEventKind::Exit => {
            let ret = args.split("ret=").nth(1)?.trim();
            let ret = ret.strip_prefix("0x").unwrap_or(ret);
            u64::from_str_radix(ret, 16).ok()?
        }
        FuncEventKind::Entry => 0,
    };

    let mut comm = [0u8; TASK_COMM_LEN];
    let bytes = comm_str.as_bytes();
    let len = bytes.len().min(TASK_COMM_LEN - 1);
    comm[..len].copy_from_slice(&bytes[..len]);

    Some(FuncEvent {
        kind,
        cpu,
        func_id,
        ret,
        ts,
        pid,
        // The trace pipe only carries the thread id.
        tgid: pid,
        comm,
    })
}

pub(crate) struct TracefsBackend {
    root: PathBuf,
    funcs: Arc<FuncTable>,
    /// Event definitions we managed to install, for cleanup.
    installed: Vec<String>,
    run: Running,
    handle: Option<thread::JoinHandle<()>>,
    parse_errors: Arc<AtomicU64>,
}

impl TracefsBackend {
    pub(crate) fn new(mode: AttachMode, funcs: Arc<FuncTable>) -> Result<TracefsBackend> {
        match mode {
            AttachMode::Fentry => {
                return Err(RetsnoopError::Attach(
                    "fentry attach mode is not supported by the tracefs backend".to_string(),
                )
                .into())
            }
            AttachMode::KprobeMulti => {
                debug!("Multi-attach kprobes not available, using single kprobe events");
            }
            _ => (),
        }

        Ok(TracefsBackend {
            root: tracefs_root()?,
            funcs,
            installed: Vec::new(),
            run: Running::new(),
            handle: None,
            parse_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    fn kprobe_events(&self) -> PathBuf {
        self.root.join("kprobe_events")
    }

    fn register(&mut self, spec: &str) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(self.kprobe_events())?;
        file.write_all(format!("{spec}\n").as_bytes())
            .map_err(|e| anyhow!("Could not register '{spec}': {e}"))?;

        // Keep the removal command around for cleanup.
        let name = spec
            .split_whitespace()
            .next()
            .and_then(|p| p.split_once(':'))
            .map(|(_, name)| name.to_string())
            .unwrap_or_default();
        self.installed.push(name);
        Ok(())
    }

    fn unregister_all(&mut self) {
        // Probes can only be removed once disabled.
        let _ = fs::write(self.group_enable(), "0");

        let Ok(mut file) = OpenOptions::new().append(true).open(self.kprobe_events()) else {
            warn!("Could not open kprobe_events for cleanup");
            return;
        };

        for name in self.installed.drain(..).rev() {
            if let Err(e) = file.write_all(format!("-:{name}\n").as_bytes()) {
                warn!("Could not remove probe {name}: {e}");
            }
        }
    }

    fn group_enable(&self) -> PathBuf {
        self.root.join(format!("events/{PROBE_GROUP}/enable"))
    }
}

impl ProbeBackend for TracefsBackend {
    fn attach(&mut self) -> Result<()> {
        let funcs: Vec<(u32, String)> = self
            .funcs
            .iter()
            .map(|(id, f)| (id, f.name.clone()))
            .collect();

        for (id, name) in funcs {
            if let Err(e) = self
                .register(&entry_spec(id, &name))
                .and_then(|_| self.register(&exit_spec(id, &name)))
            {
                // No partial attachment may survive a failure.
                self.unregister_all();
                return Err(RetsnoopError::Attach(format!(
                    "Failed to attach to {name}: {e}"
                ))
                .into());
            }
        }

        info!("{} probe(s) installed", self.installed.len());
        Ok(())
    }

    fn start(&mut self, mut engine: StackEngine) -> Result<()> {
        let mut pipe = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(self.root.join("trace_pipe"))?;

        fs::write(self.group_enable(), "1")
            .map_err(|e| anyhow!("Could not enable the probe group: {e}"))?;

        let run = self.run.clone();
        let parse_errors = Arc::clone(&self.parse_errors);

        self.handle = Some(thread::spawn(move || {
            let mut buf = vec![0u8; 1 << 16];
            let mut pending = String::new();

            while run.running() {
                let read = match pipe.read(&mut buf) {
                    Ok(0) => {
                        thread::sleep(Duration::from_millis(PIPE_IDLE_SLEEP_MS));
                        continue;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(PIPE_IDLE_SLEEP_MS));
                        continue;
                    }
                    Err(e) => {
                        warn!("Could not read trace pipe: {e}");
                        break;
                    }
                };

                pending.push_str(&String::from_utf8_lossy(&buf[..read]));

                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    let line = line.trim_end();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }

                    match parse_trace_line(line) {
                        Some(event) => engine.handle_event(&event),
                        // Events from other tracers share the pipe, only
                        // count lines claiming to be ours.
                        None => {
                            if line.contains(": e_") || line.contains(": x_") {
                                parse_errors.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }

            let stats = engine.stats();
            if stats.desyncs > 0 || stats.bad_cpus > 0 {
                warn!(
                    "{} stack(s) were reset on entry/exit mismatches, {} event(s) had an unknown CPU",
                    stats.desyncs, stats.bad_cpus
                );
            }
        }));

        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.run.terminate();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.unregister_all();
        Ok(())
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TracefsBackend {
    fn drop(&mut self) {
        if !self.installed.is_empty() {
            let _ = self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_specs() {
        assert_eq!(entry_spec(42, "vfs_open"), "p:retsnoop/e_42 vfs_open");
        assert_eq!(
            exit_spec(42, "vfs_open"),
            "r:retsnoop/x_42 vfs_open ret=$retval"
        );
    }

    #[test]
    fn parse_entry_line() {
        let line =
            "            bash-1234    [002] d.z.  12345.678901: e_42: (vfs_open+0x0/0x120)";
        let ev = parse_trace_line(line).unwrap();

        assert!(matches!(ev.kind, FuncEventKind::Entry));
        assert_eq!(ev.cpu, 2);
        assert_eq!(ev.func_id, 42);
        assert_eq!(ev.pid, 1234);
        assert_eq!(ev.ts, 12345678901000);
        assert_eq!(&ev.comm[..4], b"bash");
    }

    #[test]
    fn parse_exit_line() {
        let line = "   kworker/0:1-99      [000] d.z.  12345.678912: x_7: \
                    (do_filp_open+0x9c/0x150 <- vfs_open) ret=0xfffffffffffffffe";
        let ev = parse_trace_line(line).unwrap();

        assert!(matches!(ev.kind, FuncEventKind::Exit));
        assert_eq!(ev.cpu, 0);
        assert_eq!(ev.func_id, 7);
        assert_eq!(ev.ret as i64, -2);
        // Comms with dashes parse correctly.
        assert_eq!(&ev.comm[..11], b"kworker/0:1");
    }

    #[test]
    fn parse_foreign_lines() {
        // Events from other tracers are skipped, not errors.
        assert!(parse_trace_line(
            "            bash-1234    [002] d.z.  12345.678901: sys_enter: args"
        )
        .is_none());
        assert!(parse_trace_line("# tracer: nop").is_none());
        assert!(parse_trace_line("garbage").is_none());
    }
}
