//! # Collect
//!
//! Session wiring: feature detection, planning, attachment, the polling loop
//! and the shutdown sequence.

use std::{
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use caps::{CapSet, Capability};
use log::{debug, info, warn};
use nix::unistd::Uid;
use time::UtcOffset;

use crate::{
    cli::Config,
    core::{
        events::{self, EventResult},
        feat::{cpu_count, Features},
        inspect::inspector,
        perf::SampleCapture,
        probe::{
            backend::{NoCapture, ProbeBackend, StackCapturer},
            planner::{Candidate, Planner},
            tracefs::TracefsBackend,
            FuncFlags,
        },
        stack::engine::{EngineConfig, StackEngine},
        RetsnoopError,
    },
    helpers::{
        signals::Running,
        time::{monotonic_clock_offset, monotonic_timestamp},
    },
    process::{
        filter::StackFilter,
        render::{RenderConfig, StackRenderer},
        symbolize::{self, SymbMode, Symbolizer},
    },
};

/// Transport poll timeout; also bounds the shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct Session {
    config: Config,
}

impl Session {
    pub(crate) fn new(config: Config) -> Session {
        Session { config }
    }

    /// Warn early about missing privileges; the actual failures would
    /// otherwise surface much later with less obvious errors.
    fn check_privileges(&self) {
        if !Uid::effective().is_root() {
            warn!("You are not running as root! Expect failures.");
        }

        match caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN) {
            Ok(true) => (),
            _ => warn!("CAP_SYS_ADMIN is missing: probe registration will likely fail"),
        }
    }

    /// Set up DWARF symbolization per the requested mode. In the default
    /// mode a missing vmlinux image silently downgrades to no extra
    /// symbolization; an explicit -s makes it a hard failure.
    fn setup_symbolizer(&mut self) -> Result<Option<Symbolizer>> {
        let needs_cu = !self.config.cu_entry_globs.is_empty()
            || !self.config.cu_allow_globs.is_empty()
            || !self.config.cu_deny_globs.is_empty();

        if self.config.symb_mode == SymbMode::None && !needs_cu {
            return Ok(None);
        }

        let vmlinux = self.config.vmlinux.clone().or_else(symbolize::find_vmlinux);
        let vmlinux = match vmlinux {
            Some(path) => path,
            None if self.config.symb_mode == SymbMode::Default && !needs_cu => {
                debug!("No vmlinux image found, disabling extra symbolization");
                self.config.symb_mode = SymbMode::None;
                return Ok(None);
            }
            None => {
                return Err(RetsnoopError::Config(
                    "Failed to locate a vmlinux image. Please use -k <vmlinux-path> to specify it explicitly".to_string(),
                )
                .into())
            }
        };

        // Expand compile-unit filters into plain function-name globs.
        for (cu_globs, globs) in [
            (&self.config.cu_entry_globs, &mut self.config.entry_globs),
            (&self.config.cu_allow_globs, &mut self.config.allow_globs),
            (&self.config.cu_deny_globs, &mut self.config.deny_globs),
        ] {
            for cu in cu_globs.iter() {
                globs.extend(symbolize::compile_unit_functions(&vmlinux, cu)?);
            }
        }
        self.config.vmlinux = Some(vmlinux.clone());

        if self.config.symb_mode == SymbMode::None {
            // Only the :CU expansion needed the image.
            return Ok(None);
        }

        let inlines = matches!(self.config.symb_mode, SymbMode::Default | SymbMode::Inlines);
        Ok(Some(Symbolizer::from_image(&vmlinux, inlines)?))
    }

    pub(crate) fn run(mut self) -> Result<()> {
        self.check_privileges();

        // Current local timezone, resolved before any thread is spawned.
        let utc_offset = UtcOffset::current_local_offset().ok();

        let symbolizer = self.setup_symbolizer()?;

        let features = Features::detect()?;
        if !features.has_tracefs {
            return Err(RetsnoopError::Attach(
                "No usable tracefs mount found; is tracefs mounted?".to_string(),
            )
            .into());
        }

        // Mapping from engine timestamps to the wall clock.
        let clock_offset = monotonic_clock_offset()?;

        // Plan which functions get instrumented.
        let kernel = &inspector()?.kernel;
        let candidates: Vec<Candidate> = kernel
            .attachable_functions()
            .into_iter()
            .map(|(name, addr, size)| Candidate { name, addr, size })
            .collect();
        debug!("{} attachable functions in the kernel", candidates.len());

        let planner = Planner::new(
            &self.config.entry_globs,
            &self.config.allow_globs,
            &self.config.deny_globs,
        )?;
        let funcs = Arc::new(planner.plan(&candidates, |name| match kernel.btf.as_ref() {
            Some(btf) => btf.func_flags(name),
            None => FuncFlags::NEEDS_SIGN_EXT,
        })?);

        let mut backend = TracefsBackend::new(self.config.attach_mode, Arc::clone(&funcs))?;

        let ts1 = monotonic_timestamp()?;
        backend.attach()?;
        info!(
            "Successfully attached in {} ms",
            (monotonic_timestamp()? - ts1) / 1_000_000
        );

        if self.config.dry_run {
            info!("Dry run successful, exiting...");
            backend.detach()?;
            return Ok(());
        }

        // Native stacks and branch records come from per-CPU perf sampling.
        // Both are best effort: on failure the records simply carry no
        // snapshot and the renderer degrades.
        let mut use_lbr = self.config.use_lbr;
        let mut capture = match use_lbr {
            true => match SampleCapture::new(cpu_count(), true, self.config.lbr_flags) {
                Ok(capture) => {
                    debug!("LBR capture enabled on {} CPUs", capture.cpu_cnt());
                    Some(capture)
                }
                Err(e) => {
                    warn!("Failed to create LBR perf events: {e}. Disabling LBR capture.");
                    use_lbr = false;
                    None
                }
            },
            false => None,
        };
        if capture.is_none() {
            capture = match SampleCapture::new(cpu_count(), false, None) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    warn!("Failed to create sampling perf events: {e}. Native kernel stacks won't be captured.");
                    None
                }
            };
        }
        let capturer: Box<dyn StackCapturer> = match capture {
            Some(capture) => Box::new(capture),
            None => Box::new(NoCapture),
        };

        let run = Running::new();
        run.register_term_signals()?;

        let (tx, rx) = events::channel(self.config.stacks_map_size as usize);
        let engine = StackEngine::new(
            cpu_count(),
            Arc::clone(&funcs),
            EngineConfig {
                emit_intermediate: self.config.intermediate_stacks,
                capture_lbr: use_lbr,
                allow_pids: self.config.allow_pids.clone(),
                deny_pids: self.config.deny_pids.clone(),
                allow_comms: self.config.allow_comms.clone(),
                deny_comms: self.config.deny_comms.clone(),
            },
            capturer,
            tx,
        );
        backend.start(engine)?;

        let filter = StackFilter {
            emit_successes: self.config.success_stacks,
            longer_than_ms: self.config.longer_than_ms,
            allow_errors: self.config.allow_errors.clone(),
            deny_errors: self.config.deny_errors.clone(),
            has_error_filter: self.config.has_error_filter,
        };
        let renderer = StackRenderer::new(
            &funcs,
            kernel,
            symbolizer.as_ref(),
            RenderConfig {
                full_stacks: self.config.full_stacks,
                use_lbr,
                symb_mode: self.config.symb_mode,
                clock_offset,
                utc_offset,
            },
        );

        println!("Receiving data...");
        let mut stdout = io::stdout();

        while run.running() {
            match rx.poll(POLL_TIMEOUT) {
                EventResult::Event(stack) => {
                    if filter.should_report(&stack, &funcs) {
                        renderer.process_one(&mut stdout, &stack)?;
                        stdout.flush()?;
                    }
                }
                EventResult::Timeout => (),
                EventResult::Closed => break,
            }
        }

        println!("\nDetaching... ");
        let ts1 = monotonic_timestamp()?;
        backend.detach()?;

        let dropped = rx.dropped();
        if dropped > 0 {
            warn!("{dropped} record(s) were dropped on transport overflow");
        }
        let stats = backend.stats();
        if stats.parse_errors > 0 {
            warn!("{} raw event(s) could not be decoded", stats.parse_errors);
        }

        println!(
            "DONE in {} ms.",
            (monotonic_timestamp()? - ts1) / 1_000_000
        );

        Ok(())
    }
}
