//! # Cli
//!
//! Command line interface and its conversion into the tool configuration:
//! preset glob bundles, glob files (@FILE), compile-unit filters (:CU) and
//! the error mask building rules all live here.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;

use crate::{
    core::{
        errno::{str_to_err, ErrnoMask},
        probe::backend::AttachMode,
        RetsnoopError,
    },
    process::symbolize::SymbMode,
};

/// A preset bundle of entry/allow/deny globs for a common use case.
struct Preset {
    name: &'static str,
    entry_globs: &'static [&'static str],
    allow_globs: &'static [&'static str],
    deny_globs: &'static [&'static str],
}

static PRESETS: &[Preset] = &[
    Preset {
        name: "bpf",
        entry_globs: &["*_sys_bpf"],
        allow_globs: &[
            "*bpf*", "*btf*", "do_check*", "reg_*", "check_*", "resolve_*", "convert_*",
            "adjust_*", "sanitize_*", "map_*", "ringbuf_*", "array_*", "__vmalloc_*",
            "__alloc*", "pcpu_*", "memdup_*", "stack_map_*", "htab_*", "generic_map_*",
            "*copy_from*", "*copy_to*",
        ],
        deny_globs: &[
            "bpf_get_smp_processor_id",
            "bpf_get_current_pid_tgid",
            "*migrate*",
            "rcu_read_lock*",
            "rcu_read_unlock*",
            // Too noisy.
            "bpf_lsm_*",
            "check_cfs_rq_runtime",
            "find_busiest_group",
            "find_vma*",
            // Non-failing.
            "btf_sec_info_cmp",
            // Can't attach for some reason.
            "copy_to_user_nofault",
        ],
    },
    Preset {
        name: "perf",
        entry_globs: &["*_sys_perf_event_open", "perf_ioctl"],
        allow_globs: &["*perf_*"],
        deny_globs: &[],
    },
];

#[derive(Parser, Debug, Default)]
#[command(
    name = "retsnoop",
    version,
    about = "Trace kernel call stacks that lead to failing function returns.

retsnoop mass-attaches probes to the kernel functions selected by entry, allow
and deny globs, follows function entries and exits per CPU and prints the call
stacks whose leaf returned an error, symbolized and annotated."
)]
pub(crate) struct Cli {
    #[arg(
        short = 'v',
        action = clap::ArgAction::Count,
        help = "Verbose output (-vv for debug, -vvv for extra debug output)"
    )]
    pub(crate) verbose: u8,
    #[arg(long, help = "Perform a dry run (plan and validate, don't attach probes)")]
    pub(crate) dry_run: bool,

    // Attach mechanism specification.
    #[arg(
        short = 'M',
        long = "kprobes-multi",
        conflicts_with_all = ["kprobes", "fentries"],
        help = "Use multi-attach kprobes/kretprobes, if supported"
    )]
    pub(crate) kprobes_multi: bool,
    #[arg(
        short = 'K',
        long = "kprobes",
        conflicts_with_all = ["kprobes_multi", "fentries"],
        help = "Use single-attach kprobes/kretprobes"
    )]
    pub(crate) kprobes: bool,
    #[arg(
        short = 'F',
        long = "fentries",
        conflicts_with_all = ["kprobes_multi", "kprobes"],
        help = "Use fentries/fexits instead of kprobes/kretprobes"
    )]
    pub(crate) fentries: bool,

    // Target functions specification.
    #[arg(
        short = 'c',
        long = "case",
        value_name = "CASE",
        help = "Use a pre-defined set of entry/allow/deny globs for a given use case (supported cases: bpf, perf)"
    )]
    pub(crate) cases: Vec<String>,
    #[arg(
        short = 'e',
        long = "entry",
        value_name = "GLOB",
        help = "Glob for entry functions that trigger stack trace collection (@FILE and :CU forms accepted)"
    )]
    pub(crate) entry_globs: Vec<String>,
    #[arg(
        short = 'a',
        long = "allow",
        value_name = "GLOB",
        help = "Glob for allowed functions captured in the stack traces"
    )]
    pub(crate) allow_globs: Vec<String>,
    #[arg(
        short = 'd',
        long = "deny",
        value_name = "GLOB",
        help = "Glob for denied functions ignored during collection"
    )]
    pub(crate) deny_globs: Vec<String>,

    // Stack filtering specification.
    #[arg(short = 'p', long = "pid", help = "Only trace given PID. Can be repeated")]
    pub(crate) allow_pids: Vec<u32>,
    #[arg(short = 'P', long = "no-pid", help = "Skip tracing given PID. Can be repeated")]
    pub(crate) deny_pids: Vec<u32>,
    #[arg(
        short = 'n',
        long = "comm",
        help = "Only trace processes with given name. Can be repeated"
    )]
    pub(crate) allow_comms: Vec<String>,
    #[arg(
        short = 'N',
        long = "no-comm",
        help = "Skip tracing processes with given name. Can be repeated"
    )]
    pub(crate) deny_comms: Vec<String>,
    #[arg(
        short = 'L',
        long = "longer",
        value_name = "MS",
        help = "Only emit stacks that took at least a given amount of milliseconds"
    )]
    pub(crate) longer_than_ms: Option<u64>,
    #[arg(short = 'S', long = "success-stacks", help = "Emit any stack, successful or not")]
    pub(crate) success_stacks: bool,
    #[arg(
        short = 'x',
        long = "allow-errors",
        value_name = "ERROR",
        allow_hyphen_values = true,
        help = "Record stacks only with specified errors (-ENOENT or ENOENT)"
    )]
    pub(crate) allow_errors: Vec<String>,
    #[arg(
        short = 'X',
        long = "deny-errors",
        value_name = "ERROR",
        allow_hyphen_values = true,
        help = "Ignore stacks that have specified errors"
    )]
    pub(crate) deny_errors: Vec<String>,

    // Misc settings.
    #[arg(
        long,
        value_name = "FLAGS",
        num_args = 0..=1,
        default_missing_value = "",
        help = "Capture and print LBR entries, optionally overriding the branch type flags"
    )]
    pub(crate) lbr: Option<String>,
    #[arg(
        short = 'k',
        long = "kernel",
        value_name = "PATH",
        help = "Path to vmlinux image with DWARF information embedded"
    )]
    pub(crate) kernel: Option<PathBuf>,
    #[arg(
        short = 's',
        long = "symbolize",
        value_name = "LEVEL",
        num_args = 0..=1,
        default_missing_value = "line",
        help = "Symbolization settings (-s for line info, -ss for also inline functions, -sn to disable)"
    )]
    pub(crate) symbolize: Option<String>,
    #[arg(
        short = 'A',
        long = "intermediate-stacks",
        help = "Emit all partial (intermediate) stack traces"
    )]
    pub(crate) intermediate_stacks: bool,
    #[arg(long, help = "Emit non-filtered full stack traces")]
    pub(crate) full_stacks: bool,
    #[arg(
        long,
        value_name = "SIZE",
        default_value_t = 1024,
        help = "Backend stacks map size"
    )]
    pub(crate) stacks_map_size: u32,
}

/// The validated tool configuration the session runs with.
pub(crate) struct Config {
    pub(crate) log_level: LevelFilter,
    pub(crate) dry_run: bool,

    pub(crate) attach_mode: AttachMode,
    pub(crate) entry_globs: Vec<String>,
    pub(crate) allow_globs: Vec<String>,
    pub(crate) deny_globs: Vec<String>,
    /// Compile-unit filters, expanded through the symbolizer later on.
    pub(crate) cu_entry_globs: Vec<String>,
    pub(crate) cu_allow_globs: Vec<String>,
    pub(crate) cu_deny_globs: Vec<String>,

    pub(crate) allow_pids: Vec<u32>,
    pub(crate) deny_pids: Vec<u32>,
    pub(crate) allow_comms: Vec<String>,
    pub(crate) deny_comms: Vec<String>,
    pub(crate) longer_than_ms: u64,
    pub(crate) success_stacks: bool,
    pub(crate) intermediate_stacks: bool,

    pub(crate) allow_errors: ErrnoMask,
    pub(crate) deny_errors: ErrnoMask,
    pub(crate) has_error_filter: bool,

    pub(crate) use_lbr: bool,
    pub(crate) lbr_flags: Option<u64>,
    pub(crate) vmlinux: Option<PathBuf>,
    pub(crate) symb_mode: SymbMode,
    pub(crate) full_stacks: bool,
    pub(crate) stacks_map_size: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            log_level: LevelFilter::Warn,
            dry_run: false,
            attach_mode: AttachMode::Default,
            entry_globs: Vec::new(),
            allow_globs: Vec::new(),
            deny_globs: Vec::new(),
            cu_entry_globs: Vec::new(),
            cu_allow_globs: Vec::new(),
            cu_deny_globs: Vec::new(),
            allow_pids: Vec::new(),
            deny_pids: Vec::new(),
            allow_comms: Vec::new(),
            deny_comms: Vec::new(),
            longer_than_ms: 0,
            success_stacks: false,
            intermediate_stacks: false,
            allow_errors: ErrnoMask::full(),
            deny_errors: ErrnoMask::empty(),
            has_error_filter: false,
            use_lbr: false,
            lbr_flags: None,
            vmlinux: None,
            symb_mode: SymbMode::Default,
            full_stacks: false,
            stacks_map_size: 1024,
        }
    }
}

/// Append a glob argument to the right list, expanding @FILE references
/// (whitespace-separated globs) and routing :CU filters.
fn append_glob(globs: &mut Vec<String>, cu_globs: &mut Vec<String>, arg: &str) -> Result<()> {
    if let Some(file) = arg.strip_prefix('@') {
        let content = fs::read_to_string(file).with_context(|| format!("Failed to open '{file}'"))?;
        globs.extend(content.split_whitespace().map(String::from));
    } else if let Some(cu) = arg.strip_prefix(':') {
        cu_globs.push(cu.to_string());
    } else {
        globs.push(arg.to_string());
    }
    Ok(())
}

/// Same expansion for comm lists, which support @FILE but not :CU.
fn append_comm(comms: &mut Vec<String>, arg: &str) -> Result<()> {
    if let Some(file) = arg.strip_prefix('@') {
        let content = fs::read_to_string(file).with_context(|| format!("Failed to open '{file}'"))?;
        comms.extend(content.split_whitespace().map(String::from));
    } else {
        comms.push(arg.to_string());
    }
    Ok(())
}

fn parse_lbr_flags(arg: &str) -> Result<Option<u64>> {
    if arg.is_empty() {
        return Ok(None);
    }
    let flags = match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    }
    .map_err(|_| RetsnoopError::Config(format!("Failed to parse LBR flags spec '{arg}'")))?;
    Ok(Some(flags))
}

impl Cli {
    /// Validate and expand the parsed arguments into the tool configuration.
    pub(crate) fn into_config(self) -> Result<Config> {
        let mut config = Config {
            // -vvv (trace) also enables the backend event tracing.
            log_level: match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            },
            dry_run: self.dry_run,
            attach_mode: match (self.kprobes_multi, self.kprobes, self.fentries) {
                (true, _, _) => AttachMode::KprobeMulti,
                (_, true, _) => AttachMode::KprobeSingle,
                (_, _, true) => AttachMode::Fentry,
                _ => AttachMode::Default,
            },
            allow_pids: self.allow_pids,
            deny_pids: self.deny_pids,
            longer_than_ms: self.longer_than_ms.unwrap_or(0),
            success_stacks: self.success_stacks,
            intermediate_stacks: self.intermediate_stacks,
            full_stacks: self.full_stacks,
            stacks_map_size: self.stacks_map_size,
            vmlinux: self.kernel,
            ..Default::default()
        };

        for case in self.cases.iter() {
            let preset = PRESETS.iter().find(|p| p.name == case).ok_or_else(|| {
                RetsnoopError::Config(format!("Unknown preset '{case}' specified"))
            })?;

            let extend = |dst: &mut Vec<String>, src: &[&str]| {
                dst.extend(src.iter().map(|s| s.to_string()))
            };
            extend(&mut config.entry_globs, preset.entry_globs);
            extend(&mut config.allow_globs, preset.allow_globs);
            extend(&mut config.deny_globs, preset.deny_globs);
        }

        for glob in self.entry_globs.iter() {
            append_glob(&mut config.entry_globs, &mut config.cu_entry_globs, glob)?;
        }
        for glob in self.allow_globs.iter() {
            append_glob(&mut config.allow_globs, &mut config.cu_allow_globs, glob)?;
        }
        for glob in self.deny_globs.iter() {
            append_glob(&mut config.deny_globs, &mut config.cu_deny_globs, glob)?;
        }

        for comm in self.allow_comms.iter() {
            append_comm(&mut config.allow_comms, comm)?;
        }
        for comm in self.deny_comms.iter() {
            append_comm(&mut config.deny_comms, comm)?;
        }

        // We start out with all errors allowed; the first allowed error
        // resets the mask so only the listed ones remain.
        for (i, name) in self.allow_errors.iter().enumerate() {
            if i == 0 {
                config.allow_errors.clear();
            }
            config.allow_errors.set(str_to_err(name)?);
            config.has_error_filter = true;
        }
        // Nothing is denied by default, no reset needed.
        for name in self.deny_errors.iter() {
            config.deny_errors.set(str_to_err(name)?);
            config.has_error_filter = true;
        }

        if let Some(lbr) = self.lbr.as_deref() {
            config.use_lbr = true;
            config.lbr_flags = parse_lbr_flags(lbr)?;
        }

        config.symb_mode = match self.symbolize.as_deref() {
            None => SymbMode::Default,
            Some("line") => SymbMode::LineInfo,
            Some("s") | Some("inlines") => SymbMode::Inlines,
            Some("n") | Some("none") => SymbMode::None,
            Some(x) => {
                return Err(RetsnoopError::Config(format!(
                    "Unrecognized symbolization setting '{x}', only -s, -ss and -sn are supported"
                ))
                .into())
            }
        };

        if config.entry_globs.is_empty() && config.cu_entry_globs.is_empty() {
            return Err(RetsnoopError::Config(
                "No entry point globs specified. \
                 Please provide entry glob(s) ('-e GLOB') and/or any preset ('-c CASE')"
                    .to_string(),
            )
            .into());
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Result<Config> {
        Cli::try_parse_from(args).unwrap().into_config()
    }

    #[test]
    fn verbosity_levels() {
        let config = config_from(&["retsnoop", "-e", "*"]).unwrap();
        assert_eq!(config.log_level, LevelFilter::Warn);

        let config = config_from(&["retsnoop", "-v", "-e", "*"]).unwrap();
        assert_eq!(config.log_level, LevelFilter::Info);

        let config = config_from(&["retsnoop", "-vvv", "-e", "*"]).unwrap();
        assert_eq!(config.log_level, LevelFilter::Trace);
    }

    #[test]
    fn entry_globs_required() {
        assert!(config_from(&["retsnoop"]).is_err());
        assert!(config_from(&["retsnoop", "-a", "*"]).is_err());
        assert!(config_from(&["retsnoop", "-e", "*_sys_bpf"]).is_ok());
        assert!(config_from(&["retsnoop", "-c", "bpf"]).is_ok());
    }

    #[test]
    fn presets() {
        let config = config_from(&["retsnoop", "-c", "bpf"]).unwrap();
        assert!(config.entry_globs.contains(&"*_sys_bpf".to_string()));
        assert!(config.allow_globs.contains(&"*bpf*".to_string()));
        assert!(config.deny_globs.contains(&"*migrate*".to_string()));

        assert!(config_from(&["retsnoop", "-c", "nope"]).is_err());
    }

    #[test]
    fn attach_modes() {
        let config = config_from(&["retsnoop", "-e", "*", "-M"]).unwrap();
        assert_eq!(config.attach_mode, AttachMode::KprobeMulti);

        let config = config_from(&["retsnoop", "-e", "*", "-F"]).unwrap();
        assert_eq!(config.attach_mode, AttachMode::Fentry);

        // -M, -K and -F are mutually exclusive.
        assert!(Cli::try_parse_from(["retsnoop", "-e", "*", "-M", "-K"]).is_err());
    }

    #[test]
    fn error_masks() {
        let config = config_from(&["retsnoop", "-e", "*", "-x", "ENOENT", "-X", "-ENOMEM"]).unwrap();
        assert!(config.has_error_filter);
        assert!(config.allow_errors.contains(-2));
        assert!(!config.allow_errors.contains(-5));
        assert!(config.deny_errors.contains(-12));

        assert!(config_from(&["retsnoop", "-e", "*", "-x", "EWHAT"]).is_err());
    }

    #[test]
    fn symbolization_modes() {
        let config = config_from(&["retsnoop", "-e", "*"]).unwrap();
        assert_eq!(config.symb_mode, SymbMode::Default);

        let config = config_from(&["retsnoop", "-e", "*", "-s"]).unwrap();
        assert_eq!(config.symb_mode, SymbMode::LineInfo);

        let config = config_from(&["retsnoop", "-e", "*", "-ss"]).unwrap();
        assert_eq!(config.symb_mode, SymbMode::Inlines);

        let config = config_from(&["retsnoop", "-e", "*", "-sn"]).unwrap();
        assert_eq!(config.symb_mode, SymbMode::None);
    }

    #[test]
    fn cu_globs_routed() {
        let config = config_from(&["retsnoop", "-e", "*", "-a", ":kernel/bpf/verifier.c"]).unwrap();
        assert_eq!(config.cu_allow_globs, ["kernel/bpf/verifier.c"]);
        assert!(config.allow_globs.is_empty());
    }

    #[test]
    fn lbr_flags() {
        let config = config_from(&["retsnoop", "-e", "*"]).unwrap();
        assert!(!config.use_lbr);

        let config = config_from(&["retsnoop", "-e", "*", "--lbr"]).unwrap();
        assert!(config.use_lbr);
        assert_eq!(config.lbr_flags, None);

        let config = config_from(&["retsnoop", "-e", "*", "--lbr", "0x10"]).unwrap();
        assert_eq!(config.lbr_flags, Some(0x10));
    }
}
