//! # Stack rendering
//!
//! Turns filtered `CallStack` records into annotated console output: the
//! logical function stack is reconciled with the native kernel stack,
//! instrumentation artifacts are removed, addresses are symbolized and branch
//! records are trimmed to the failing function.

use std::io::Write;

use anyhow::Result;
use time::UtcOffset;

use super::{
    filter::frame_result,
    symbolize::{SymbMode, SymbolizedFrame, Symbolizer},
};
use crate::{
    core::{
        errno::err_to_str,
        inspect::KsymResolver,
        probe::FuncTable,
        stack::{CallStack, MAX_KSTACK_DEPTH, MAX_LBR_CNT},
    },
    helpers::time::ts_to_str,
};

/// Return probes observe addresses this far past the function entry; such
/// frames are resolved back to the entry itself.
pub(crate) const FTRACE_OFFSET: u64 = 0x5;

const LAT_WIDTH: usize = 12;
const ERR_WIDTH: usize = 12;
/// Column the source location is aligned to.
const SRC_PRINT_OFF: usize = 70;

/// One logical stack frame, ready for printing.
struct FstackItem {
    id: u32,
    name: String,
    res: i64,
    lat: u64,
    finished: bool,
    stitched: bool,
}

/// One native stack frame.
#[derive(Clone)]
struct KstackItem {
    addr: u64,
    /// Resolved (name, base address), if any.
    sym: Option<(String, u64)>,
    /// Instrumentation artifact kept visible in full-stacks mode.
    filtered: bool,
}

impl KstackItem {
    fn name(&self) -> Option<&str> {
        self.sym.as_ref().map(|(name, _)| name.as_str())
    }
}

fn is_bpf_tramp(item: &KstackItem) -> bool {
    match item.name().and_then(|n| n.strip_prefix("bpf_trampoline_")) {
        Some(rest) => rest.starts_with(|c: char| c.is_ascii_digit()),
        None => false,
    }
}

fn is_bpf_prog(item: &KstackItem) -> bool {
    match item.name().and_then(|n| n.strip_prefix("bpf_prog_")) {
        Some(rest) => rest.starts_with(|c: char| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Find where a well-known kernel source root starts in a path, to shorten
/// the build-machine prefix away.
fn detect_linux_src_loc(path: &str) -> usize {
    static LINUX_DIRS: &[&str] = &[
        "arch/", "kernel/", "include/", "block/", "fs/", "net/", "drivers/", "mm/", "ipc/",
        "security/", "lib/", "crypto/", "certs/", "init/", "scripts/", "sound/", "tools/",
        "usr/", "virt/",
    ];

    for dir in LINUX_DIRS {
        if let Some(pos) = path.find(dir) {
            return pos;
        }
    }
    0
}

pub(crate) struct RenderConfig {
    /// Keep (and mark) instrumentation artifacts instead of dropping them.
    pub(crate) full_stacks: bool,
    /// Render captured branch records.
    pub(crate) use_lbr: bool,
    pub(crate) symb_mode: SymbMode,
    /// Added to emission timestamps to print wall-clock time.
    pub(crate) clock_offset: u64,
    pub(crate) utc_offset: Option<UtcOffset>,
}

pub(crate) struct StackRenderer<'a> {
    funcs: &'a FuncTable,
    ksyms: &'a dyn KsymResolver,
    symbolizer: Option<&'a Symbolizer>,
    config: RenderConfig,
}

impl<'a> StackRenderer<'a> {
    pub(crate) fn new(
        funcs: &'a FuncTable,
        ksyms: &'a dyn KsymResolver,
        symbolizer: Option<&'a Symbolizer>,
        config: RenderConfig,
    ) -> StackRenderer<'a> {
        StackRenderer {
            funcs,
            ksyms,
            symbolizer,
            config,
        }
    }

    /// Render one record.
    pub(crate) fn process_one(&self, w: &mut dyn Write, stack: &CallStack) -> Result<()> {
        let fstack = self.build_fstack(stack);
        let kstack = self.build_kstack(stack);

        writeln!(
            w,
            "{} PID {} ({}):",
            ts_to_str(
                stack.emit_ts + self.config.clock_offset,
                self.config.utc_offset
            ),
            stack.pid,
            stack.comm_str(),
        )?;

        // Walk both stacks together: native-only frames print before the
        // logical frame they lead to, matched frames print merged, leftovers
        // print on their own.
        let (mut i, mut j) = (0, 0);
        while i < fstack.len() {
            let fitem = &fstack[i];

            let kitem = match kstack.get(j) {
                Some(kitem) => kitem,
                None => {
                    // No native stack (or too short): logical frames only.
                    self.print_item(w, Some(fitem), None)?;
                    i += 1;
                    continue;
                }
            };

            // Exhaust native frames with no logical counterpart; the
            // matching frame should show up eventually when the native
            // stack is correct.
            let matched = !kitem.filtered && kitem.name() == Some(fitem.name.as_str());
            if !matched {
                self.print_item(w, None, Some(kitem))?;
                j += 1;
                continue;
            }

            self.print_item(w, Some(fitem), Some(kitem))?;
            i += 1;
            j += 1;
        }

        for kitem in kstack.iter().skip(j) {
            self.print_item(w, None, Some(kitem))?;
        }

        if self.config.use_lbr && stack.lbrs_sz > 0 {
            self.render_lbrs(w, stack, &fstack)?;
        }

        writeln!(w)?;
        Ok(())
    }

    /// Build the printable logical stack, leaf last. When an adjacent
    /// stitched sibling exists, the shared prefix comes first, then the
    /// failing sibling frames (marked), then the current continuation.
    fn build_fstack(&self, stack: &CallStack) -> Vec<FstackItem> {
        let mut items = Vec::new();

        let mut push_current = |items: &mut Vec<FstackItem>, i: usize| {
            let id = stack.func_ids[i];
            items.push(FstackItem {
                id,
                name: self.func_name(id),
                res: frame_result(self.funcs.flags(id), stack.func_res[i]),
                lat: stack.func_lat[i],
                finished: i >= stack.depth,
                stitched: false,
            });
        };

        if stack.has_stitched() {
            for i in 0..stack.saved_depth - 1 {
                push_current(&mut items, i);
            }
            for i in stack.saved_depth - 1..stack.saved_max_depth {
                let id = stack.saved_ids[i];
                items.push(FstackItem {
                    id,
                    name: self.func_name(id),
                    res: frame_result(self.funcs.flags(id), stack.saved_res[i]),
                    lat: stack.saved_lat[i],
                    finished: true,
                    stitched: true,
                });
            }
            for i in stack.saved_depth - 1..stack.max_depth {
                push_current(&mut items, i);
            }
        } else {
            for i in 0..stack.max_depth {
                push_current(&mut items, i);
            }
        }

        items
    }

    fn func_name(&self, id: u32) -> String {
        match self.funcs.get(id) {
            Some(info) => info.name.clone(),
            None => format!("func_{id}"),
        }
    }

    /// Build the printable native stack: reverse the raw addresses to
    /// natural call order, resolve symbols and remove (or mark, in
    /// full-stacks mode) instrumentation artifacts.
    fn build_kstack(&self, stack: &CallStack) -> Vec<KstackItem> {
        let n = stack.kstack_sz.min(MAX_KSTACK_DEPTH);
        let raw: Vec<KstackItem> = (0..n)
            .map(|i| {
                let addr = stack.kstack[n - 1 - i];
                KstackItem {
                    addr,
                    sym: self.ksyms.resolve_ksym(addr),
                    filtered: false,
                }
            })
            .collect();

        let mut out = Vec::with_capacity(n);
        let mut i = 0;
        while i < raw.len() {
            let item = &raw[i];

            if item.sym.is_some() {
                // Return trampolines leave a tell-tale sandwich in stack
                // traces: X+FTRACE_OFFSET, the trampoline, then the real
                // X frame. Only the last one matters.
                if i + 2 < raw.len()
                    && is_bpf_tramp(&raw[i + 1])
                    && item.name() == raw[i + 2].name()
                    && item
                        .sym
                        .as_ref()
                        .is_some_and(|(_, base)| item.addr - base == FTRACE_OFFSET)
                {
                    match self.config.full_stacks {
                        true => {
                            let mut marked = item.clone();
                            marked.filtered = true;
                            out.push(marked);
                            i += 1;
                        }
                        false => i += 2,
                    }
                    continue;
                }

                // Trampolines and programs of our own instrumentation, plus
                // the stack capturing helper itself.
                if is_bpf_tramp(item)
                    || is_bpf_prog(item)
                    || item.name() == Some("bpf_get_stack_raw_tp")
                {
                    if self.config.full_stacks {
                        let mut marked = item.clone();
                        marked.filtered = true;
                        out.push(marked);
                    }
                    i += 1;
                    continue;
                }
            }

            out.push(item.clone());
            i += 1;
        }

        out
    }

    /// Print one output line: an optionally matched (logical, native) frame
    /// pair, with symbolized source location and inline frames.
    fn print_item(
        &self,
        w: &mut dyn Write,
        fitem: Option<&FstackItem>,
        kitem: Option<&KstackItem>,
    ) -> Result<()> {
        let src_off = SRC_PRINT_OFF + if self.config.full_stacks { 18 } else { 0 };

        let mut symb: Vec<SymbolizedFrame> = Vec::new();
        if self.config.symb_mode != SymbMode::None {
            if let (Some(symbolizer), Some(kitem)) = (self.symbolizer, kitem) {
                if !kitem.filtered {
                    let mut addr = kitem.addr;
                    if let Some((_, base)) = &kitem.sym {
                        if addr - base == FTRACE_OFFSET {
                            addr -= FTRACE_OFFSET;
                        }
                    }
                    symb = symbolizer.symbolize(addr);
                }
            }
        }

        let mut line = String::new();

        // Missing native frames are rare (no kernel stack at all or a bug),
        // make them stand out.
        line.push(if kitem.is_none() { '!' } else { ' ' });
        line.push(match fitem {
            Some(f) if f.stitched => '*',
            _ => ' ',
        });
        line.push(' ');

        match fitem {
            Some(f) if !f.finished => {
                line.push_str(&format!(
                    "{:>lat$} {:<err$} ",
                    "...",
                    "[...]",
                    lat = LAT_WIDTH,
                    err = ERR_WIDTH
                ));
            }
            Some(f) => {
                line.push_str(&format!("{:>lat$}us ", f.lat / 1000, lat = LAT_WIDTH - 2));
                let err = match f.res {
                    0 => "[NULL]".to_string(),
                    res => match err_to_str(res) {
                        Some(name) => format!("[-{name}]"),
                        None => format!("[{res}]"),
                    },
                };
                line.push_str(&format!("{err:<ERR_WIDTH$} "));
            }
            None => {
                line.push_str(&format!("{:width$} ", "", width = LAT_WIDTH + 1 + ERR_WIDTH));
            }
        }

        if self.config.full_stacks {
            match kitem {
                Some(k) if k.filtered => line.push_str(&format!("~{:016x} ", k.addr)),
                Some(k) => line.push_str(&format!(" {:016x} ", k.addr)),
                None => line.push_str(&format!(" {:16} ", "")),
            }
        }

        let fname = match (kitem.and_then(|k| k.name()), fitem) {
            (Some(name), _) => name.to_string(),
            (None, Some(f)) => f.name.clone(),
            (None, None) => String::new(),
        };

        let func_print_off = line.len();
        line.push_str(&fname);
        if let Some(kitem) = kitem {
            if let Some((_, base)) = &kitem.sym {
                line.push_str(&format!("+0x{:x}", kitem.addr - base));
            }
        }

        if let Some(main) = symb.last() {
            let pad = src_off.saturating_sub(line.len());
            line.push_str(&format!(" {:pad$}(", ""));
            if !main.name.is_empty() && main.name != fname {
                line.push_str(&format!("{} @ ", main.name));
            }
            let loc_off = detect_linux_src_loc(&main.location);
            line.push_str(&format!("{})", &main.location[loc_off..]));
        }

        writeln!(w, "{line}")?;

        // Inline frames, innermost last to follow the call order of the
        // surrounding lines.
        for frame in symb.iter().rev().skip(1) {
            let mut line = format!("{:func_print_off$}. {}", "", frame.name);
            let pad = src_off.saturating_sub(line.len());
            let loc_off = detect_linux_src_loc(&frame.location);
            line.push_str(&format!(" {:pad$}({})", "", &frame.location[loc_off..]));
            writeln!(w, "{line}")?;
        }

        Ok(())
    }

    /// Render the captured branch records, trimmed to the failing function:
    /// the newest branches record our own instrumentation jumps, everything
    /// from the first branch overlapping the failing function is relevant.
    fn render_lbrs(&self, w: &mut dyn Write, stack: &CallStack, fstack: &[FstackItem]) -> Result<()> {
        let (mut start, mut end) = (0u64, 0u64);

        let leaf_id = if stack.is_err && stack.max_depth > 0 {
            Some(stack.func_ids[stack.max_depth - 1])
        } else if stack.has_stitched() {
            Some(stack.saved_ids[stack.saved_max_depth - 1])
        } else {
            fstack.last().map(|f| f.id)
        };
        if let Some(info) = leaf_id.and_then(|id| self.funcs.get(id)) {
            if info.size > 0 {
                start = info.addr;
                end = info.addr + info.size;
            }
        }

        let matches = |addr: u64| start == 0 || (start <= addr && addr < end);

        let cnt = stack.lbrs_sz.min(MAX_LBR_CNT);
        let mut lbr_to = 0;
        if !self.config.full_stacks {
            while lbr_to < cnt
                && !matches(stack.lbrs[lbr_to].from)
                && !matches(stack.lbrs[lbr_to].to)
            {
                lbr_to += 1;
            }
        }

        let first = match lbr_to == cnt {
            true => 0,
            false => lbr_to,
        };
        for i in (first..cnt).rev() {
            writeln!(
                w,
                "[LBR #{:02}] 0x{:016x} -> 0x{:016x}",
                i, stack.lbrs[i].from, stack.lbrs[i].to
            )?;
            self.emit_lbr(w, "<-\t", stack.lbrs[i].from)?;
            self.emit_lbr(w, "->\t", stack.lbrs[i].to)?;
        }

        if lbr_to == cnt {
            writeln!(
                w,
                "[LBR] No relevant LBR data were captured, showing unfiltered LBR stack!"
            )?;
        }

        Ok(())
    }

    /// One side of a branch record: symbol, offset and source location.
    fn emit_lbr(&self, w: &mut dyn Write, pfx: &str, addr: u64) -> Result<()> {
        match self.ksyms.resolve_ksym(addr) {
            Some((name, base)) => write!(w, "{pfx}{name}+0x{:x}", addr - base)?,
            None => write!(w, "{pfx}")?,
        }

        let symb = match (self.symbolizer, self.config.symb_mode) {
            (Some(symbolizer), mode) if mode != SymbMode::None => symbolizer.symbolize(addr),
            _ => Vec::new(),
        };

        match symb.last() {
            Some(main) => {
                let loc_off = detect_linux_src_loc(&main.location);
                writeln!(w, " ({})", &main.location[loc_off..])?;
            }
            None => writeln!(w)?,
        }

        for frame in symb.iter().rev().skip(1) {
            let loc_off = detect_linux_src_loc(&frame.location);
            writeln!(w, "\t\t. {} ({})", frame.name, &frame.location[loc_off..])?;
        }

        Ok(())
    }
}
