//! # Planner
//!
//! Resolves the user-provided entry/allow/deny globs against the attachable
//! kernel function universe into the final, dense function table the probes
//! and the engine work with.

use anyhow::Result;
use log::{debug, info};
use regex::Regex;

use super::{FuncFlags, FuncInfo, FuncTable, MAX_FUNC_CNT};
use crate::core::RetsnoopError;

/// A single function glob. Only wildcards (*) are supported, e.g.
/// "tcp_v6_*".
pub(crate) struct Glob {
    pattern: String,
    re: Regex,
}

impl Glob {
    pub(crate) fn new(pattern: &str) -> Result<Glob> {
        let re = Regex::new(&format!(
            "^{}$",
            regex::escape(pattern).replace(r"\*", ".*")
        ))?;

        Ok(Glob {
            pattern: pattern.to_string(),
            re,
        })
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.re.is_match(name)
    }

    pub(crate) fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// An attachable kernel function, as reported by the kernel inspector.
#[derive(Clone)]
pub(crate) struct Candidate {
    pub(crate) name: String,
    pub(crate) addr: u64,
    pub(crate) size: u64,
}

/// The attachment planner. Globs are compiled once at construction time.
pub(crate) struct Planner {
    entry_globs: Vec<Glob>,
    allow_globs: Vec<Glob>,
    deny_globs: Vec<Glob>,
}

impl Planner {
    pub(crate) fn new(entry: &[String], allow: &[String], deny: &[String]) -> Result<Planner> {
        let compile = |globs: &[String]| -> Result<Vec<Glob>> {
            globs.iter().map(|g| Glob::new(g)).collect()
        };

        Ok(Planner {
            entry_globs: compile(entry)?,
            allow_globs: compile(allow)?,
            deny_globs: compile(deny)?,
        })
    }

    /// Compute the function table from the attachable universe. `func_flags`
    /// provides the return type classification for a function name.
    pub(crate) fn plan<F>(&self, candidates: &[Candidate], func_flags: F) -> Result<FuncTable>
    where
        F: Fn(&str) -> FuncFlags,
    {
        // Entry functions are implicitly allowed.
        let allowed = |name: &str| {
            self.allow_globs.iter().any(|g| g.matches(name))
                || self.entry_globs.iter().any(|g| g.matches(name))
        };
        let denied = |name: &str| self.deny_globs.iter().any(|g| g.matches(name));

        let mut selected: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| allowed(&c.name) && !denied(&c.name))
            .collect();

        // Dense ids must be stable across runs: order by name, then address.
        selected.sort_by(|a, b| a.name.cmp(&b.name).then(a.addr.cmp(&b.addr)));

        if selected.len() > MAX_FUNC_CNT {
            return Err(RetsnoopError::Plan(format!(
                "{} functions match the filters, only up to {} are supported",
                selected.len(),
                MAX_FUNC_CNT
            ))
            .into());
        }

        let funcs: Vec<FuncInfo> = selected
            .into_iter()
            .map(|c| {
                let mut flags = func_flags(&c.name);
                if self.entry_globs.iter().any(|g| g.matches(&c.name)) {
                    flags |= FuncFlags::IS_ENTRY;
                    debug!("Function '{}' is marked as an entry point", c.name);
                }

                FuncInfo {
                    name: c.name.clone(),
                    addr: c.addr,
                    size: c.size,
                    flags,
                }
            })
            .collect();

        let table = FuncTable::new(funcs);

        // Every entry glob must be of some use, or the whole run would
        // silently trace nothing.
        for glob in self.entry_globs.iter() {
            if !table
                .iter()
                .any(|(_, f)| f.flags.contains(FuncFlags::IS_ENTRY) && glob.matches(&f.name))
            {
                return Err(RetsnoopError::Plan(format!(
                    "Entry glob '{}' doesn't match any kernel function",
                    glob.pattern()
                ))
                .into());
            }
        }

        info!("{} functions selected for instrumentation", table.len());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<Candidate> {
        ["bpf_check", "bpf_map_alloc", "do_check", "rcu_read_lock", "kmalloc"]
            .iter()
            .enumerate()
            .map(|(i, name)| Candidate {
                name: name.to_string(),
                addr: 0xffffffff81000000 + i as u64 * 0x1000,
                size: 0x1000,
            })
            .collect()
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn glob_matching() {
        let glob = Glob::new("*bpf*").unwrap();
        assert!(glob.matches("bpf_check"));
        assert!(glob.matches("raw_bpf"));
        assert!(!glob.matches("do_check"));

        // Regex metacharacters in globs are literals.
        let glob = Glob::new("f.o*").unwrap();
        assert!(glob.matches("f.oo"));
        assert!(!glob.matches("fxoo"));
    }

    #[test]
    fn plan_selection() {
        let planner = Planner::new(
            &strings(&["bpf_check"]),
            &strings(&["*check*", "bpf_*"]),
            &strings(&["rcu_*"]),
        )
        .unwrap();

        let table = planner
            .plan(&candidates(), |_| FuncFlags::NEEDS_SIGN_EXT)
            .unwrap();

        let names: Vec<&str> = table.iter().map(|(_, f)| f.name.as_str()).collect();
        // Ordered by name; rcu_read_lock denied, kmalloc not allowed.
        assert_eq!(names, ["bpf_check", "bpf_map_alloc", "do_check"]);

        // Ids are dense and flags carry the entry marking.
        let (id, entry) = table
            .iter()
            .find(|(_, f)| f.name == "bpf_check")
            .map(|(id, f)| (id, f.flags.contains(FuncFlags::IS_ENTRY)))
            .unwrap();
        assert_eq!(id, 0);
        assert!(entry);
        assert!(!table.get(2).unwrap().flags.contains(FuncFlags::IS_ENTRY));
    }

    #[test]
    fn entries_implicitly_allowed() {
        let planner =
            Planner::new(&strings(&["kmalloc"]), &strings(&["bpf_*"]), &[]).unwrap();
        let table = planner
            .plan(&candidates(), |_| FuncFlags::empty())
            .unwrap();

        assert!(table.iter().any(|(_, f)| f.name == "kmalloc"));
    }

    #[test]
    fn unmatched_entry_glob() {
        let planner =
            Planner::new(&strings(&["no_such_func*"]), &strings(&["*"]), &[]).unwrap();

        assert!(planner.plan(&candidates(), |_| FuncFlags::empty()).is_err());
    }

    #[test]
    fn denied_entry_glob_fails() {
        // Denying all bpf functions makes the entry glob useless, which has
        // to be reported.
        let planner = Planner::new(
            &strings(&["bpf_check"]),
            &strings(&["*"]),
            &strings(&["bpf_*"]),
        )
        .unwrap();

        assert!(planner.plan(&candidates(), |_| FuncFlags::empty()).is_err());
    }
}
