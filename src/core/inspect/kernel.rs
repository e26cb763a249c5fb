// Internal library, some helpers might not be used, that's fine.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    fs,
    io::Read,
    ops::Bound::{Excluded, Included, Unbounded},
    path::Path,
    str,
};

use anyhow::{anyhow, bail, Result};
use bimap::BiBTreeMap;
use flate2::bufread::GzDecoder;
use log::warn;
use regex::Regex;

use super::{btf::BtfInfo, kernel_version::KernelVersion};

/// Provides helpers to inspect probe related information in the kernel.
pub(crate) struct KernelInspector {
    /// Btf information, None when the kernel does not expose BTF.
    pub(crate) btf: Option<BtfInfo>,
    /// Symbols bi-directional map (addr<>name).
    symbols: BiBTreeMap<u64, String>,
    /// Function (text) symbol names.
    funcs: HashSet<String>,
    /// Symbol names appearing more than once in kallsyms; those can't be
    /// targeted unambiguously and are dropped from the attachable set.
    ambiguous: HashSet<String>,
    /// Set of traceable functions (e.g. kprobes).
    traceable_funcs: Option<HashSet<String>>,
    /// Kernel version, eg. "6.2.14-300" (Fedora) or "5.10.0-22" (Debian).
    version: KernelVersion,
    /// Map of all kernel config options and their values. Common values are
    /// "y", "m" and "n", but options can also be set to a string and some
    /// other types. All are stored as a String here.
    config: Option<HashMap<String, String>>,
}

impl KernelInspector {
    pub(super) fn new() -> Result<KernelInspector> {
        let (symbols_file, funcs_file) = match cfg!(test) {
            false => (
                "/proc/kallsyms".to_owned(),
                "/sys/kernel/debug/tracing/available_filter_functions".to_owned(),
            ),
            true => (
                "test_data/kallsyms".to_owned(),
                "test_data/available_filter_functions".to_owned(),
            ),
        };

        let btf = match cfg!(test) {
            false => match BtfInfo::new() {
                Ok(btf) => Some(btf),
                Err(e) => {
                    warn!("Kernel BTF is not available, function return types will be guessed: {e}");
                    None
                }
            },
            true => None,
        };

        let mut symbols = BiBTreeMap::new();
        let mut funcs = HashSet::new();
        let mut ambiguous = HashSet::new();

        for line in fs::read_to_string(&symbols_file)?.lines() {
            let data: Vec<&str> = line.split(' ').collect();
            if data.len() < 3 {
                bail!("Invalid kallsyms line: {}", line);
            }

            let symbol: &str = data[2]
                .split('\t')
                .next()
                .ok_or_else(|| anyhow!("Couldn't get symbol name for {}", data[0]))?;

            let addr = u64::from_str_radix(data[0], 16)?;

            if matches!(data[1], "t" | "T" | "w" | "W") {
                if !funcs.insert(symbol.to_string()) {
                    ambiguous.insert(symbol.to_string());
                }
            }

            symbols.insert(addr, String::from(symbol));
        }

        // If all symbols have a 0-address, only one entry is left in the map
        // after the above.
        if symbols.len() <= 1 {
            bail!("Could not read symbol addresses from {symbols_file}: insufficient permissions?");
        }

        let version = KernelVersion::new()?;
        let config = match cfg!(test) {
            false => Self::parse_kernel_config(&version.full),
            true => None,
        };

        let inspector = KernelInspector {
            btf,
            symbols,
            funcs,
            ambiguous,
            // Not all functions we'll get from kallsyms are traceable. Use
            // the following, when available, to narrow down our checks.
            traceable_funcs: Self::file_to_hashset(funcs_file),
            version,
            config,
        };

        if inspector.traceable_funcs.is_none() {
            warn!(
                "Could not access files in /sys/kernel/debug/tracing: consider mounting debugfs, if not a permissions issue"
            );
        }

        Ok(inspector)
    }

    /// Convert a file containing a list of str (one per line) into a HashSet.
    /// Returns None if the file can't be read.
    fn file_to_hashset<P>(target: P) -> Option<HashSet<String>>
    where
        P: AsRef<Path> + Display + Clone,
    {
        if let Ok(file) = fs::read_to_string(target.clone()) {
            let mut set = HashSet::new();
            for line in file.lines() {
                // Functions might be formatted as "func_name [module]".
                match line.split(' ').next() {
                    Some(symbol) => {
                        set.insert(symbol.to_string());
                    }
                    None => {
                        warn!("Symbol list element has an unexpected format in {target}: {line}");
                    }
                }
            }

            return Some(set);
        }
        None
    }

    /// Parse the kernel configuration from the known default paths.
    fn parse_kernel_config(release: &str) -> Option<HashMap<String, String>> {
        let paths = [
            "/proc/config.gz".to_string(),
            format!("/boot/config-{}", release),
            // CoreOS & friends.
            format!("/lib/modules/{}/config", release),
        ];
        for p in paths.iter() {
            if let Ok(config) = Self::parse_kernel_config_single(p) {
                return Some(config);
            }
        }

        warn!("Could not parse kernel configuration from known paths: some feature checks won't be performed");
        None
    }

    /// Lower level helper to try parsing a single kernel configuration file.
    fn parse_kernel_config_single<P: AsRef<Path>>(file: P) -> Result<HashMap<String, String>> {
        let parse_kconfig = |file: &str| -> Result<HashMap<String, String>> {
            let mut map = HashMap::new();

            file.lines().try_for_each(|l| -> Result<()> {
                if l.starts_with("CONFIG_") {
                    let (cfg, val) = l
                        .split_once('=')
                        .ok_or_else(|| anyhow!("Could not parse the Kconfig option"))?;

                    // Handle string values nicely.
                    let val = val.trim_start_matches('"').trim_end_matches('"');

                    map.insert(cfg.to_string(), val.to_string());
                } else if l.starts_with("# CONFIG_") {
                    // Unwrap as we just made sure this would succeed.
                    let (cfg, _) = l
                        .strip_prefix("# ")
                        .unwrap()
                        .split_once(' ')
                        .ok_or_else(|| anyhow!("Could not parse the Kconfig option"))?;
                    map.insert(cfg.to_string(), 'n'.to_string());
                }
                Ok(())
            })?;

            Ok(map)
        };

        let bytes = fs::read(file)?;
        if bytes.len() < 2 {
            bail!("Empty configuration file");
        }

        // Check gzip magic value.
        if bytes[0] == 0x1f && bytes[1] == 0x8b {
            let mut decoder = GzDecoder::new(&bytes[..]);
            let mut content = String::new();
            decoder.read_to_string(&mut content)?;

            parse_kconfig(&content)
        } else {
            parse_kconfig(str::from_utf8(&bytes)?)
        }
    }

    /// Return the running kernel version.
    pub(crate) fn version(&self) -> &KernelVersion {
        &self.version
    }

    /// The following retrieves a kernel configuration option value, if found.
    pub(crate) fn get_config_option(&self, option: &str) -> Option<&str> {
        self.config.as_ref()?.get(option).map(|x| x.as_str())
    }

    /// Return a symbol address given its name, if a relationship is found.
    pub(crate) fn get_symbol_addr(&self, name: &str) -> Result<u64> {
        Ok(*self
            .symbols
            .get_by_right(name)
            .ok_or_else(|| anyhow!("Can't get symbol address for {}", name))?)
    }

    /// Given an address, find the nearest symbol at or below it, if any.
    /// Returns its name and base address.
    pub(crate) fn find_nearest_symbol(&self, target: u64) -> Option<(&str, u64)> {
        self.symbols
            .left_range((Unbounded, Included(&target)))
            .next_back()
            .map(|(addr, name)| (name.as_str(), *addr))
    }

    /// Size of the symbol starting at the given address, aka. the distance to
    /// the next symbol. 0 when unknown.
    pub(crate) fn symbol_size(&self, addr: u64) -> u64 {
        match self.symbols.left_range((Excluded(&addr), Unbounded)).next() {
            Some((next, _)) => next - addr,
            None => 0,
        }
    }

    /// Check if a function is traceable. Return None if we can't know.
    pub(crate) fn is_function_traceable(&self, name: &str) -> Option<bool> {
        let set = self.traceable_funcs.as_ref()?;
        Some(set.contains(name))
    }

    /// Find function names matching a given pattern. So far only wildcards
    /// (*) are supported, e.g. "tcp_v6_*".
    pub(crate) fn matching_functions(&self, target: &str) -> Result<Vec<String>> {
        let target = format!("^{}$", regex::escape(target).replace(r"\*", ".*"));
        let re = Regex::new(&target)?;

        Ok(self.funcs.iter().filter(|f| re.is_match(f)).cloned().collect())
    }

    /// All functions the planner can consider for attachment: text symbols,
    /// traceable when we can check, and unambiguously named. Returned as
    /// (name, address, size) tuples.
    pub(crate) fn attachable_functions(&self) -> Vec<(String, u64, u64)> {
        self.symbols
            .iter()
            .filter(|(_, name)| {
                self.funcs.contains(*name)
                    && !self.ambiguous.contains(*name)
                    && self.is_function_traceable(name).unwrap_or(true)
            })
            .map(|(addr, name)| (name.clone(), *addr, self.symbol_size(*addr)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector() -> KernelInspector {
        KernelInspector::new().unwrap()
    }

    #[test]
    fn symbol_addr() {
        assert_eq!(inspector().get_symbol_addr("consume_skb").unwrap(), 0xffffffff95617530);
    }

    #[test]
    fn nearest_symbol() {
        let inspector = inspector();
        let addr = inspector.get_symbol_addr("consume_skb").unwrap();

        let (name, base) = inspector.find_nearest_symbol(addr + 1).unwrap();
        assert_eq!(name, "consume_skb");
        assert_eq!(base, addr);

        let (name, _) = inspector.find_nearest_symbol(addr - 1).unwrap();
        assert_ne!(name, "consume_skb");
    }

    #[test]
    fn symbol_sizes() {
        let inspector = inspector();
        let addr = inspector.get_symbol_addr("consume_skb").unwrap();
        assert_eq!(inspector.symbol_size(addr), 0x330);
    }

    #[test]
    fn matching() {
        let inspector = inspector();

        let mut funcs = inspector.matching_functions("*skb*").unwrap();
        funcs.sort();
        assert_eq!(funcs, ["consume_skb", "kfree_skbmem", "napi_consume_skb"]);

        assert_eq!(inspector.matching_functions("kfree_skbmem").unwrap().len(), 1);
        assert!(inspector.matching_functions("no_such_function*").unwrap().is_empty());
    }

    #[test]
    fn attachable() {
        let inspector = inspector();
        let funcs = inspector.attachable_functions();

        // Data symbols and non-traceable functions are not attachable.
        assert!(!funcs.iter().any(|(name, _, _)| name == "jiffies"));
        assert!(!funcs.iter().any(|(name, _, _)| name == "__static_call_return0"));
        assert!(funcs.iter().any(|(name, _, _)| name == "consume_skb"));
    }
}
