use std::fs;

use anyhow::{anyhow, bail, Result};
use btf_rs::{Btf, Type};
use log::debug;

use crate::core::probe::FuncFlags;

/// Btf provides multi-module Btf lookups.
pub(crate) struct BtfInfo {
    /// Main Btf object (vmlinux).
    vmlinux: Btf,
    /// Extra Btf objects (modules).
    modules: Vec<Btf>,
}

impl BtfInfo {
    /// Parse kernel BTF files and create a Btf object. Module BTF is best
    /// effort; the kernel can carry stale split BTF for unloaded modules.
    pub(super) fn new() -> Result<BtfInfo> {
        let vmlinux = Btf::from_file("/sys/kernel/btf/vmlinux")?;

        let modules = fs::read_dir("/sys/kernel/btf")?
            .filter_map(|f| f.ok())
            .filter(|f| f.file_name().ne("vmlinux"))
            .filter_map(|f| match Btf::from_split_file(f.path(), &vmlinux) {
                Ok(btf) => Some(btf),
                Err(e) => {
                    debug!("Could not parse module BTF {:?}: {e}", f.file_name());
                    None
                }
            })
            .collect();

        Ok(BtfInfo { vmlinux, modules })
    }

    /// Look for types based on their name and return them along with the Btf
    /// object where they were found. Subsequent lookups based on these types
    /// (such as nested types by id) must be done on the returned Btf object
    /// since type ids of different modules overlap.
    ///
    /// vmlinux is given priority in the lookups.
    pub(crate) fn resolve_types_by_name(&self, name: &str) -> Result<Vec<(&Btf, Type)>> {
        let mut types = match self.vmlinux.resolve_types_by_name(name) {
            Ok(types) => types.into_iter().map(|t| (&self.vmlinux, t)).collect(),
            Err(_) => Vec::new(),
        };

        for module in self.modules.iter() {
            if let Ok(mod_types) = module.resolve_types_by_name(name) {
                types.extend(mod_types.into_iter().map(|t| (module, t)));
            }
        }

        if types.is_empty() {
            bail!("Could not resolve type {name}");
        }
        Ok(types)
    }

    /// Derive the return value interpretation flags of a function from its
    /// BTF signature. Functions without type information are assumed to
    /// return a 32-bit signed errno, the most common case in the kernel.
    pub(crate) fn func_flags(&self, name: &str) -> FuncFlags {
        match self.try_func_flags(name) {
            Ok(flags) => flags,
            Err(_) => FuncFlags::NEEDS_SIGN_EXT,
        }
    }

    fn try_func_flags(&self, name: &str) -> Result<FuncFlags> {
        let (btf, func) = self
            .resolve_types_by_name(name)?
            .into_iter()
            .find(|(_, t)| matches!(t, Type::Func(_)))
            .ok_or_else(|| anyhow!("{name} has no function type info"))?;

        let mut type_iter = btf.type_iter(
            func.as_btf_type()
                .ok_or_else(|| anyhow!("Unable to retrieve iterable BTF type"))?,
        );

        match type_iter.next() {
            Some(Type::FuncProto(_)) => (),
            _ => bail!("Function {name} does not have a prototype"),
        }

        // The prototype chains to the return type; an empty chain means the
        // function returns void.
        let mut ret = match type_iter.next() {
            Some(t) => t,
            None => return Ok(FuncFlags::CANT_FAIL | FuncFlags::RET_VOID),
        };

        // Traverse modifiers and type aliases until the actual type.
        loop {
            ret = match ret {
                Type::Typedef(_)
                | Type::Volatile(_)
                | Type::Const(_)
                | Type::Restrict(_)
                | Type::DeclTag(_)
                | Type::TypeTag(_) => type_iter
                    .next()
                    .ok_or_else(|| anyhow!("Dangling modifier in {name} return type"))?,
                _ => break,
            };
        }

        Ok(match ret {
            // Can fail (NULL), no sign extension.
            Type::Ptr(_) => FuncFlags::RET_PTR,
            Type::Int(i) => {
                let type_name = btf.resolve_name(&i)?;
                if type_name == "bool" || type_name == "_Bool" {
                    FuncFlags::CANT_FAIL | FuncFlags::RET_BOOL
                } else if !i.is_signed() {
                    // Unsigned is treated as non-failing.
                    FuncFlags::CANT_FAIL
                } else if i.size() < 4 {
                    // Byte and word are treated as non-failing.
                    FuncFlags::CANT_FAIL
                } else if i.size() == 4 {
                    FuncFlags::NEEDS_SIGN_EXT
                } else {
                    FuncFlags::empty()
                }
            }
            // Enums are 4 bytes wide, wider ones have their own kind.
            Type::Enum(_) => FuncFlags::NEEDS_SIGN_EXT,
            Type::Enum64(_) => FuncFlags::empty(),
            _ => FuncFlags::empty(),
        })
    }
}
