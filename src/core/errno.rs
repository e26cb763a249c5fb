//! # Errno
//!
//! Kernel error numbers: name lookups in both directions and the allow/deny
//! bitsets used to filter reported stacks.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use once_cell::sync::OnceCell;

/// Highest error value (exclusive) the masks can represent. Covers both the
/// userspace errno range and the kernel-internal 512+ codes.
pub(crate) const MAX_ERR_CNT: usize = 4096;

/// Kernel error numbers and their names, including the kernel-internal ones
/// (512 and up) which never reach userspace but do show up in traces. Value 0
/// maps to "NULL" so failing pointer returns render nicely.
static ERR_NAMES: &[(i32, &str)] = &[
    (0, "NULL"),
    (1, "EPERM"), (2, "ENOENT"), (3, "ESRCH"), (4, "EINTR"), (5, "EIO"),
    (6, "ENXIO"), (7, "E2BIG"), (8, "ENOEXEC"), (9, "EBADF"), (10, "ECHILD"),
    (11, "EAGAIN"), (12, "ENOMEM"), (13, "EACCES"), (14, "EFAULT"),
    (15, "ENOTBLK"), (16, "EBUSY"), (17, "EEXIST"), (18, "EXDEV"),
    (19, "ENODEV"), (20, "ENOTDIR"), (21, "EISDIR"), (22, "EINVAL"),
    (23, "ENFILE"), (24, "EMFILE"), (25, "ENOTTY"), (26, "ETXTBSY"),
    (27, "EFBIG"), (28, "ENOSPC"), (29, "ESPIPE"), (30, "EROFS"),
    (31, "EMLINK"), (32, "EPIPE"), (33, "EDOM"), (34, "ERANGE"),
    (35, "EDEADLK"), (36, "ENAMETOOLONG"), (37, "ENOLCK"), (38, "ENOSYS"),
    (39, "ENOTEMPTY"), (40, "ELOOP"), (42, "ENOMSG"), (43, "EIDRM"),
    (44, "ECHRNG"), (45, "EL2NSYNC"), (46, "EL3HLT"), (47, "EL3RST"),
    (48, "ELNRNG"), (49, "EUNATCH"), (50, "ENOCSI"), (51, "EL2HLT"),
    (52, "EBADE"), (53, "EBADR"), (54, "EXFULL"), (55, "ENOANO"),
    (56, "EBADRQC"), (57, "EBADSLT"), (59, "EBFONT"), (60, "ENOSTR"),
    (61, "ENODATA"), (62, "ETIME"), (63, "ENOSR"), (64, "ENONET"),
    (65, "ENOPKG"), (66, "EREMOTE"), (67, "ENOLINK"), (68, "EADV"),
    (69, "ESRMNT"), (70, "ECOMM"), (71, "EPROTO"), (72, "EMULTIHOP"),
    (73, "EDOTDOT"), (74, "EBADMSG"), (75, "EOVERFLOW"), (76, "ENOTUNIQ"),
    (77, "EBADFD"), (78, "EREMCHG"), (79, "ELIBACC"), (80, "ELIBBAD"),
    (81, "ELIBSCN"), (82, "ELIBMAX"), (83, "ELIBEXEC"), (84, "EILSEQ"),
    (85, "ERESTART"), (86, "ESTRPIPE"), (87, "EUSERS"), (88, "ENOTSOCK"),
    (89, "EDESTADDRREQ"), (90, "EMSGSIZE"), (91, "EPROTOTYPE"),
    (92, "ENOPROTOOPT"), (93, "EPROTONOSUPPORT"), (94, "ESOCKTNOSUPPORT"),
    (95, "EOPNOTSUPP"), (96, "EPFNOSUPPORT"), (97, "EAFNOSUPPORT"),
    (98, "EADDRINUSE"), (99, "EADDRNOTAVAIL"), (100, "ENETDOWN"),
    (101, "ENETUNREACH"), (102, "ENETRESET"), (103, "ECONNABORTED"),
    (104, "ECONNRESET"), (105, "ENOBUFS"), (106, "EISCONN"),
    (107, "ENOTCONN"), (108, "ESHUTDOWN"), (109, "ETOOMANYREFS"),
    (110, "ETIMEDOUT"), (111, "ECONNREFUSED"), (112, "EHOSTDOWN"),
    (113, "EHOSTUNREACH"), (114, "EALREADY"), (115, "EINPROGRESS"),
    (116, "ESTALE"), (117, "EUCLEAN"), (118, "ENOTNAM"), (119, "ENAVAIL"),
    (120, "EISNAM"), (121, "EREMOTEIO"), (122, "EDQUOT"), (123, "ENOMEDIUM"),
    (124, "EMEDIUMTYPE"), (125, "ECANCELED"), (126, "ENOKEY"),
    (127, "EKEYEXPIRED"), (128, "EKEYREVOKED"), (129, "EKEYREJECTED"),
    (130, "EOWNERDEAD"), (131, "ENOTRECOVERABLE"), (132, "ERFKILL"),
    (133, "EHWPOISON"),
    (512, "ERESTARTSYS"), (513, "ERESTARTNOINTR"), (514, "ERESTARTNOHAND"),
    (515, "ENOIOCTLCMD"), (516, "ERESTART_RESTARTBLOCK"),
    (517, "EPROBE_DEFER"), (518, "EOPENSTALE"), (519, "ENOPARAM"),
    (521, "EBADHANDLE"), (522, "ENOTSYNC"), (523, "EBADCOOKIE"),
    (524, "ENOTSUPP"), (525, "ETOOSMALL"), (526, "ESERVERFAULT"),
    (527, "EBADTYPE"), (528, "EJUKEBOX"), (529, "EIOCBQUEUED"),
    (530, "ERECALLCONFLICT"),
];

static BY_NAME: OnceCell<HashMap<&'static str, i32>> = OnceCell::new();
static BY_VALUE: OnceCell<HashMap<i32, &'static str>> = OnceCell::new();

/// Parse an error name ("ENOENT" or "-ENOENT") into its value.
pub(crate) fn str_to_err(name: &str) -> Result<i32> {
    let name = name.strip_prefix('-').unwrap_or(name);

    BY_NAME
        .get_or_init(|| ERR_NAMES.iter().map(|(v, n)| (*n, *v)).collect())
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("Unrecognized error '{name}'"))
}

/// Return the name of an error value, if known. Negative values are looked up
/// by their absolute value.
pub(crate) fn err_to_str(err: i64) -> Option<&'static str> {
    let err = err.unsigned_abs();
    if err > i32::MAX as u64 {
        return None;
    }

    BY_VALUE
        .get_or_init(|| ERR_NAMES.iter().map(|(v, n)| (*v, *n)).collect())
        .get(&(err as i32))
        .copied()
}

/// Bitset over the errno space, used for the allow and deny error filters.
#[derive(Clone)]
pub(crate) struct ErrnoMask([u64; MAX_ERR_CNT / 64]);

impl ErrnoMask {
    /// All bits cleared, the deny mask default.
    pub(crate) fn empty() -> ErrnoMask {
        ErrnoMask([0; MAX_ERR_CNT / 64])
    }

    /// All bits set, the allow mask default.
    pub(crate) fn full() -> ErrnoMask {
        ErrnoMask([u64::MAX; MAX_ERR_CNT / 64])
    }

    pub(crate) fn clear(&mut self) {
        self.0 = [0; MAX_ERR_CNT / 64];
    }

    pub(crate) fn set(&mut self, err: i32) {
        let err = err.unsigned_abs() as usize;
        if err < MAX_ERR_CNT {
            self.0[err / 64] |= 1 << (err % 64);
        }
    }

    /// Check if an error value is part of the mask. Values out of the errno
    /// space are never part of it.
    pub(crate) fn contains(&self, err: i64) -> bool {
        let err = err.unsigned_abs() as usize;
        if err >= MAX_ERR_CNT {
            return false;
        }
        self.0[err / 64] >> (err % 64) & 1 == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        // Every key must round-trip through its name.
        for (val, _) in ERR_NAMES.iter() {
            let name = err_to_str(*val as i64).unwrap();
            assert_eq!(str_to_err(name).unwrap(), *val);
        }
    }

    #[test]
    fn parse_err_names() {
        assert_eq!(str_to_err("ENOENT").unwrap(), 2);
        assert_eq!(str_to_err("-ENOENT").unwrap(), 2);
        assert_eq!(str_to_err("EIOCBQUEUED").unwrap(), 529);
        assert!(str_to_err("EWHATEVER").is_err());
    }

    #[test]
    fn err_names() {
        assert_eq!(err_to_str(-2), Some("ENOENT"));
        assert_eq!(err_to_str(2), Some("ENOENT"));
        assert_eq!(err_to_str(0), Some("NULL"));
        assert_eq!(err_to_str(-12345), None);
    }

    #[test]
    fn masks() {
        let mut allow = ErrnoMask::full();
        assert!(allow.contains(-2));
        assert!(allow.contains(-4095));
        assert!(!allow.contains(-4096));

        allow.clear();
        allow.set(str_to_err("ENOENT").unwrap());
        assert!(allow.contains(-2));
        assert!(allow.contains(2));
        assert!(!allow.contains(-12));

        let mut deny = ErrnoMask::empty();
        assert!(!deny.contains(-2));
        deny.set(str_to_err("ENOMEM").unwrap());
        assert!(deny.contains(-12));
    }
}
