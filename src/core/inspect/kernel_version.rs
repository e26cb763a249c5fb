use anyhow::{anyhow, Result};
#[cfg(not(test))]
use nix::sys::utsname::uname;

/// Represents a kernel version, eg. 6.2.14-300.fc38.x86_64
pub(crate) struct KernelVersion {
    /// Major number, eg. 6.
    major: u32,
    /// Minor number, eg. 2.
    minor: u32,
    /// Full kernel release version, same as `$(uname -r)`, eg.
    /// 6.2.14-300.fc38.x86_64.
    pub(crate) full: String,
}

impl KernelVersion {
    pub(super) fn new() -> Result<Self> {
        Self::parse(
            #[cfg(not(test))]
            uname()
                .map_err(|e| anyhow!("Failed to get kernel version information: {e}"))?
                .release()
                .to_str()
                .ok_or_else(|| anyhow!("Could not convert kernel version to str"))?,
            #[cfg(test)]
            "6.2.14-300.fc38.x86_64",
        )
    }

    /// Parse a version string of the `$(uname -r)` form into a KernelVersion.
    pub(crate) fn parse(version: &str) -> Result<Self> {
        let mut parts = version.split('.');

        let major: u32 = parts
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel major version from {version}"))?
            .parse()?;
        let minor: u32 = parts
            .next()
            .ok_or_else(|| anyhow!("Could not get kernel minor version from {version}"))?
            // Some distributions use a single x.y scheme ("6.2-generic").
            .split('-')
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .parse()?;

        Ok(KernelVersion {
            major,
            minor,
            full: version.to_string(),
        })
    }

    /// Is the kernel at least as recent as major.minor? Used for gating
    /// features on the kernel release they appeared in.
    pub(crate) fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version() {
        let version = KernelVersion::new().unwrap();
        assert_eq!(version.major, 6);
        assert_eq!(version.minor, 2);
        assert_eq!(version.full, "6.2.14-300.fc38.x86_64");

        let version = KernelVersion::parse("6.2.0-20-generic").unwrap();
        assert_eq!((version.major, version.minor), (6, 2));

        let version = KernelVersion::parse("6.4.12-arch1-1").unwrap();
        assert_eq!((version.major, version.minor), (6, 4));

        let version = KernelVersion::parse("5.15-generic").unwrap();
        assert_eq!((version.major, version.minor), (5, 15));

        assert!(KernelVersion::parse("6").is_err());
        assert!(KernelVersion::parse("banana").is_err());
    }

    #[test]
    fn version_gates() {
        let version = KernelVersion::parse("6.2.14-300.fc38.x86_64").unwrap();

        assert!(version.at_least(6, 2));
        assert!(version.at_least(6, 1));
        assert!(version.at_least(5, 19));
        assert!(!version.at_least(6, 3));
        assert!(!version.at_least(7, 0));
    }
}
