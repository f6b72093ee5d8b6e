//! Filesystem root indirection.
//!
//! `SysfsProbe` reads from fixed, well-known paths (`/sys/class/fc_host`,
//! `/proc/mounts`, `/dev/disk/by-id`, …). Hard-coding those paths would
//! make the discovery logic untestable without root and a real SAN, so
//! every read goes through a `RootFs` that prefixes a configurable root —
//! `/` in production, a `tempfile::TempDir` in tests.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RootFs {
    root: PathBuf,
}

impl Default for RootFs {
    fn default() -> Self {
        Self::real()
    }
}

impl RootFs {
    pub fn real() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join an absolute path (e.g. `/sys/class/fc_host`) against this
    /// root.
    pub fn path(&self, absolute: &str) -> PathBuf {
        let trimmed = absolute.trim_start_matches('/');
        self.root.join(trimmed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
