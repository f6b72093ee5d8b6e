//! NFS / raw-block bind mount attacher.
//!
//! Stateless compared to the other attachers: there is no login, discovery,
//! or verification step, just composing a `mount` invocation and making it
//! idempotent against whatever `/proc/mounts` already says. Target-state
//! machine: `Absent -> Created -> Mounted -> Unmounted/Absent`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::rootfs::RootFs;
use crate::sysfs::SysfsProbe;

pub struct NfsAttacher<E: Executor> {
    exec: Arc<E>,
    sysfs: Arc<SysfsProbe>,
    fs: RootFs,
    exec_timeout: Duration,
}

impl<E: Executor> NfsAttacher<E> {
    pub fn new(exec: Arc<E>, sysfs: Arc<SysfsProbe>, fs: RootFs, exec_timeout: Duration) -> Self {
        Self {
            exec,
            sysfs,
            fs,
            exec_timeout,
        }
    }

    /// `mount(src, dst, fsType, flags)` — creates `dst` if absent (a
    /// directory for filesystem mounts, an empty regular file for raw-block
    /// bind mounts, i.e. `fs_type.is_none()`), replaces a legacy symlink
    /// target with a fresh regular file, adds `nouuid` automatically for
    /// `xfs` sources, and is a no-op if `readMounts()` already shows `dst`
    /// bound to `src`.
    pub async fn mount(
        &self,
        src: &str,
        dst: &str,
        fs_type: Option<&str>,
        flags: &[String],
    ) -> Result<()> {
        let mounts = self.sysfs.read_mounts()?;
        if mounts.get(dst).map(String::as_str) == Some(src) {
            info!(src, dst, "mount already established, skipping");
            return Ok(());
        }

        self.prepare_target(dst, fs_type.is_some())?;

        let mut full_flags = flags.to_vec();
        if fs_type == Some("xfs") && !full_flags.iter().any(|f| f == "nouuid") {
            full_flags.push("nouuid".to_string());
        }

        let mut args: Vec<String> = Vec::new();
        if let Some(t) = fs_type {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        if !full_flags.is_empty() {
            args.push("-o".to_string());
            args.push(full_flags.join(","));
        }
        args.push(src.to_string());
        args.push(dst.to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.exec.run_unmasked("mount", &arg_refs, self.exec_timeout).await?;
        if !out.success {
            return Err(ConnectorError::HostCommandFailed(format!(
                "mount {} {} failed: {}",
                src, dst, out.output
            )));
        }
        Ok(())
    }

    /// `unmount(dst)` — tolerates `not mounted`/`not found` in the tool's
    /// output, since an already-gone mount is the caller's desired end
    /// state, not an error.
    pub async fn unmount(&self, dst: &str) -> Result<()> {
        let out = self.exec.run_unmasked("umount", &[dst], self.exec_timeout).await?;
        if out.success {
            return Ok(());
        }
        let lower = out.output.to_lowercase();
        if lower.contains("not mounted") || lower.contains("not found") {
            info!(dst, "target already unmounted");
            return Ok(());
        }
        Err(ConnectorError::HostCommandFailed(format!(
            "umount {} failed: {}",
            dst, out.output
        )))
    }

    fn prepare_target(&self, dst: &str, is_filesystem: bool) -> Result<()> {
        let path = self.fs.path(dst);
        if path.is_symlink() {
            warn!(dst, "legacy symlink at mount target, replacing with a regular file/dir");
            std::fs::remove_file(&path).map_err(ConnectorError::Io)?;
        }

        if path.exists() {
            return Ok(());
        }

        if is_filesystem {
            std::fs::create_dir_all(&path).map_err(ConnectorError::Io)?;
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(ConnectorError::Io)?;
            }
            std::fs::File::create(&path).map_err(ConnectorError::Io)?;
        }
        Ok(())
    }
}
