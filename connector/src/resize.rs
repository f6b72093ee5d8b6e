//! ResizeEngine — rescans physical paths, resizes the multipath map, and
//! grows a filesystem in place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::{DeviceClass, ResolvedDevice};
use crate::registry::DeviceRegistry;
use crate::vendor::VendorAdapter;

const RECONFIGURE_SETTLE: Duration = Duration::from_secs(2);
const RESCAN_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ResizeEngine<E: Executor> {
    exec: Arc<E>,
    registry: Arc<DeviceRegistry<E>>,
    vendor: Arc<dyn VendorAdapter>,
    exec_timeout: Duration,
}

impl<E: Executor> ResizeEngine<E> {
    pub fn new(
        exec: Arc<E>,
        registry: Arc<DeviceRegistry<E>>,
        vendor: Arc<dyn VendorAdapter>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            exec,
            registry,
            vendor,
            exec_timeout,
        }
    }

    /// Rescans physical paths, resizes the multipath map if present, and
    /// polls `getsize64` until the requested byte count is observed.
    pub async fn resize_device(
        &self,
        device: &ResolvedDevice,
        requested_bytes: u64,
        expand_timeout: Duration,
    ) -> Result<()> {
        let before = self.registry.get_size(&device.name).await?;
        info!(device = %device.name, before, requested_bytes, "starting device resize");

        match device.class {
            DeviceClass::NotMultipath => self.rescan_single(&device.name).await?,
            DeviceClass::DmMultipath => self.rescan_dm(device).await?,
            DeviceClass::VendorUltraPath | DeviceClass::VendorUltraPathNvme => {
                self.rescan_vendor(device).await?
            }
        }

        let deadline = Instant::now() + expand_timeout;
        loop {
            let size = self.registry.get_size(&device.name).await?;
            if size == requested_bytes {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConnectorError::HostCommandFailed(format!(
                    "device {} did not reach requested size {} within timeout (last seen {})",
                    device.name, requested_bytes, size
                )));
            }
            tokio::time::sleep(RESCAN_POLL_INTERVAL).await;
        }
    }

    async fn rescan_single(&self, name: &str) -> Result<()> {
        if name.starts_with("nvme") {
            let out = self
                .exec
                .run_unmasked(
                    "sh",
                    &["-c", &format!("echo 1 > /sys/block/{name}/device/rescan_controller")],
                    self.exec_timeout,
                )
                .await?;
            if !out.success {
                let fallback = self
                    .exec
                    .run_unmasked("nvme", &["ns-rescan", &format!("/dev/{name}")], self.exec_timeout)
                    .await?;
                if !fallback.success {
                    return Err(ConnectorError::HostCommandFailed(format!(
                        "nvme rescan of {name} failed: {}",
                        fallback.output
                    )));
                }
            }
            return Ok(());
        }

        let hctl = self.scsi_hctl(name).await?;
        let out = self
            .exec
            .run_unmasked(
                "sh",
                &["-c", &format!("echo 1 > /sys/bus/scsi/drivers/sd/{hctl}/rescan")],
                self.exec_timeout,
            )
            .await?;
        if !out.success {
            return Err(ConnectorError::HostCommandFailed(format!(
                "scsi rescan of {name} ({hctl}) failed: {}",
                out.output
            )));
        }
        Ok(())
    }

    async fn rescan_dm(&self, device: &ResolvedDevice) -> Result<()> {
        for member in &device.physical_members {
            self.rescan_single(member).await?;
        }

        let out = self
            .exec
            .run_unmasked("multipathd", &["reconfigure"], self.exec_timeout)
            .await?;
        if !out.success {
            return Err(ConnectorError::HostCommandFailed(format!(
                "multipathd reconfigure failed: {}",
                out.output
            )));
        }
        tokio::time::sleep(RECONFIGURE_SETTLE).await;

        let resize_out = self
            .exec
            .run_unmasked(
                "multipathd",
                &["resize", "map", &device.name],
                self.exec_timeout,
            )
            .await?;
        if resize_out.output.to_lowercase().contains("fail") {
            return Err(ConnectorError::HostCommandFailed(format!(
                "multipathd resize map {} failed: {}",
                device.name, resize_out.output
            )));
        }
        Ok(())
    }

    async fn rescan_vendor(&self, device: &ResolvedDevice) -> Result<()> {
        self.vendor.rescan(&device.name).await?;
        for member in &device.physical_members {
            self.vendor.rescan(member).await?;
        }
        Ok(())
    }

    /// A crude sysfs lookup for the `h:c:t:l` of a plain SCSI device,
    /// needed to target `/sys/bus/scsi/drivers/sd/<hctl>/rescan`.
    async fn scsi_hctl(&self, name: &str) -> Result<String> {
        let out = self
            .exec
            .run_unmasked(
                "sh",
                &["-c", &format!("ls /sys/block/{name}/device/scsi_device/")],
                self.exec_timeout,
            )
            .await?;
        let hctl = out.output.lines().next().unwrap_or_default().trim().to_string();
        if hctl.is_empty() {
            return Err(ConnectorError::Parse {
                what: format!("HCTL for device '{name}'"),
                detail: "no scsi_device entry found".into(),
            });
        }
        Ok(hctl)
    }

    /// Filesystem resize: `findmnt` the source device, `blkid` its fstype,
    /// then `resize2fs`/`xfs_growfs` as appropriate.
    pub async fn grow_filesystem(&self, mount_path: &str) -> Result<()> {
        let source_out = self
            .exec
            .run_unmasked(
                "findmnt",
                &["-o", "source", "--noheadings", "--target", mount_path],
                self.exec_timeout,
            )
            .await?;
        let source = source_out.output.trim().to_string();
        if source.is_empty() {
            return Err(ConnectorError::HostCommandFailed(format!(
                "findmnt found no source device for {mount_path}"
            )));
        }

        let blkid_out = self
            .exec
            .run_unmasked("blkid", &["-p", "-s", "TYPE", &source], self.exec_timeout)
            .await?;
        let fstype = parse_blkid_type(&blkid_out.output).ok_or_else(|| ConnectorError::Parse {
            what: format!("blkid TYPE for '{source}'"),
            detail: blkid_out.output.clone(),
        })?;

        match fstype.as_str() {
            "ext2" | "ext3" | "ext4" => {
                let out = self
                    .exec
                    .run_unmasked("resize2fs", &["-p", &source], self.exec_timeout)
                    .await?;
                if !out.success {
                    return Err(ConnectorError::HostCommandFailed(format!(
                        "resize2fs -p {source} failed: {}",
                        out.output
                    )));
                }
                Ok(())
            }
            "xfs" => {
                let out = self
                    .exec
                    .run_unmasked("xfs_growfs", &[mount_path], self.exec_timeout)
                    .await?;
                if !out.success {
                    return Err(ConnectorError::HostCommandFailed(format!(
                        "xfs_growfs {mount_path} failed: {}",
                        out.output
                    )));
                }
                Ok(())
            }
            other => {
                warn!(fstype = other, "unsupported filesystem for online grow");
                Err(ConnectorError::UnsupportedFsType(other.to_string()))
            }
        }
    }
}

fn parse_blkid_type(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|l| l.strip_prefix("TYPE=").map(|v| v.trim_matches('"').to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockExecutor, MockResponse};
    use crate::sysfs::SysfsProbe;

    struct NoVendor;
    #[async_trait::async_trait]
    impl VendorAdapter for NoVendor {
        async fn is_vendor_scsi_device(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn find_virtual_by_identifier(
            &self,
            _id: &str,
            _class_hint: DeviceClass,
        ) -> Result<Option<crate::vendor::VendorVirtualDevice>> {
            Ok(None)
        }
        async fn remove_virtual(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn rescan(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn engine(exec: Arc<MockExecutor>) -> ResizeEngine<MockExecutor> {
        let sysfs = Arc::new(SysfsProbe::default());
        let registry = Arc::new(DeviceRegistry::new(
            exec.clone(),
            sysfs,
            Arc::new(NoVendor),
            Duration::from_secs(5),
        ));
        ResizeEngine::new(exec, registry, Arc::new(NoVendor), Duration::from_secs(5))
    }

    #[test]
    fn parses_blkid_type_line() {
        assert_eq!(parse_blkid_type("TYPE=\"xfs\"\n"), Some("xfs".to_string()));
        assert_eq!(parse_blkid_type("TYPE=\"ext4\"\n"), Some("ext4".to_string()));
        assert_eq!(parse_blkid_type("garbage\n"), None);
    }

    #[tokio::test]
    async fn grow_filesystem_dispatches_xfs_growfs() {
        let exec = Arc::new(MockExecutor::new());
        exec.register(
            "findmnt",
            &["-o", "source", "--noheadings", "--target", "/data"],
            MockResponse::ok("/dev/mapper/mpatha\n"),
        );
        exec.register(
            "blkid",
            &["-p", "-s", "TYPE", "/dev/mapper/mpatha"],
            MockResponse::ok("TYPE=\"xfs\"\n"),
        );
        exec.register("xfs_growfs", &["/data"], MockResponse::ok("ok"));

        let eng = engine(exec);
        eng.grow_filesystem("/data").await.unwrap();
    }

    #[tokio::test]
    async fn grow_filesystem_rejects_unknown_fstype() {
        let exec = Arc::new(MockExecutor::new());
        exec.register(
            "findmnt",
            &["-o", "source", "--noheadings", "--target", "/data"],
            MockResponse::ok("/dev/sdb\n"),
        );
        exec.register(
            "blkid",
            &["-p", "-s", "TYPE", "/dev/sdb"],
            MockResponse::ok("TYPE=\"zfs_member\"\n"),
        );
        let eng = engine(exec);
        let result = eng.grow_filesystem("/data").await;
        assert!(matches!(result, Err(ConnectorError::UnsupportedFsType(_))));
    }

    #[tokio::test]
    async fn resize_device_polls_until_requested_size_observed() {
        let exec = Arc::new(MockExecutor::new());
        exec.register(
            "sh",
            &["-c", "ls /sys/block/sda/device/scsi_device/"],
            MockResponse::ok("3:0:0:0\n"),
        );
        exec.register(
            "sh",
            &["-c", "echo 1 > /sys/bus/scsi/drivers/sd/3:0:0:0/rescan"],
            MockResponse::ok(""),
        );
        exec.register("blockdev", &["--getsize64", "/dev/sda"], MockResponse::ok("2147483648\n"));

        let eng = engine(exec);
        let device = ResolvedDevice {
            name: "sda".to_string(),
            class: DeviceClass::NotMultipath,
            physical_members: Vec::new(),
        };
        eng.resize_device(&device, 2147483648, Duration::from_secs(2))
            .await
            .unwrap();
    }
}
