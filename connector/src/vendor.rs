//! VendorAdapter — isolates vendor-multipath (`upadmin`/`upadmin_plus`)
//! CLI output parsing behind a capability trait, so DeviceRegistry/
//! Verifier/Cleanup never shell out to the vendor tool directly and a
//! mock implementation can stand in for tests.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::DeviceClass;
use crate::sysfs::SysfsProbe;

/// A vendor virtual device and the physical paths backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorVirtualDevice {
    pub name: String,
    pub wwn: String,
    pub members: Vec<String>,
}

#[async_trait::async_trait]
pub trait VendorAdapter: Send + Sync {
    /// Is `name` (e.g. `sda`) claimed by the vendor SCSI multipath stack?
    async fn is_vendor_scsi_device(&self, name: &str) -> Result<bool>;

    /// Resolve a volume identifier to its vendor virtual device, if any.
    async fn find_virtual_by_identifier(
        &self,
        id: &str,
        class_hint: DeviceClass,
    ) -> Result<Option<VendorVirtualDevice>>;

    /// Remove a vendor virtual device (part of Cleanup's remove sequence).
    async fn remove_virtual(&self, name: &str) -> Result<()>;

    /// Rescan a vendor virtual device and its physical members (ResizeEngine).
    async fn rescan(&self, name: &str) -> Result<()>;
}

/// Real implementation driving `upadmin`/`upadmin_plus` via HostExec, with
/// a `/proc/nxup_lun_map_{a,b}` fast path ahead of the CLI.
pub struct UpadminAdapter<E: Executor> {
    exec: std::sync::Arc<E>,
    sysfs: Arc<SysfsProbe>,
    binary: &'static str,
    timeout: Duration,
}

impl<E: Executor> UpadminAdapter<E> {
    pub fn new(exec: std::sync::Arc<E>, nvme: bool, timeout: Duration) -> Self {
        Self::with_sysfs(exec, Arc::new(SysfsProbe::default()), nvme, timeout)
    }

    pub fn with_sysfs(
        exec: std::sync::Arc<E>,
        sysfs: Arc<SysfsProbe>,
        nvme: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            exec,
            sysfs,
            binary: if nvme { "upadmin_plus" } else { "upadmin" },
            timeout,
        }
    }

    /// Look up `id` in the vendor driver's own `/proc/nxup_lun_map_{a,b}`
    /// tables before shelling out to the CLI. Each matching row names one
    /// physical member (`device_name`) of the virtual device addressed by
    /// `up_hctl`; the virtual device's own node name isn't in this table,
    /// so a hit here only short-circuits membership discovery, not the
    /// initial `show vlun` scan.
    fn members_from_nxup_lun_map(&self, id: &str) -> Vec<String> {
        let mut members = Vec::new();
        for side in ['a', 'b'] {
            let Ok(rows) = self.sysfs.read_nxup_lun_map(side) else {
                continue;
            };
            for row in rows {
                if row.device_id.eq_ignore_ascii_case(id) && !members.contains(&row.device_name) {
                    members.push(row.device_name);
                }
            }
        }
        members
    }
}

#[async_trait::async_trait]
impl<E: Executor> VendorAdapter for UpadminAdapter<E> {
    async fn is_vendor_scsi_device(&self, name: &str) -> Result<bool> {
        let out = self
            .exec
            .run_unmasked(self.binary, &["show", "vlun"], self.timeout)
            .await?;
        Ok(out.lines().any(|l| l.contains(name)))
    }

    async fn find_virtual_by_identifier(
        &self,
        id: &str,
        _class_hint: DeviceClass,
    ) -> Result<Option<VendorVirtualDevice>> {
        let out = self
            .exec
            .run_unmasked(self.binary, &["show", "vlun"], self.timeout)
            .await?;

        for line in out.lines() {
            if !line.to_lowercase().contains(&id.to_lowercase()) {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(name) = fields.first() {
                debug!(device = %name, id, "vendor CLI reported virtual device for identifier");
                let mut members = self.members_from_nxup_lun_map(id);
                if members.is_empty() {
                    let detail = self
                        .exec
                        .run_unmasked(self.binary, &["show", "path", "-vlun", name], self.timeout)
                        .await?;
                    members = detail
                        .lines()
                        .filter_map(|l| l.split_whitespace().last())
                        .filter(|s| s.starts_with("sd") || s.starts_with("nvme"))
                        .map(|s| s.to_string())
                        .collect();
                }
                return Ok(Some(VendorVirtualDevice {
                    name: name.to_string(),
                    wwn: id.to_string(),
                    members,
                }));
            }
        }
        Ok(None)
    }

    async fn remove_virtual(&self, name: &str) -> Result<()> {
        let out = self
            .exec
            .run_unmasked(self.binary, &["remove", "-vlun", name], self.timeout)
            .await?;
        if !out.success {
            return Err(ConnectorError::HostCommandFailed(format!(
                "{} remove -vlun {} failed: {}",
                self.binary, name, out.output
            )));
        }
        Ok(())
    }

    async fn rescan(&self, name: &str) -> Result<()> {
        let out = self
            .exec
            .run_unmasked(self.binary, &["rescan", "-vlun", name], self.timeout)
            .await?;
        if !out.success {
            return Err(ConnectorError::HostCommandFailed(format!(
                "{} rescan -vlun {} failed: {}",
                self.binary, name, out.output
            )));
        }
        Ok(())
    }
}
