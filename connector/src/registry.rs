//! DeviceRegistry — translates a VolumeIdentifier into a usable device,
//! classifies it, and answers questions about its WWN, size, and
//! physical membership.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::{is_partition_device, DeviceClass, ResolvedDevice};
use crate::sysfs::SysfsProbe;
use crate::vendor::VendorAdapter;

pub struct DeviceRegistry<E: Executor> {
    exec: Arc<E>,
    sysfs: Arc<SysfsProbe>,
    vendor: Arc<dyn VendorAdapter>,
    exec_timeout: Duration,
}

impl<E: Executor> DeviceRegistry<E> {
    pub fn new(
        exec: Arc<E>,
        sysfs: Arc<SysfsProbe>,
        vendor: Arc<dyn VendorAdapter>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            exec,
            sysfs,
            vendor,
            exec_timeout,
        }
    }

    /// Resolves a volume identifier to its device: enumerate by-id
    /// candidates, classify each as physical or virtual, then fold in
    /// anything only the vendor adapter can see.
    pub async fn resolve(&self, id: &str) -> Result<Option<ResolvedDevice>> {
        let candidates = self.sysfs.list_devices_by_identifier(id)?;

        let mut names: Vec<String> = candidates
            .into_iter()
            .filter_map(|basename| self.sysfs.resolve_by_id_target(&basename))
            .filter(|n| !is_partition_device(n))
            .collect();
        names.sort();
        names.dedup();

        let mut virtuals = Vec::new();
        let mut physicals = Vec::new();

        for name in names {
            if name.starts_with("dm-") {
                virtuals.push((name, DeviceClass::DmMultipath));
                continue;
            }
            if name.starts_with("ultrapath") {
                virtuals.push((name, DeviceClass::VendorUltraPath));
                continue;
            }
            if name.starts_with("sd") {
                if self.vendor.is_vendor_scsi_device(&name).await.unwrap_or(false) {
                    virtuals.push((name, DeviceClass::VendorUltraPath));
                } else {
                    physicals.push(name);
                }
                continue;
            }
            if name.starts_with("nvme") {
                physicals.push(name);
                continue;
            }
            warn!(device = %name, "could not classify device, skipping");
        }

        // NVMe vendor virtuals are discovered purely through the vendor
        // adapter, not by sysfs name, so fold in whatever it reports.
        if let Some(vendor_virtual) = self
            .vendor
            .find_virtual_by_identifier(id, DeviceClass::VendorUltraPathNvme)
            .await?
        {
            if !virtuals.iter().any(|(n, _)| *n == vendor_virtual.name) {
                virtuals.push((vendor_virtual.name.clone(), DeviceClass::VendorUltraPathNvme));
            }
        }

        if virtuals.len() > 1 {
            return Err(ConnectorError::DeviceNotUnique(id.to_string()));
        }

        if let Some((name, class)) = virtuals.into_iter().next() {
            let physical_members = self.get_physical_devices_of(&name, class).await?;
            return Ok(Some(ResolvedDevice {
                name,
                class,
                physical_members,
            }));
        }

        match physicals.len() {
            0 => Ok(None),
            1 => Ok(Some(ResolvedDevice {
                name: physicals.remove(0),
                class: DeviceClass::NotMultipath,
                physical_members: Vec::new(),
            })),
            _ => Err(ConnectorError::DeviceNotUnique(id.to_string())),
        }
    }

    /// `getWWN(device)` — dispatches by name prefix.
    pub async fn get_wwn(&self, device: &str) -> Result<String> {
        if device.starts_with("nvme") {
            let out = self
                .exec
                .run_unmasked("nvme", &["id-ns", &format!("/dev/{}", device), "-o", "json"], self.exec_timeout)
                .await?;
            let json: serde_json::Value = serde_json::from_str(&out.output).map_err(|e| {
                ConnectorError::Parse {
                    what: "nvme id-ns output".into(),
                    detail: e.to_string(),
                }
            })?;
            return json
                .get("nguid")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| ConnectorError::Parse {
                    what: "nvme id-ns output".into(),
                    detail: "missing nguid field".into(),
                });
        }

        let out = self
            .exec
            .run_unmasked(
                "scsi_id",
                &["--page", "0x83", "--whitelisted", &format!("/dev/{}", device)],
                self.exec_timeout,
            )
            .await;

        match out {
            Ok(out) if out.success && !out.output.trim().is_empty() => Ok(out.output.trim().to_string()),
            _ => self.get_wwn_from_sysfs_fallback(device).await,
        }
    }

    async fn get_wwn_from_sysfs_fallback(&self, device: &str) -> Result<String> {
        // Fallback: sysfs `wwid` attribute exposed by the SCSI/FC host
        // layer when the device itself can't be opened for a page-0x83
        // inquiry (e.g. a stale path mid-teardown).
        let out = self
            .exec
            .run_unmasked("cat", &[&format!("/sys/block/{}/device/wwid", device)], self.exec_timeout)
            .await?;
        if out.success && !out.output.trim().is_empty() {
            Ok(out.output.trim().to_string())
        } else {
            Err(ConnectorError::Parse {
                what: format!("WWN for device '{}'", device),
                detail: "scsi_id and sysfs wwid fallback both failed".into(),
            })
        }
    }

    /// `getSize(device)` — integer bytes via `blockdev --getsize64`.
    pub async fn get_size(&self, device: &str) -> Result<u64> {
        let out = self
            .exec
            .run_unmasked("blockdev", &["--getsize64", &format!("/dev/{}", device)], self.exec_timeout)
            .await?;
        out.output
            .trim()
            .parse::<u64>()
            .map_err(|e| ConnectorError::Parse {
                what: format!("blockdev size for '{}'", device),
                detail: e.to_string(),
            })
    }

    /// `getPhysicalDevicesOf(virtual, class)`.
    pub async fn get_physical_devices_of(&self, name: &str, class: DeviceClass) -> Result<Vec<String>> {
        match class {
            DeviceClass::DmMultipath => {
                let out = self
                    .exec
                    .run_unmasked("ls", &[&format!("/sys/block/{}/slaves", name)], self.exec_timeout)
                    .await?;
                Ok(out
                    .output
                    .split_whitespace()
                    .map(|s| s.to_string())
                    .collect())
            }
            DeviceClass::VendorUltraPath | DeviceClass::VendorUltraPathNvme => {
                let id_guess = name.to_string();
                let vendor_device = self
                    .vendor
                    .find_virtual_by_identifier(&id_guess, class)
                    .await?;
                Ok(vendor_device.map(|d| d.members).unwrap_or_default())
            }
            DeviceClass::NotMultipath => Ok(Vec::new()),
        }
    }
}
