//! FC attacher.
//!
//! Discovers online FC HBAs, derives each one's PCI address from its
//! sysfs `device_path`, rescans the HBA×target-WWN pairing the kernel's
//! `fc_transport` class already knows about, and polls the rendered
//! `/dev/disk/by-path/...` candidates until one resolves.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::{Hba, MultiPathType, RawDevicePath, ResolvedDevice, VolumeIdentifier};
use crate::registry::DeviceRegistry;
use crate::sysfs::SysfsProbe;
use crate::verify::{Rollback, Verifier};

use super::AttachOutcome;

const MAX_RESCANS: u32 = 3;
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);
const OVERALL_BUDGET: Duration = Duration::from_secs(60);

pub struct FcAttacher<E: Executor> {
    exec: Arc<E>,
    sysfs: Arc<SysfsProbe>,
    registry: Arc<DeviceRegistry<E>>,
    verifier: Arc<Verifier<E>>,
    exec_timeout: Duration,
}

pub struct FcTarget<'a> {
    pub wwn: &'a str,
    pub host_lun: u64,
}

impl<E: Executor> FcAttacher<E> {
    pub fn new(
        exec: Arc<E>,
        sysfs: Arc<SysfsProbe>,
        registry: Arc<DeviceRegistry<E>>,
        verifier: Arc<Verifier<E>>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            exec,
            sysfs,
            registry,
            verifier,
            exec_timeout,
        }
    }

    pub async fn attach(
        &self,
        id: &VolumeIdentifier,
        tgt_wwns: &[String],
        tgt_host_luns: &[String],
        multipath: bool,
        mp_type: MultiPathType,
        scan_volume_timeout: Duration,
        all_path_online: bool,
        rollback: &dyn Rollback,
    ) -> Result<AttachOutcome> {
        let targets: Vec<FcTarget> = tgt_wwns
            .iter()
            .zip(tgt_host_luns.iter())
            .map(|(wwn, lun)| FcTarget {
                wwn,
                host_lun: lun.parse().unwrap_or(0),
            })
            .collect();

        let hbas = self.discover_online_hbas()?;
        if hbas.is_empty() {
            return Err(ConnectorError::VolumeNotFound(id.to_string()));
        }

        let deadline = Instant::now() + OVERALL_BUDGET;
        let mut found: Option<String> = None;
        for attempt in 1..=MAX_RESCANS {
            debug!(attempt, "rescanning FC host/target pairings");
            self.rescan_pairings(&hbas, &targets).await;
            if let Some(device) = self.probe_candidates(&hbas, &targets) {
                found = Some(device);
                break;
            }
            if attempt == MAX_RESCANS || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(RESCAN_INTERVAL).await;
        }

        let device_name = found.ok_or_else(|| ConnectorError::VolumeNotFound(id.to_string()))?;

        if multipath {
            match mp_type {
                MultiPathType::Dm => {
                    let row = self
                        .verifier
                        .verify_dm(
                            id,
                            targets.len(),
                            scan_volume_timeout,
                            all_path_online,
                            rollback,
                        )
                        .await?;
                    return Ok(AttachOutcome {
                        device: ResolvedDevice {
                            name: row.sysfs,
                            class: crate::model::DeviceClass::DmMultipath,
                            physical_members: row.devices,
                        },
                    });
                }
                MultiPathType::VendorScsi => {
                    let resolved = self
                        .registry
                        .resolve(id.as_str())
                        .await?
                        .ok_or_else(|| ConnectorError::VolumeNotFound(id.to_string()))?;
                    self.verifier.verify_single(&resolved.name, id, rollback).await?;
                    return Ok(AttachOutcome { device: resolved });
                }
                MultiPathType::VendorNvme => {
                    return Err(ConnectorError::UnsupportedMultiPathType(
                        "vendor-NVMe multipath is not applicable to FC-SCSI".into(),
                    ));
                }
            }
        }

        self.verifier.verify_single(&device_name, id, rollback).await?;
        Ok(AttachOutcome {
            device: ResolvedDevice {
                name: device_name,
                class: crate::model::DeviceClass::NotMultipath,
                physical_members: Vec::new(),
            },
        })
    }

    fn discover_online_hbas(&self) -> Result<Vec<Hba>> {
        if !self.sysfs.fc_supported() {
            return Ok(Vec::new());
        }
        let hosts = self.sysfs.list_fc_hosts()?;
        Ok(hosts
            .into_iter()
            .filter_map(|h| self.sysfs.fc_hba_info(&h))
            .collect())
    }

    async fn rescan_pairings(&self, hbas: &[Hba], targets: &[FcTarget<'_>]) {
        for hba in hbas {
            let host_num = hba.host_device.trim_start_matches("host");
            let transport_targets = self
                .sysfs
                .list_fc_transport_targets(host_num)
                .unwrap_or_default();

            for target in targets {
                let normalized_wwn = target.wwn.trim_start_matches("0x").to_lowercase();
                for (channel_target, port_name) in &transport_targets {
                    if port_name.trim_start_matches("0x").to_lowercase() != normalized_wwn {
                        continue;
                    }
                    let Some((channel, scsi_target)) = channel_target.split_once(':') else {
                        continue;
                    };
                    let scan_line = format!("{} {} {}", channel, scsi_target, target.host_lun);
                    let out = self
                        .exec
                        .run_unmasked(
                            "sh",
                            &[
                                "-c",
                                &format!(
                                    "echo \"{scan_line}\" > /sys/class/scsi_host/{}/scan",
                                    hba.host_device
                                ),
                            ],
                            self.exec_timeout,
                        )
                        .await;
                    if let Ok(out) = out {
                        if !out.success {
                            warn!(host = %hba.host_device, scan_line, "scsi_host scan write failed");
                        }
                    }
                }
            }
        }
    }

    fn probe_candidates(&self, hbas: &[Hba], targets: &[FcTarget<'_>]) -> Option<String> {
        let mut seen = HashSet::new();
        for hba in hbas {
            let (platform, pci) = derive_pci(&hba.device_path);
            for target in targets {
                let raw = RawDevicePath {
                    platform: platform.clone(),
                    pci: pci.clone(),
                    target_wwn: target.wwn.trim_start_matches("0x").to_lowercase(),
                    lun_id: target.host_lun,
                };
                let rendered = raw.render();
                if !seen.insert(rendered.clone()) {
                    continue;
                }
                if let Some(by_path) = rendered.strip_prefix("/dev/disk/by-path/") {
                    if let Some(name) = self.sysfs.resolve_by_path_target(by_path) {
                        info!(device = %name, candidate = %rendered, "FC candidate path resolved");
                        return Some(name);
                    }
                }
            }
        }
        None
    }
}

/// Derive `(platform, pci)` from an FC host's sysfs `device_path`: walk
/// segments, note a `platform` component if present, and take the segment
/// immediately before the first `host*`/`net*` segment as the PCI address.
fn derive_pci(device_path: &str) -> (Option<String>, String) {
    let segments: Vec<&str> = device_path.split('/').filter(|s| !s.is_empty()).collect();
    let mut platform = None;
    for (i, seg) in segments.iter().enumerate() {
        if *seg == "platform" {
            platform = segments.get(i + 1).map(|s| s.to_string());
        }
    }

    let host_or_net_idx = segments
        .iter()
        .position(|s| is_host_or_net_segment(s));

    let pci = host_or_net_idx
        .and_then(|idx| idx.checked_sub(1))
        .and_then(|idx| segments.get(idx))
        .map(|s| s.to_string())
        .unwrap_or_default();

    (platform, pci)
}

fn is_host_or_net_segment(seg: &str) -> bool {
    for prefix in ["host", "net"] {
        if let Some(rest) = seg.strip_prefix(prefix) {
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}
