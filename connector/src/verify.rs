//! Verifier — confirms a candidate device's WWN matches the requested
//! volume identifier, and that a multipath map's constituent paths all
//! agree with it too.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::VolumeIdentifier;
use crate::registry::DeviceRegistry;

/// Injected rollback capability, replacing a cyclic "attach passes its own
/// disconnect function into verification" callback with an explicit
/// interface any caller can implement or stub out.
#[async_trait::async_trait]
pub trait Rollback: Send + Sync {
    async fn undo(&self, device: &str) -> Result<()>;
}

/// A `Rollback` that does nothing — used by callers (e.g. read-only
/// verification during `isDeviceAvailable`) that never want a side effect.
pub struct NoRollback;

#[async_trait::async_trait]
impl Rollback for NoRollback {
    async fn undo(&self, _device: &str) -> Result<()> {
        Ok(())
    }
}

pub struct Verifier<E: Executor> {
    exec: Arc<E>,
    registry: Arc<DeviceRegistry<E>>,
    exec_timeout: Duration,
}

/// A parsed row from `multipathd show maps`, rendered with
/// `format "%n %d %w"` (name, sysfs device, wwid). The third column is the
/// WWID, not the member list — member devices are filled in separately via
/// `DeviceRegistry::get_physical_devices_of`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmMapRow {
    pub name: String,
    pub sysfs: String,
    pub wwid: String,
    pub devices: Vec<String>,
}

impl<E: Executor> Verifier<E> {
    pub fn new(exec: Arc<E>, registry: Arc<DeviceRegistry<E>>, exec_timeout: Duration) -> Self {
        Self {
            exec,
            registry,
            exec_timeout,
        }
    }

    /// Reads 512 KiB off `device` with `dd` and checks the resulting WWN
    /// against `id`. On read failure or mismatch, invokes the
    /// caller-supplied rollback and returns `VolumeDeviceNotFound`.
    pub async fn verify_single(
        &self,
        device: &str,
        id: &VolumeIdentifier,
        rollback: &dyn Rollback,
    ) -> Result<()> {
        let read = self
            .exec
            .run_unmasked(
                "dd",
                &[
                    &format!("if=/dev/{device}"),
                    "bs=1024",
                    "count=512",
                    "of=/dev/null",
                ],
                self.exec_timeout,
            )
            .await;

        let readable = matches!(&read, Ok(out) if out.success);
        let wwn = if readable {
            self.registry.get_wwn(device).await.ok()
        } else {
            None
        };

        let matched = wwn.as_deref().is_some_and(|w| id.matches(w));
        if readable && matched {
            return Ok(());
        }

        warn!(device, id = %id, "device failed WWN verification, rolling back");
        rollback.undo(device).await?;
        Err(ConnectorError::VolumeDeviceNotFound {
            device: device.to_string(),
            id: id.to_string(),
        })
    }

    /// Polls `multipathd show maps` until a matching row appears or the
    /// scan-volume timeout expires, then checks path count and member WWN
    /// consistency.
    pub async fn verify_dm(
        &self,
        id: &VolumeIdentifier,
        expected_path_count: usize,
        scan_volume_timeout: Duration,
        all_path_online: bool,
        rollback: &dyn Rollback,
    ) -> Result<DmMapRow> {
        let deadline = Instant::now() + scan_volume_timeout;
        let mut row = loop {
            if let Some(row) = self.find_dm_map_row(id).await? {
                break row;
            }
            if Instant::now() >= deadline {
                return Err(ConnectorError::VolumeNotFound(id.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };
        // Sysfs and `blockdev`/`scsi_id` lookups key off the kernel device
        // name (`dm-N`, the map's `sysfs` column), never the multipathd
        // alias (`name`) — `/sys/block/<alias>` does not exist. The alias
        // is retained on `row.name` purely for `multipath`/`multipathd`
        // CLI invocations, which address maps by alias.
        row.devices = self
            .registry
            .get_physical_devices_of(&row.sysfs, crate::model::DeviceClass::DmMultipath)
            .await?;

        if all_path_online && row.devices.len() < expected_path_count {
            warn!(
                dm = %row.name,
                found = row.devices.len(),
                expected = expected_path_count,
                "DM map has fewer paths than expected, cleaning up partial map"
            );
            rollback.undo(&row.name).await?;
            return Err(ConnectorError::VolumePathIncomplete {
                id: id.to_string(),
                found: row.devices.len(),
                expected: expected_path_count,
            });
        }

        let dm_wwn = self.registry.get_wwn(&row.sysfs).await?;
        if !id.matches(&dm_wwn) {
            rollback.undo(&row.name).await?;
            return Err(ConnectorError::InconsistentWWN(id.to_string()));
        }

        for member in &row.devices {
            let member_wwn = self.registry.get_wwn(member).await?;
            if !id.matches(&member_wwn) {
                warn!(member, "multipath member WWN disagrees with requested identifier");
                rollback.undo(&row.name).await?;
                return Err(ConnectorError::InconsistentWWN(id.to_string()));
            }
        }

        Ok(row)
    }

    async fn find_dm_map_row(&self, id: &VolumeIdentifier) -> Result<Option<DmMapRow>> {
        let out = self
            .exec
            .run_unmasked("multipathd", &["show", "maps"], self.exec_timeout)
            .await?;
        Ok(parse_show_maps(&out.output)
            .into_iter()
            .find(|row| id.matches(&row.wwid)))
    }
}

/// Parse `multipathd show maps format "%n %d %w"` output: `name sysfs
/// wwid`, whitespace separated, the same line-oriented style as the
/// vendor-CLI parsing in `vendor.rs`.
fn parse_show_maps(output: &str) -> Vec<DmMapRow> {
    let mut rows = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("name") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            debug!(line, "skipping unparsable show-maps row");
            continue;
        }
        rows.push(DmMapRow {
            name: fields[0].to_string(),
            sysfs: fields[1].to_string(),
            wwid: fields[2].to_string(),
            devices: Vec::new(),
        });
    }
    rows
}
