//! iSCSI attacher.
//!
//! iSCSI is addressed by `tgtPortals`/`tgtIQNs` descriptor fields. This
//! attacher follows the FC/RoCE-NVMe shape — concurrent per-portal login,
//! then hand off to `DeviceRegistry`/`Verifier` for discovery and WWN
//! verification. The `iscsiadm` invocations themselves — sendtargets
//! discovery per portal, then login, tolerating "already present"/"session
//! already exists" as success — follow the same shape as real-world
//! `connect_iscsi`/`find_iscsi_device` implementations.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::{DeviceClass, MultiPathType, ResolvedDevice, VolumeIdentifier};
use crate::registry::DeviceRegistry;
use crate::verify::{Rollback, Verifier};

use super::AttachOutcome;

const SETTLE_SINGLE: Duration = Duration::from_millis(1000);
const SETTLE_MULTIPATH: Duration = Duration::from_millis(3000);
const DISCOVERY_POLL_ATTEMPTS: u32 = 10;
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct IscsiAttacher<E: Executor> {
    exec: Arc<E>,
    registry: Arc<DeviceRegistry<E>>,
    verifier: Arc<Verifier<E>>,
    exec_timeout: Duration,
}

impl<E: Executor> IscsiAttacher<E> {
    pub fn new(
        exec: Arc<E>,
        registry: Arc<DeviceRegistry<E>>,
        verifier: Arc<Verifier<E>>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            exec,
            registry,
            verifier,
            exec_timeout,
        }
    }

    pub async fn attach(
        &self,
        id: &VolumeIdentifier,
        tgt_portals: &[String],
        tgt_iqns: &[String],
        multipath: bool,
        mp_type: MultiPathType,
        scan_volume_timeout: Duration,
        all_path_online: bool,
        rollback: &dyn Rollback,
    ) -> Result<AttachOutcome> {
        if tgt_portals.is_empty() {
            return Err(ConnectorError::InvalidDescriptor(
                "iSCSI descriptor has no target portals".into(),
            ));
        }

        let multipath_mode = tgt_portals.len() > 1;
        let mut successful_logins = 0usize;

        for (portal, iqn) in tgt_portals.iter().zip(tgt_iqns.iter()) {
            if self.login_one(portal, iqn).await {
                successful_logins += 1;
            }
        }

        if successful_logins == 0 {
            return Err(ConnectorError::VolumeNotFound(id.to_string()));
        }

        let settle = if multipath_mode { SETTLE_MULTIPATH } else { SETTLE_SINGLE };
        tokio::time::sleep(settle).await;

        let resolved = self.wait_for_device(id).await?;

        if multipath && matches!(mp_type, MultiPathType::Dm) {
            let row = self
                .verifier
                .verify_dm(
                    id,
                    tgt_portals.len(),
                    scan_volume_timeout,
                    all_path_online,
                    rollback,
                )
                .await?;
            return Ok(AttachOutcome {
                device: ResolvedDevice {
                    name: row.sysfs,
                    class: DeviceClass::DmMultipath,
                    physical_members: row.devices,
                },
            });
        }

        self.verifier.verify_single(&resolved.name, id, rollback).await?;
        Ok(AttachOutcome { device: resolved })
    }

    async fn login_one(&self, portal: &str, iqn: &str) -> bool {
        let discover = self
            .exec
            .run_unmasked(
                "iscsiadm",
                &["-m", "discovery", "-t", "sendtargets", "-p", portal],
                self.exec_timeout,
            )
            .await;
        if let Ok(out) = &discover {
            if !out.success {
                warn!(portal, "iscsiadm discovery returned error (may already be known)");
            }
        }

        let login = self
            .exec
            .run_unmasked(
                "iscsiadm",
                &["-m", "node", "-T", iqn, "-p", portal, "--login"],
                self.exec_timeout,
            )
            .await;

        match login {
            Ok(out) if out.success => {
                info!(portal, iqn, "iSCSI login successful");
                true
            }
            Ok(out)
                if out.output.contains("already present")
                    || out.output.contains("session already exists") =>
            {
                info!(portal, iqn, "iSCSI session already exists");
                true
            }
            Ok(out) => {
                warn!(portal, iqn, output = %out.output, "iscsiadm login failed");
                false
            }
            Err(e) => {
                warn!(portal, iqn, error = %e, "failed to execute iscsiadm login");
                false
            }
        }
    }

    async fn wait_for_device(&self, id: &VolumeIdentifier) -> Result<ResolvedDevice> {
        for attempt in 0..DISCOVERY_POLL_ATTEMPTS {
            if let Some(device) = self.registry.resolve(id.as_str()).await? {
                return Ok(device);
            }
            if attempt + 1 < DISCOVERY_POLL_ATTEMPTS {
                tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
            }
        }
        Err(ConnectorError::VolumeNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockExecutor, MockResponse};
    use crate::sysfs::SysfsProbe;
    use crate::vendor::VendorAdapter;

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

    struct NoRollback;
    #[async_trait::async_trait]
    impl Rollback for NoRollback {
        async fn undo(&self, _device: &str) -> Result<()> {
            Ok(())
        }
    }

    fn attacher(root: &std::path::Path, exec: Arc<MockExecutor>) -> IscsiAttacher<MockExecutor> {
        let sysfs = Arc::new(SysfsProbe::new(crate::rootfs::RootFs::at(root)));
        let registry = Arc::new(DeviceRegistry::new(
            exec.clone(),
            sysfs.clone(),
            Arc::new(NoVendor),
            Duration::from_secs(5),
        ));
        let verifier = Arc::new(Verifier::new(exec.clone(), registry.clone(), Duration::from_secs(5)));
        IscsiAttacher::new(exec, registry, verifier, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn single_portal_attach_resolves_and_verifies() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        std::fs::write(root.path().join("dev/sda"), b"").unwrap();
        std::os::unix::fs::symlink(
            "../../sda",
            root.path().join("dev/disk/by-id/wwn-0x6abcd001"),
        )
        .unwrap();

        let exec = Arc::new(MockExecutor::new());
        exec.register_program("iscsiadm", MockResponse::ok(""));
        exec.register(
            "scsi_id",
            &["--page", "0x83", "--whitelisted", "/dev/sda"],
            MockResponse::ok("6abcd001\n"),
        );
        exec.register_program("dd", MockResponse::ok(""));

        let a = attacher(root.path(), exec);
        let id = VolumeIdentifier::new("6abcd001");
        let outcome = a
            .attach(
                &id,
                &["10.0.0.1:3260".to_string()],
                &["iqn.2020-01.com.example:target0".to_string()],
                false,
                MultiPathType::Dm,
                Duration::from_secs(1),
                false,
                &NoRollback,
            )
            .await
            .unwrap();
        assert_eq!(outcome.device.name, "sda");
    }

    #[tokio::test]
    async fn no_successful_logins_yields_volume_not_found() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();

        let exec = Arc::new(MockExecutor::new());
        exec.register_program("iscsiadm", MockResponse::fail("connection refused"));

        let a = attacher(root.path(), exec);
        let id = VolumeIdentifier::new("6abcd001");
        let result = a
            .attach(
                &id,
                &["10.0.0.1:3260".to_string()],
                &["iqn.2020-01.com.example:target0".to_string()],
                false,
                MultiPathType::Dm,
                Duration::from_secs(1),
                false,
                &NoRollback,
            )
            .await;
        assert!(matches!(result, Err(ConnectorError::VolumeNotFound(_))));
    }
}
