//! `Connector` — the six-operation facade a CSI node adapter holds and
//! calls into: `attach`, `detach`, `resize`, `mount`/`unmount`,
//! `clear_residual`, `is_device_available`. Owns the `ConcurrencyGovernor`,
//! `ConnectorConfig`, and every component these operations coordinate.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attach::fc::FcAttacher;
use crate::attach::fc_nvme::FcNvmeAttacher;
use crate::attach::iscsi::IscsiAttacher;
use crate::attach::nfs::NfsAttacher;
use crate::attach::nvme_rdma::NvmeRdmaAttacher;
use crate::cleanup::{Cleanup, CleanupRollback};
use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, OperationClass, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::lock::ConcurrencyGovernor;
use crate::metrics::OperationTimer;
use crate::model::{ConnectionDescriptor, DeviceClass, MultiPathType, ResolvedDevice, VolumeIdentifier, VolumeMode};
use crate::registry::DeviceRegistry;
use crate::resize::ResizeEngine;
use crate::rootfs::RootFs;
use crate::sysfs::SysfsProbe;
use crate::vendor::VendorAdapter;
use crate::verify::{NoRollback, Rollback, Verifier};

pub struct Connector<E: Executor> {
    config: ConnectorConfig,
    exec: Arc<E>,
    governor: Arc<ConcurrencyGovernor>,
    registry: Arc<DeviceRegistry<E>>,
    verifier: Arc<Verifier<E>>,
    cleanup: Arc<Cleanup<E>>,
    resize_engine: Arc<ResizeEngine<E>>,
    fc: FcAttacher<E>,
    iscsi: IscsiAttacher<E>,
    nvme_rdma: NvmeRdmaAttacher<E>,
    fc_nvme: FcNvmeAttacher<E>,
    nfs: NfsAttacher<E>,
    /// Fires to unblock every in-flight `HostExec` call (via `kill_on_drop`
    /// on the underlying child process) when a caller needs to abandon an
    /// operation ahead of its own timeout, e.g. on CSI RPC cancellation.
    cancellation: CancellationToken,
}

/// Infers a device's class from its name at rollback time, since a single
/// attach call may take either the single-device or the DM-multipath
/// branch internally and the same `Rollback` object is handed to both.
struct DynamicRollback<E: Executor> {
    cleanup: Arc<Cleanup<E>>,
}

#[async_trait::async_trait]
impl<E: Executor> Rollback for DynamicRollback<E> {
    async fn undo(&self, device: &str) -> Result<()> {
        let class = if device.starts_with("dm-") {
            DeviceClass::DmMultipath
        } else if device.starts_with("ultrapath") {
            DeviceClass::VendorUltraPath
        } else {
            DeviceClass::NotMultipath
        };
        self.cleanup.remove(device, class).await
    }
}

impl<E: Executor + 'static> Connector<E> {
    pub async fn new(
        config: ConnectorConfig,
        exec: Arc<E>,
        vendor: Arc<dyn VendorAdapter>,
        fs: RootFs,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|msg| ConnectorError::InvalidDescriptor(msg))?;

        assert_multipath_service_state(&exec, config.multi_path_type, config.exec_command_timeout()).await?;

        let governor = Arc::new(ConcurrencyGovernor::new(config.lock_dir.clone(), config.connector_threads).await?);
        let sysfs = Arc::new(SysfsProbe::new(fs.clone()));
        let exec_timeout = config.exec_command_timeout();

        let registry = Arc::new(DeviceRegistry::new(exec.clone(), sysfs.clone(), vendor.clone(), exec_timeout));
        let verifier = Arc::new(Verifier::new(exec.clone(), registry.clone(), exec_timeout));
        let cleanup = Arc::new(Cleanup::new(
            exec.clone(),
            sysfs.clone(),
            registry.clone(),
            vendor.clone(),
            exec_timeout,
        ));
        let resize_engine = Arc::new(ResizeEngine::new(exec.clone(), registry.clone(), vendor.clone(), exec_timeout));

        let fc = FcAttacher::new(exec.clone(), sysfs.clone(), registry.clone(), verifier.clone(), exec_timeout);
        let iscsi = IscsiAttacher::new(exec.clone(), registry.clone(), verifier.clone(), exec_timeout);
        let nvme_rdma = NvmeRdmaAttacher::new(exec.clone(), registry.clone(), vendor.clone(), verifier.clone(), exec_timeout);
        let fc_nvme = FcNvmeAttacher::new(exec.clone(), registry.clone(), vendor.clone(), verifier.clone(), exec_timeout);
        let nfs = NfsAttacher::new(exec.clone(), sysfs.clone(), fs, exec_timeout);

        Ok(Self {
            config,
            exec,
            governor,
            registry,
            verifier,
            cleanup,
            resize_engine,
            fc,
            iscsi,
            nvme_rdma,
            fc_nvme,
            nfs,
            cancellation: CancellationToken::new(),
        })
    }

    /// Cancel every operation currently in flight on this `Connector`. Each
    /// pipeline races its own work against this token and returns
    /// `ConnectorError::Cancelled` if it fires first; any subprocess the
    /// pipeline had spawned is killed as its future is dropped.
    pub fn cancel_inflight_operations(&self) {
        self.cancellation.cancel();
    }

    async fn run_cancellable<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.cancellation.cancelled() => Err(ConnectorError::Cancelled),
        }
    }

    fn rollback(&self) -> DynamicRollback<E> {
        DynamicRollback {
            cleanup: self.cleanup.clone(),
        }
    }

    /// `assertMultipathServiceState(mpType)` — confirm `multipathd` is active
    /// for DM multipath and inactive when a vendor stack owns path
    /// aggregation instead, per §6's `systemctl` host-tool dependency. Run
    /// once at construction against `config.multi_path_type`; exposed so a
    /// caller can re-assert it, e.g. after an operator switches multipath
    /// stacks without restarting the process.
    pub async fn assert_multipath_service_state(&self, mp_type: MultiPathType) -> Result<()> {
        assert_multipath_service_state(&self.exec, mp_type, self.config.exec_command_timeout()).await
    }

    /// `attach(descriptor, operationClass=connect) -> device_path`.
    pub async fn attach(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        let timer = OperationTimer::new("attach");
        let result = self.attach_inner(descriptor).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(error_kind(e)),
        }
        result
    }

    async fn attach_inner(&self, descriptor: &ConnectionDescriptor) -> Result<ResolvedDevice> {
        if matches!(descriptor, ConnectionDescriptor::Nfs { .. }) {
            return Err(ConnectorError::InvalidDescriptor(
                "NFS descriptors are attached via mount(), not attach()".into(),
            ));
        }

        let id = descriptor
            .identifier()
            .ok_or_else(|| ConnectorError::InvalidDescriptor("descriptor has no volume identifier".into()))?;

        let held = self
            .governor
            .lock(id.as_str(), OperationClass::Connect, LOCK_SEMAPHORE_TIMEOUT)
            .await?;

        let rollback = self.rollback();
        let scan_timeout = self.config.scan_volume_timeout();
        let all_path_online = self.config.all_path_online;

        let outcome = match descriptor {
            ConnectionDescriptor::Fc {
                lun_wwn,
                tgt_wwns,
                tgt_host_luns,
                multipath,
            } => {
                self.fc
                    .attach(lun_wwn, tgt_wwns, tgt_host_luns, multipath.enabled, multipath.kind, scan_timeout, all_path_online, &rollback)
                    .await
            }
            ConnectionDescriptor::Iscsi {
                lun_wwn,
                tgt_portals,
                tgt_iqns,
                multipath,
            } => {
                self.iscsi
                    .attach(lun_wwn, tgt_portals, tgt_iqns, multipath.enabled, multipath.kind, scan_timeout, all_path_online, &rollback)
                    .await
            }
            ConnectionDescriptor::NvmeRdma { lun_guid, tgt_portals, multipath } => {
                self.nvme_rdma.attach(lun_guid, tgt_portals, multipath.enabled, &rollback).await
            }
            ConnectionDescriptor::FcNvme { lun_guid, tgt_wwns, multipath } => {
                self.fc_nvme.attach(lun_guid, tgt_wwns, multipath.enabled, &rollback).await
            }
            ConnectionDescriptor::Nfs { .. } => unreachable!("handled above"),
        };

        self.governor.unlock(held).await?;
        outcome.map(|o| o.device)
    }

    /// `detach(identifier, operationClass=disconnect)`.
    pub async fn detach(&self, id: &VolumeIdentifier) -> Result<()> {
        let timer = OperationTimer::new("detach");
        let result = self.detach_inner(id).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(error_kind(e)),
        }
        result
    }

    async fn detach_inner(&self, id: &VolumeIdentifier) -> Result<()> {
        let held = self
            .governor
            .lock(id.as_str(), OperationClass::Disconnect, LOCK_SEMAPHORE_TIMEOUT)
            .await?;

        let device = self.registry.resolve(id.as_str()).await?;
        let result = match device {
            Some(d) => self.cleanup.remove(&d.name, d.class).await,
            None => {
                info!(id = %id, "detach called for volume with no resolvable device, treating as already detached");
                Ok(())
            }
        };

        self.governor.unlock(held).await?;
        result
    }

    /// `resize(identifier, requested_bytes, operationClass=extend)`.
    ///
    /// `mount_path`, when given, requests the online filesystem grow
    /// described in spec §4.8 on top of the device-level resize — the
    /// CSI `NodeExpandVolume` case for a mounted (non-raw-block) volume.
    pub async fn resize(
        &self,
        id: &VolumeIdentifier,
        requested_bytes: u64,
        mount_path: Option<&str>,
    ) -> Result<()> {
        let timer = OperationTimer::new("resize");
        let result = self.resize_inner(id, requested_bytes, mount_path).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(error_kind(e)),
        }
        result
    }

    async fn resize_inner(
        &self,
        id: &VolumeIdentifier,
        requested_bytes: u64,
        mount_path: Option<&str>,
    ) -> Result<()> {
        let held = self
            .governor
            .lock(id.as_str(), OperationClass::Extend, LOCK_SEMAPHORE_TIMEOUT)
            .await?;

        let device = self
            .registry
            .resolve(id.as_str())
            .await?
            .ok_or_else(|| ConnectorError::VolumeNotFound(id.to_string()))?;
        let result = async {
            self.resize_engine
                .resize_device(&device, requested_bytes, self.config.device_cleanup_timeout())
                .await?;
            if let Some(path) = mount_path {
                self.resize_engine.grow_filesystem(path).await?;
            }
            Ok(())
        }
        .await;

        self.governor.unlock(held).await?;
        result
    }

    /// `mount(src, dst, flags)`.
    pub async fn mount(&self, src: &str, dst: &str, fs_type: Option<&str>, flags: &[String]) -> Result<()> {
        self.nfs.mount(src, dst, fs_type, flags).await
    }

    /// `unmount(dst)`.
    pub async fn unmount(&self, dst: &str) -> Result<()> {
        self.nfs.unmount(dst).await
    }

    /// `clearResidual(identifier, volumeMode, multipathType)`.
    pub async fn clear_residual(&self, id: &VolumeIdentifier, volume_mode: VolumeMode, mp_type: MultiPathType) -> Result<()> {
        self.cleanup.clear_residual_paths(id, volume_mode, mp_type).await
    }

    /// `isDeviceAvailable(devicePath, identifier) -> bool`.
    pub async fn is_device_available(&self, device_path: &str, id: &VolumeIdentifier) -> Result<bool> {
        let name = device_path.trim_start_matches("/dev/");
        match self.verifier.verify_single(name, id, &NoRollback).await {
            Ok(()) => Ok(true),
            Err(ConnectorError::VolumeDeviceNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

const LOCK_SEMAPHORE_TIMEOUT: Duration = Duration::from_secs(60);

async fn assert_multipath_service_state<E: Executor>(
    exec: &Arc<E>,
    mp_type: MultiPathType,
    exec_timeout: Duration,
) -> Result<()> {
    let out = exec
        .run_unmasked("systemctl", &["is-active", "multipathd"], exec_timeout)
        .await?;
    let active = out.output.trim() == "active";
    match mp_type {
        MultiPathType::Dm if !active => Err(ConnectorError::HostCommandFailed(
            "multipathd is required to be active for DM multipath but is not".into(),
        )),
        MultiPathType::VendorScsi | MultiPathType::VendorNvme if active => {
            warn!("multipathd is active while a vendor multipath stack is configured");
            Ok(())
        }
        _ => Ok(()),
    }
}

fn error_kind(e: &ConnectorError) -> &'static str {
    match e {
        ConnectorError::LockTimeout(_) => "lock_timeout",
        ConnectorError::SemaphoreTimeout(_) => "semaphore_timeout",
        ConnectorError::MissingPermit(_) => "missing_permit",
        ConnectorError::VolumeNotFound(_) => "volume_not_found",
        ConnectorError::VolumeDeviceNotFound { .. } => "volume_device_not_found",
        ConnectorError::VolumePathIncomplete { .. } => "volume_path_incomplete",
        ConnectorError::DeviceNotUnique(_) => "device_not_unique",
        ConnectorError::InconsistentWWN(_) => "inconsistent_wwn",
        ConnectorError::UnsupportedMultiPathType(_) => "unsupported_multipath_type",
        ConnectorError::UnsupportedFsType(_) => "unsupported_fs_type",
        ConnectorError::HostCommandFailed(_) => "host_command_failed",
        ConnectorError::Timeout(_) => "timeout",
        ConnectorError::Parse { .. } => "parse",
        ConnectorError::InvalidDescriptor(_) => "invalid_descriptor",
        ConnectorError::Io(_) => "io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{MockExecutor, MockResponse};
    use crate::vendor::VendorVirtualDevice;

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
        ) -> Result<Option<VendorVirtualDevice>> {
            Ok(None)
        }
        async fn remove_virtual(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn rescan(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn connector(root: &std::path::Path, exec: Arc<MockExecutor>) -> Connector<MockExecutor> {
        exec.register(
            "systemctl",
            &["is-active", "multipathd"],
            MockResponse::ok("active\n"),
        );
        let mut config = ConnectorConfig::default();
        config.lock_dir = root.join("locks").to_string_lossy().into_owned();
        Connector::new(config, exec, Arc::new(NoVendor), RootFs::at(root))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn detach_on_unresolvable_volume_is_a_noop() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        let exec = Arc::new(MockExecutor::new());
        let c = connector(root.path(), exec).await;
        let id = VolumeIdentifier::new("6abcd001");
        c.detach(&id).await.unwrap();
    }

    #[tokio::test]
    async fn is_device_available_returns_false_on_wwn_mismatch() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.register_program("dd", MockResponse::ok(""));
        exec.register(
            "scsi_id",
            &["--page", "0x83", "--whitelisted", "/dev/sda"],
            MockResponse::ok("deadbeef\n"),
        );
        let c = connector(root.path(), exec).await;
        let id = VolumeIdentifier::new("6abcd001");
        let available = c.is_device_available("/dev/sda", &id).await.unwrap();
        assert!(!available);
    }

    #[tokio::test]
    async fn is_device_available_returns_true_on_wwn_match() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.register_program("dd", MockResponse::ok(""));
        exec.register(
            "scsi_id",
            &["--page", "0x83", "--whitelisted", "/dev/sda"],
            MockResponse::ok("6abcd001\n"),
        );
        let c = connector(root.path(), exec).await;
        let id = VolumeIdentifier::new("6abcd001");
        let available = c.is_device_available("/dev/sda", &id).await.unwrap();
        assert!(available);
    }

    #[tokio::test]
    async fn construction_fails_when_multipathd_inactive_for_dm() {
        let root = tempfile::TempDir::new().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.register(
            "systemctl",
            &["is-active", "multipathd"],
            MockResponse::ok("inactive\n"),
        );
        let mut config = ConnectorConfig::default();
        config.lock_dir = root.path().join("locks").to_string_lossy().into_owned();
        let result = Connector::new(config, exec, Arc::new(NoVendor), RootFs::at(root.path())).await;
        assert!(matches!(result, Err(ConnectorError::HostCommandFailed(_))));
    }

    #[tokio::test]
    async fn construction_succeeds_when_vendor_stack_configured_despite_multipathd_active() {
        let root = tempfile::TempDir::new().unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.register(
            "systemctl",
            &["is-active", "multipathd"],
            MockResponse::ok("active\n"),
        );
        let mut config = ConnectorConfig::default();
        config.lock_dir = root.path().join("locks").to_string_lossy().into_owned();
        config.multi_path_type = MultiPathType::VendorScsi;
        let result = Connector::new(config, exec, Arc::new(NoVendor), RootFs::at(root.path())).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_bad_config_at_construction() {
        let root = tempfile::TempDir::new().unwrap();
        let mut config = ConnectorConfig::default();
        config.connector_threads = 0;
        config.lock_dir = root.path().join("locks").to_string_lossy().into_owned();
        let exec = Arc::new(MockExecutor::new());
        let result = Connector::new(config, exec, Arc::new(NoVendor), RootFs::at(root.path())).await;
        assert!(result.is_err());
    }
}
