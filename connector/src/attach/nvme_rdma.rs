//! RoCE-NVMe attacher.
//!
//! One cooperative task per reachable portal: discover, connect (idempotent
//! against an already-live session), then poll for a namespace device
//! matching the requested identifier. An aggregator waits until either any
//! task found a device and all tasks finished, or a grace window elapses
//! after the last login, then flips `stop_connecting` so in-flight tasks
//! can exit their poll loops early.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ConnectorError, Result};
use crate::exec::{Executor, ExecutorExt};
use crate::model::{DeviceClass, MultiPathType, ResolvedDevice, VolumeIdentifier};
use crate::registry::DeviceRegistry;
use crate::vendor::VendorAdapter;
use crate::verify::{Rollback, Verifier};

use super::AttachOutcome;

const PING_COUNT: &str = "3";
const PING_TIMEOUT: Duration = Duration::from_secs(3);
const POST_LOGIN_GRACE: Duration = Duration::from_secs(15);
const MAX_POLL_ATTEMPTS: u32 = 3;
const POLL_BASE_DELAY: Duration = Duration::from_millis(500);

/// Shared state across the per-portal tasks of a single `attach` call:
/// atomic counters plus two mutex-guarded device-name lists.
#[derive(Default)]
struct LoginState {
    stop_connecting: AtomicBool,
    num_login: AtomicUsize,
    failed_login: AtomicUsize,
    stopped_threads: AtomicUsize,
    found_devices: Mutex<Vec<String>>,
    just_added_devices: Mutex<Vec<String>>,
    /// Timestamp of the most recently completed per-portal login, so the
    /// aggregator can measure its grace window from the last completion
    /// rather than from when `attach` started.
    last_login: Mutex<Option<Instant>>,
}

pub struct NvmeRdmaAttacher<E: Executor> {
    exec: Arc<E>,
    registry: Arc<DeviceRegistry<E>>,
    vendor: Arc<dyn VendorAdapter>,
    verifier: Arc<Verifier<E>>,
    exec_timeout: Duration,
    transport: &'static str,
}

impl<E: Executor> NvmeRdmaAttacher<E> {
    pub fn new(
        exec: Arc<E>,
        registry: Arc<DeviceRegistry<E>>,
        vendor: Arc<dyn VendorAdapter>,
        verifier: Arc<Verifier<E>>,
        exec_timeout: Duration,
    ) -> Self {
        Self::with_transport(exec, registry, vendor, verifier, exec_timeout, "rdma")
    }

    /// Used by the FC-NVMe attacher, which reuses this whole skeleton with
    /// `-t fc` substituted for `-t rdma` (SPEC_FULL.md §4).
    pub fn with_transport(
        exec: Arc<E>,
        registry: Arc<DeviceRegistry<E>>,
        vendor: Arc<dyn VendorAdapter>,
        verifier: Arc<Verifier<E>>,
        exec_timeout: Duration,
        transport: &'static str,
    ) -> Self {
        Self {
            exec,
            registry,
            vendor,
            verifier,
            exec_timeout,
            transport,
        }
    }

    pub async fn attach(
        &self,
        id: &VolumeIdentifier,
        tgt_portals: &[String],
        multipath: bool,
        rollback: &dyn Rollback,
    ) -> Result<AttachOutcome>
    where
        E: 'static,
    {
        // The ICMP pre-flight only makes sense for IP portals (RoCE); the
        // FC-NVMe transport addresses targets by WWN, which isn't
        // pingable, so it skips straight to login for every target.
        let reachable = if self.transport == "rdma" {
            self.ping_filter(tgt_portals).await
        } else {
            tgt_portals.to_vec()
        };
        if reachable.is_empty() {
            return Err(ConnectorError::VolumeNotFound(id.to_string()));
        }

        let state = Arc::new(LoginState::default());
        let mut tasks = JoinSet::new();
        for portal in reachable {
            let exec = self.exec.clone();
            let registry = self.registry.clone();
            let state = state.clone();
            let id_str = id.as_str().to_string();
            let timeout = self.exec_timeout;
            let transport = self.transport;
            tasks.spawn(async move {
                run_portal_task(exec, registry, state, portal, id_str, timeout, transport).await;
            });
        }

        state.last_login.lock().await.replace(Instant::now());
        loop {
            if tasks.join_next().await.is_none() {
                break;
            }
            let found = !state.found_devices.lock().await.is_empty();
            if found && tasks.is_empty() {
                break;
            }
            let since_last_login = match *state.last_login.lock().await {
                Some(t) => Instant::now().duration_since(t),
                None => Duration::ZERO,
            };
            if since_last_login >= POST_LOGIN_GRACE && found {
                break;
            }
        }
        state.stop_connecting.store(true, Ordering::SeqCst);
        while tasks.join_next().await.is_some() {}

        let found_devices = state.found_devices.lock().await.clone();
        if found_devices.is_empty() {
            return Err(ConnectorError::VolumeNotFound(id.to_string()));
        }

        if multipath {
            if let Some(vendor_virtual) = self
                .vendor
                .find_virtual_by_identifier(id.as_str(), DeviceClass::VendorUltraPathNvme)
                .await?
            {
                let resolved = ResolvedDevice {
                    name: vendor_virtual.name,
                    class: DeviceClass::VendorUltraPathNvme,
                    physical_members: vendor_virtual.members,
                };
                self.verifier.verify_single(&resolved.name, id, rollback).await?;
                return Ok(AttachOutcome { device: resolved });
            }
        }

        let name = found_devices[0].clone();
        self.verifier.verify_single(&name, id, rollback).await?;
        Ok(AttachOutcome {
            device: ResolvedDevice {
                name,
                class: DeviceClass::NotMultipath,
                physical_members: Vec::new(),
            },
        })
    }

    async fn ping_filter(&self, portals: &[String]) -> Vec<String> {
        let mut reachable = Vec::new();
        for portal in portals {
            let host = portal.split(':').next().unwrap_or(portal);
            let out = self
                .exec
                .run_unmasked("ping", &["-c", PING_COUNT, host], PING_TIMEOUT)
                .await;
            match out {
                Ok(out) if out.success => reachable.push(portal.clone()),
                _ => warn!(portal, "portal unreachable, dropping from attach plan"),
            }
        }
        reachable
    }
}

async fn run_portal_task<E: Executor>(
    exec: Arc<E>,
    registry: Arc<DeviceRegistry<E>>,
    state: Arc<LoginState>,
    portal: String,
    id: String,
    timeout: Duration,
    transport: &'static str,
) {
    let discover = exec
        .run_unmasked("nvme", &["discover", "-t", transport, "-a", &portal], timeout)
        .await;
    let nqn = match discover {
        Ok(out) => out
            .lines()
            .find_map(|l| l.trim().strip_prefix("subnqn:").map(|s| s.trim().to_string())),
        Err(_) => None,
    };
    let Some(nqn) = nqn else {
        state.failed_login.fetch_add(1, Ordering::SeqCst);
        state.stopped_threads.fetch_add(1, Ordering::SeqCst);
        return;
    };

    let already_live = is_session_live(&exec, &portal, timeout).await;
    if !already_live {
        let connect = exec
            .run_unmasked(
                "nvme",
                &["connect", "-t", transport, "-a", &portal, "-n", &nqn],
                timeout,
            )
            .await;
        match connect {
            Ok(out)
                if matches!(out.exit_code, Some(0) | Some(70))
                    || out.output.contains("Input/output error") =>
            {
                state.num_login.fetch_add(1, Ordering::SeqCst);
                state.last_login.lock().await.replace(Instant::now());
            }
            _ => {
                state.failed_login.fetch_add(1, Ordering::SeqCst);
                state.stopped_threads.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    } else {
        debug!(portal, "NVMe session already live for this portal");
        state.last_login.lock().await.replace(Instant::now());
    }

    let mut delay = POLL_BASE_DELAY;
    for _ in 0..MAX_POLL_ATTEMPTS {
        if state.stop_connecting.load(Ordering::SeqCst) {
            break;
        }
        if let Ok(Some(device)) = registry.resolve(&id).await {
            state.found_devices.lock().await.push(device.name.clone());
            state.just_added_devices.lock().await.push(device.name);
            state.stopped_threads.fetch_add(1, Ordering::SeqCst);
            return;
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    state.stopped_threads.fetch_add(1, Ordering::SeqCst);
}

async fn is_session_live<E: Executor>(exec: &Arc<E>, portal: &str, timeout: Duration) -> bool {
    let out = exec
        .run_unmasked("nvme", &["list-subsys", "-o", "json"], timeout)
        .await;
    match out {
        Ok(out) => {
            let host = portal.split(':').next().unwrap_or(portal);
            out.output.contains(host)
        }
        Err(_) => false,
    }
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
            id: &str,
            _class_hint: DeviceClass,
        ) -> Result<Option<crate::vendor::VendorVirtualDevice>> {
            if id == "ultrapath-match" {
                return Ok(Some(crate::vendor::VendorVirtualDevice {
                    name: "ultrapath0".to_string(),
                    wwn: id.to_string(),
                    members: vec!["nvme0n1".to_string()],
                }));
            }
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

    fn attacher(root: &std::path::Path, exec: Arc<MockExecutor>) -> NvmeRdmaAttacher<MockExecutor> {
        let sysfs = Arc::new(SysfsProbe::new(crate::rootfs::RootFs::at(root)));
        let registry = Arc::new(DeviceRegistry::new(
            exec.clone(),
            sysfs.clone(),
            Arc::new(NoVendor),
            Duration::from_secs(5),
        ));
        let verifier = Arc::new(Verifier::new(exec.clone(), registry.clone(), Duration::from_secs(5)));
        NvmeRdmaAttacher::new(exec, registry, Arc::new(NoVendor), verifier, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn drops_unreachable_portal_and_connects_only_to_reachable_one() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        std::fs::write(root.path().join("dev/nvme0n1"), b"").unwrap();
        std::os::unix::fs::symlink(
            "../../nvme0n1",
            root.path().join("dev/disk/by-id/nvme-eui.abcd1234"),
        )
        .unwrap();

        let exec = Arc::new(MockExecutor::new());
        exec.register("ping", &["-c", "3", "10.0.0.1"], MockResponse::ok(""));
        exec.register("ping", &["-c", "3", "10.0.0.2"], MockResponse::fail(""));
        exec.register_program(
            "nvme",
            MockResponse::ok("subnqn: nqn.2014-08.org.nvmexpress:uuid:test\n"),
        );
        exec.register(
            "nvme",
            &["connect", "-t", "rdma", "-a", "10.0.0.1", "-n", "nqn.2014-08.org.nvmexpress:uuid:test"],
            MockResponse::ok(""),
        );
        exec.register("nvme", &["list-subsys", "-o", "json"], MockResponse::ok("{}"));
        exec.register(
            "nvme",
            &["id-ns", "/dev/nvme0n1", "-o", "json"],
            MockResponse::ok(r#"{"nguid":"abcd1234"}"#),
        );
        exec.register_program("dd", MockResponse::ok(""));

        let a = attacher(root.path(), exec.clone());
        let id = VolumeIdentifier::new("abcd1234");
        let outcome = a
            .attach(
                &id,
                &["10.0.0.1".to_string(), "10.0.0.2".to_string()],
                false,
                &NoRollback,
            )
            .await
            .unwrap();
        assert_eq!(outcome.device.name, "nvme0n1");
        assert_eq!(exec.call_count("ping"), 2);
    }

    #[tokio::test]
    async fn connect_exit_code_70_is_treated_as_success() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        std::fs::write(root.path().join("dev/nvme0n1"), b"").unwrap();
        std::os::unix::fs::symlink(
            "../../nvme0n1",
            root.path().join("dev/disk/by-id/nvme-eui.abcd1234"),
        )
        .unwrap();

        let exec = Arc::new(MockExecutor::new());
        exec.register("ping", &["-c", "3", "10.0.0.1"], MockResponse::ok(""));
        exec.register_program(
            "nvme",
            MockResponse::ok("subnqn: nqn.2014-08.org.nvmexpress:uuid:test\n"),
        );
        exec.register(
            "nvme",
            &["connect", "-t", "rdma", "-a", "10.0.0.1", "-n", "nqn.2014-08.org.nvmexpress:uuid:test"],
            MockResponse::fail("already connected").with_exit_code(70),
        );
        exec.register("nvme", &["list-subsys", "-o", "json"], MockResponse::ok("{}"));
        exec.register(
            "nvme",
            &["id-ns", "/dev/nvme0n1", "-o", "json"],
            MockResponse::ok(r#"{"nguid":"abcd1234"}"#),
        );
        exec.register_program("dd", MockResponse::ok(""));

        let a = attacher(root.path(), exec.clone());
        let id = VolumeIdentifier::new("abcd1234");
        let outcome = a
            .attach(&id, &["10.0.0.1".to_string()], false, &NoRollback)
            .await
            .unwrap();
        assert_eq!(outcome.device.name, "nvme0n1");
    }

    #[tokio::test]
    async fn all_portals_unreachable_yields_volume_not_found() {
        let root = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("dev/disk/by-id")).unwrap();
        let exec = Arc::new(MockExecutor::new());
        exec.register_program("ping", MockResponse::fail(""));

        let a = attacher(root.path(), exec);
        let id = VolumeIdentifier::new("abcd1234");
        let result = a
            .attach(&id, &["10.0.0.2".to_string()], false, &NoRollback)
            .await;
        assert!(matches!(result, Err(ConnectorError::VolumeNotFound(_))));
    }
}
