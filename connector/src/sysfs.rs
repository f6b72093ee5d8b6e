//! SysfsProbe — read-only inspection of sysfs, `/dev/disk/*`, and
//! `/proc/mounts`.
//!
//! Every function here is a pure read: no writes, no command execution.
//! Sysfs reads use plain `std::fs` calls (not `tokio::fs`) even from
//! async call sites — these reads are small and local, and keeping them
//! synchronous avoids threading `.await` through every trivial sysfs
//! peek.

use std::collections::HashMap;
use std::fs;

use tracing::{debug, warn};

use crate::error::{ConnectorError, Result};
use crate::model::Hba;
use crate::rootfs::RootFs;

pub struct SysfsProbe {
    fs: RootFs,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new(RootFs::real())
    }
}

impl SysfsProbe {
    pub fn new(fs: RootFs) -> Self {
        Self { fs }
    }

    /// `fcSupported()` — true iff `/sys/class/fc_host` exists.
    pub fn fc_supported(&self) -> bool {
        self.fs.path("/sys/class/fc_host").is_dir()
    }

    /// `listFcHosts()` — ordered sequence of host names (e.g. `host3`).
    pub fn list_fc_hosts(&self) -> Result<Vec<String>> {
        let dir = self.fs.path("/sys/class/fc_host");
        let mut hosts: Vec<String> = fs::read_dir(&dir)
            .map_err(ConnectorError::Io)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    /// `fcHbaInfo(host)` — record, or `None` when the port is offline or
    /// port_name/node_name can't be parsed as a single `0x…` hex token.
    pub fn fc_hba_info(&self, host: &str) -> Option<Hba> {
        let base = self.fs.path(&format!("/sys/class/fc_host/{}", host));

        let port_state = fs::read_to_string(base.join("port_state"))
            .ok()?
            .trim()
            .to_string();
        if port_state != "Online" {
            debug!(host, port_state, "FC host not online, skipping");
            return None;
        }

        let port_name = fs::read_to_string(base.join("port_name")).ok()?.trim().to_string();
        let node_name = fs::read_to_string(base.join("node_name")).ok()?.trim().to_string();
        if !is_single_hex_token(&port_name) || !is_single_hex_token(&node_name) {
            warn!(host, port_name, node_name, "unparsable FC host identifiers");
            return None;
        }

        let device_path = fs::canonicalize(&base)
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        Some(Hba {
            host_device: host.to_string(),
            port_name,
            node_name,
            device_path,
        })
    }

    /// `listDevicesByIdentifier(id)` — basenames under `/dev/disk/by-id`
    /// whose link target contains `id`. Order is irrelevant to callers;
    /// duplicates are the DeviceRegistry's concern, not this probe's.
    pub fn list_devices_by_identifier(&self, id: &str) -> Result<Vec<String>> {
        let dir = self.fs.path("/dev/disk/by-id");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir).map_err(ConnectorError::Io)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let link = match fs::read_link(entry.path()) {
                Ok(l) => l,
                Err(_) => continue,
            };
            let link_str = link.to_string_lossy();
            if link_str.to_lowercase().contains(&id.to_lowercase()) {
                found.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(found)
    }

    /// Follow a `/dev/disk/by-id/<basename>` symlink back to the real
    /// device node's basename (e.g. `sda`, `dm-3`). `list_devices_by_identifier`
    /// only returns the by-id basename; callers that need the actual
    /// device name (DeviceRegistry) resolve it through this.
    pub fn resolve_by_id_target(&self, by_id_basename: &str) -> Option<String> {
        let link = self.fs.path("/dev/disk/by-id").join(by_id_basename);
        let target = fs::read_link(&link).ok()?;
        let resolved = if target.is_absolute() {
            target
        } else {
            link.parent()?.join(target)
        };
        let canonical = fs::canonicalize(&resolved).unwrap_or(resolved);
        canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Enumerate `/sys/class/fc_transport/target<host>:*` entries for a
    /// given FC host, returning `(channel:target, port_name)` pairs. Used
    /// by the FC attacher to derive the HBA×target-WWN scan pairing.
    pub fn list_fc_transport_targets(&self, host: &str) -> Result<Vec<(String, String)>> {
        let dir = self.fs.path("/sys/class/fc_transport");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("target{host}:");
        let mut pairs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(ConnectorError::Io)? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(channel_target) = name.strip_prefix(&prefix) else {
                continue;
            };
            let port_name = match fs::read_to_string(entry.path().join("port_name")) {
                Ok(s) => s.trim().to_string(),
                Err(_) => continue,
            };
            pairs.push((channel_target.to_string(), port_name));
        }
        Ok(pairs)
    }

    /// Does a path (given relative to the configured root, e.g.
    /// `/dev/sda`) currently exist? Used by Cleanup to poll for a device
    /// node's disappearance after a delete.
    pub fn fs_node_exists(&self, absolute: &str) -> bool {
        self.fs.path(absolute).exists()
    }

    /// List every basename under `/dev/disk/by-id`, for Cleanup's dangling
    /// symlink sweep.
    pub fn list_by_id_entries(&self) -> Result<Vec<String>> {
        let dir = self.fs.path("/dev/disk/by-id");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(fs::read_dir(&dir)
            .map_err(ConnectorError::Io)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect())
    }

    /// Remove a `/dev/disk/by-id/<name>` symlink. Used by Cleanup once its
    /// target device node is confirmed gone.
    pub fn remove_by_id_symlink(&self, by_id_basename: &str) -> Result<()> {
        let link = self.fs.path("/dev/disk/by-id").join(by_id_basename);
        match fs::remove_file(&link) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConnectorError::Io(e)),
        }
    }

    /// Follow a `/dev/disk/by-path/<relative>` candidate rendering back to
    /// the real device node's basename, or `None` if it doesn't exist yet
    /// (the common case while the FC attacher is still polling).
    pub fn resolve_by_path_target(&self, relative: &str) -> Option<String> {
        let link = self.fs.path("/dev/disk/by-path").join(relative);
        let target = fs::read_link(&link).ok()?;
        let resolved = if target.is_absolute() {
            target
        } else {
            link.parent()?.join(target)
        };
        let canonical = fs::canonicalize(&resolved).unwrap_or(resolved);
        canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Mapping from mountpoint to source device, reading `/proc/mounts`
    /// up to 10 times until two consecutive reads agree byte-for-byte,
    /// defeating torn reads from a concurrent mount/unmount elsewhere on
    /// the host.
    pub fn read_mounts(&self) -> Result<HashMap<String, String>> {
        let path = self.fs.path("/proc/mounts");
        let mut previous: Option<String> = None;

        for attempt in 0..10 {
            let contents = fs::read_to_string(&path).map_err(ConnectorError::Io)?;
            if previous.as_deref() == Some(contents.as_str()) {
                return Ok(parse_mounts(&contents));
            }
            if attempt == 9 {
                warn!("/proc/mounts did not stabilize after 10 reads, using last read");
                return Ok(parse_mounts(&contents));
            }
            previous = Some(contents);
        }
        unreachable!("loop always returns by attempt 9")
    }

    /// Parse `/proc/nxup_lun_map_a` or `/proc/nxup_lun_map_b` — the vendor
    /// multipath driver's own LUN map, exposed as `=`-separated lines of
    /// `?=device_id=up_hctl=h:c:t:l=device_name=...`. Returns an empty
    /// vector if the file doesn't exist (host has no vendor driver loaded).
    pub fn read_nxup_lun_map(&self, side: char) -> Result<Vec<NxupLunMapEntry>> {
        let path = self.fs.path(&format!("/proc/nxup_lun_map_{side}"));
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ConnectorError::Io(e)),
        };
        Ok(contents
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('=').collect();
                if fields.len() < 5 {
                    debug!(line, "skipping unparsable nxup_lun_map row");
                    return None;
                }
                Some(NxupLunMapEntry {
                    device_id: fields[1].to_string(),
                    up_hctl: fields[2].to_string(),
                    hctl: fields[3].to_string(),
                    device_name: fields[4].to_string(),
                })
            })
            .collect())
    }
}

/// One row of the vendor driver's `/proc/nxup_lun_map_{a,b}` table,
/// mapping a device identifier to the virtual (`up_hctl`) and physical
/// (`hctl`) SCSI addresses backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NxupLunMapEntry {
    pub device_id: String,
    pub up_hctl: String,
    pub hctl: String,
    pub device_name: String,
}

fn is_single_hex_token(s: &str) -> bool {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x") {
        !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit())
    } else {
        false
    }
}

fn parse_mounts(contents: &str) -> HashMap<String, String> {
    let mut mounts = HashMap::new();
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let source = fields.next();
        let mountpoint = fields.next();
        if let (Some(source), Some(mountpoint)) = (source, mountpoint) {
            mounts.insert(mountpoint.to_string(), source.to_string());
        }
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn fake_root() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn fc_supported_detects_directory() {
        let root = fake_root();
        let probe = SysfsProbe::new(RootFs::at(root.path()));
        assert!(!probe.fc_supported());

        stdfs::create_dir_all(root.path().join("sys/class/fc_host")).unwrap();
        assert!(probe.fc_supported());
    }

    #[test]
    fn list_fc_hosts_is_sorted() {
        let root = fake_root();
        let base = root.path().join("sys/class/fc_host");
        stdfs::create_dir_all(base.join("host5")).unwrap();
        stdfs::create_dir_all(base.join("host3")).unwrap();
        let probe = SysfsProbe::new(RootFs::at(root.path()));
        assert_eq!(probe.list_fc_hosts().unwrap(), vec!["host3", "host5"]);
    }

    #[test]
    fn fc_hba_info_rejects_offline_port() {
        let root = fake_root();
        let base = root.path().join("sys/class/fc_host/host3");
        stdfs::create_dir_all(&base).unwrap();
        stdfs::write(base.join("port_state"), "Linkdown\n").unwrap();
        stdfs::write(base.join("port_name"), "0x2100001122334455\n").unwrap();
        stdfs::write(base.join("node_name"), "0x2000001122334455\n").unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        assert!(probe.fc_hba_info("host3").is_none());
    }

    #[test]
    fn fc_hba_info_parses_online_host() {
        let root = fake_root();
        let base = root.path().join("sys/class/fc_host/host3");
        stdfs::create_dir_all(&base).unwrap();
        stdfs::write(base.join("port_state"), "Online\n").unwrap();
        stdfs::write(base.join("port_name"), "0x2100001122334455\n").unwrap();
        stdfs::write(base.join("node_name"), "0x2000001122334455\n").unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let hba = probe.fc_hba_info("host3").unwrap();
        assert_eq!(hba.port_name, "0x2100001122334455");
        assert_eq!(hba.node_name, "0x2000001122334455");
    }

    #[test]
    fn fc_hba_info_rejects_unparsable_identifiers() {
        let root = fake_root();
        let base = root.path().join("sys/class/fc_host/host3");
        stdfs::create_dir_all(&base).unwrap();
        stdfs::write(base.join("port_state"), "Online\n").unwrap();
        stdfs::write(base.join("port_name"), "not-hex\n").unwrap();
        stdfs::write(base.join("node_name"), "0x2000001122334455\n").unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        assert!(probe.fc_hba_info("host3").is_none());
    }

    #[test]
    fn list_devices_by_identifier_matches_substring_case_insensitively() {
        let root = fake_root();
        let by_id = root.path().join("dev/disk/by-id");
        stdfs::create_dir_all(&by_id).unwrap();
        // simulate symlinks by writing real files whose content we won't
        // read; instead we create actual symlinks to distinct targets.
        let target_a = root.path().join("dev/sda");
        let target_b = root.path().join("dev/sdb");
        stdfs::write(&target_a, b"").unwrap();
        stdfs::write(&target_b, b"").unwrap();
        std::os::unix::fs::symlink(
            root.path().join("../../sda"),
            by_id.join("scsi-36ABCDEF00000001"),
        )
        .ok();
        std::os::unix::fs::symlink(&target_a, by_id.join("wwn-0x6abcdef00000001")).unwrap();
        std::os::unix::fs::symlink(&target_b, by_id.join("wwn-0x6abcdef00000002")).unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let found = probe.list_devices_by_identifier("6abcdef00000001").unwrap();
        assert!(found.contains(&"wwn-0x6abcdef00000001".to_string()));
        assert!(!found.contains(&"wwn-0x6abcdef00000002".to_string()));
    }

    #[test]
    fn read_mounts_parses_mountpoint_to_source() {
        let root = fake_root();
        stdfs::create_dir_all(root.path().join("proc")).unwrap();
        stdfs::write(
            root.path().join("proc/mounts"),
            "/dev/sda1 / ext4 rw 0 0\n/dev/mapper/mpatha /data xfs rw 0 0\n",
        )
        .unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let mounts = probe.read_mounts().unwrap();
        assert_eq!(mounts.get("/"), Some(&"/dev/sda1".to_string()));
        assert_eq!(mounts.get("/data"), Some(&"/dev/mapper/mpatha".to_string()));
    }

    #[test]
    fn list_fc_transport_targets_matches_host_prefix() {
        let root = fake_root();
        let base = root.path().join("sys/class/fc_transport");
        stdfs::create_dir_all(base.join("target3:0:0")).unwrap();
        stdfs::write(base.join("target3:0:0/port_name"), "0x2100001122334455\n").unwrap();
        stdfs::create_dir_all(base.join("target4:0:0")).unwrap();
        stdfs::write(base.join("target4:0:0/port_name"), "0x2100009988776655\n").unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let pairs = probe.list_fc_transport_targets("host3").unwrap();
        assert_eq!(pairs, vec![]);

        let pairs = probe.list_fc_transport_targets("3").unwrap();
        assert_eq!(pairs, vec![("0:0".to_string(), "0x2100001122334455".to_string())]);
    }

    #[test]
    fn resolve_by_path_target_follows_symlink_to_basename() {
        let root = fake_root();
        let by_path = root.path().join("dev/disk/by-path");
        stdfs::create_dir_all(&by_path).unwrap();
        stdfs::write(root.path().join("dev/sdc"), b"").unwrap();
        std::os::unix::fs::symlink("../../sdc", by_path.join("pci-0000:1a:00.0-fc-0x2100aa-lun-5"))
            .unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let resolved = probe.resolve_by_path_target("pci-0000:1a:00.0-fc-0x2100aa-lun-5");
        assert_eq!(resolved, Some("sdc".to_string()));
        assert_eq!(probe.resolve_by_path_target("does-not-exist"), None);
    }

    #[test]
    fn read_nxup_lun_map_parses_equals_separated_rows() {
        let root = fake_root();
        stdfs::create_dir_all(root.path().join("proc")).unwrap();
        stdfs::write(
            root.path().join("proc/nxup_lun_map_a"),
            "0=6abcdef00000001=up0_hctl=1:0:0:0=sda=extra\n",
        )
        .unwrap();

        let probe = SysfsProbe::new(RootFs::at(root.path()));
        let rows = probe.read_nxup_lun_map('a').unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "6abcdef00000001");
        assert_eq!(rows[0].up_hctl, "up0_hctl");
        assert_eq!(rows[0].hctl, "1:0:0:0");
        assert_eq!(rows[0].device_name, "sda");
    }

    #[test]
    fn read_nxup_lun_map_returns_empty_when_file_absent() {
        let root = fake_root();
        let probe = SysfsProbe::new(RootFs::at(root.path()));
        assert_eq!(probe.read_nxup_lun_map('b').unwrap(), Vec::new());
    }
}
