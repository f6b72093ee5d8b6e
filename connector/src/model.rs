//! Core data model: typed Rust values for the volume-attachment domain
//! (volume identifiers, connection descriptors, device classes) in place
//! of a string-keyed map.

use std::collections::HashMap;
use std::fmt;

use crate::error::{ConnectorError, Result};

/// Opaque globally-unique identifier for a volume: a LUN WWN (SCSI/FC) or
/// a namespace GUID/NGUID (NVMe). The primary key for every lookup and
/// verification step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeIdentifier(String);

impl VolumeIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// "Contains or is contained in" rather than strict equality — device
    /// WWNs are sometimes reported with a leading vendor nibble the array
    /// doesn't echo back.
    pub fn matches(&self, candidate: &str) -> bool {
        let a = self.0.to_lowercase();
        let b = candidate.to_lowercase();
        !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
    }
}

impl fmt::Display for VolumeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VolumeIdentifier {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VolumeIdentifier {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Which multipath stack aggregates physical paths into a virtual device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum MultiPathType {
    #[default]
    Dm,
    VendorScsi,
    VendorNvme,
}

impl TryFrom<String> for MultiPathType {
    type Error = ConnectorError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for MultiPathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultiPathType::Dm => write!(f, "DM"),
            MultiPathType::VendorScsi => write!(f, "vendor-SCSI"),
            MultiPathType::VendorNvme => write!(f, "vendor-NVMe"),
        }
    }
}

impl std::str::FromStr for MultiPathType {
    type Err = ConnectorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dm" => Ok(MultiPathType::Dm),
            "vendor-scsi" | "vendorscsi" => Ok(MultiPathType::VendorScsi),
            "vendor-nvme" | "vendornvme" => Ok(MultiPathType::VendorNvme),
            other => Err(ConnectorError::UnsupportedMultiPathType(other.to_string())),
        }
    }
}

/// Multipath toggle + chosen stack, shared across every descriptor variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MultipathSpec {
    pub enabled: bool,
    pub kind: MultiPathType,
}

/// Whether the volume is consumed as a raw block device or a mounted
/// filesystem. Block-mode volumes are skipped by `clear_residual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

/// `ConnectionDescriptor`: a tagged variant per transport instead of a
/// string-keyed map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Fc {
        lun_wwn: VolumeIdentifier,
        tgt_wwns: Vec<String>,
        tgt_host_luns: Vec<String>,
        multipath: MultipathSpec,
    },
    Iscsi {
        lun_wwn: VolumeIdentifier,
        tgt_portals: Vec<String>,
        tgt_iqns: Vec<String>,
        multipath: MultipathSpec,
    },
    NvmeRdma {
        lun_guid: VolumeIdentifier,
        tgt_portals: Vec<String>,
        multipath: MultipathSpec,
    },
    FcNvme {
        lun_guid: VolumeIdentifier,
        tgt_wwns: Vec<String>,
        multipath: MultipathSpec,
    },
    Nfs {
        src: String,
        fs_type: Option<String>,
        flags: Vec<String>,
    },
}

impl ConnectionDescriptor {
    pub fn identifier(&self) -> Option<&VolumeIdentifier> {
        match self {
            ConnectionDescriptor::Fc { lun_wwn, .. } => Some(lun_wwn),
            ConnectionDescriptor::Iscsi { lun_wwn, .. } => Some(lun_wwn),
            ConnectionDescriptor::NvmeRdma { lun_guid, .. } => Some(lun_guid),
            ConnectionDescriptor::FcNvme { lun_guid, .. } => Some(lun_guid),
            ConnectionDescriptor::Nfs { .. } => None,
        }
    }

    pub fn multipath(&self) -> MultipathSpec {
        match self {
            ConnectionDescriptor::Fc { multipath, .. }
            | ConnectionDescriptor::Iscsi { multipath, .. }
            | ConnectionDescriptor::NvmeRdma { multipath, .. }
            | ConnectionDescriptor::FcNvme { multipath, .. } => *multipath,
            ConnectionDescriptor::Nfs { .. } => MultipathSpec::default(),
        }
    }

    /// Parse the legacy string-keyed map shape at the boundary, for
    /// callers (e.g. a future CSI adapter's `volume_context`) that still
    /// hand over raw strings. This is the one place stringly typed input
    /// is accepted; everywhere else in the crate uses the typed variants
    /// directly.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let get = |k: &str| map.get(k).map(|s| s.as_str());
        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };

        let use_multipath = get("volumeUseMultiPath")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mp_type = get("multiPathType")
            .map(|v| v.parse::<MultiPathType>())
            .transpose()?
            .unwrap_or_default();
        let multipath = MultipathSpec {
            enabled: use_multipath,
            kind: mp_type,
        };

        if let Some(src) = get("nfsSrc") {
            return Ok(ConnectionDescriptor::Nfs {
                src: src.to_string(),
                fs_type: get("fsType").map(|s| s.to_string()),
                flags: get("mountFlags").map(split).unwrap_or_default(),
            });
        }

        if let Some(wwn) = get("tgtLunWWN") {
            if let Some(portals) = get("tgtPortals") {
                let tgt_portals = split(portals);
                let tgt_iqns = get("tgtIQNs").map(split).unwrap_or_default();
                if !tgt_iqns.is_empty() && tgt_portals.len() != tgt_iqns.len() {
                    return Err(ConnectorError::InvalidDescriptor(
                        "len(tgtPortals) must equal len(tgtIQNs)".into(),
                    ));
                }
                return Ok(ConnectionDescriptor::Iscsi {
                    lun_wwn: wwn.into(),
                    tgt_portals,
                    tgt_iqns,
                    multipath,
                });
            }

            let tgt_wwns = get("tgtWWNs").map(split).unwrap_or_default();
            let tgt_host_luns = get("tgtHostLUNs").map(split).unwrap_or_default();
            if tgt_wwns.len() != tgt_host_luns.len() {
                return Err(ConnectorError::InvalidDescriptor(
                    "len(tgtWWNs) must equal len(tgtHostLUNs)".into(),
                ));
            }
            return Ok(ConnectionDescriptor::Fc {
                lun_wwn: wwn.into(),
                tgt_wwns,
                tgt_host_luns,
                multipath,
            });
        }

        if let Some(guid) = get("tgtLunGuid") {
            if let Some(portals) = get("tgtPortals") {
                return Ok(ConnectionDescriptor::NvmeRdma {
                    lun_guid: guid.into(),
                    tgt_portals: split(portals),
                    multipath,
                });
            }
            let tgt_wwns = get("tgtWWNs").map(split).unwrap_or_default();
            return Ok(ConnectionDescriptor::FcNvme {
                lun_guid: guid.into(),
                tgt_wwns,
                multipath,
            });
        }

        Err(ConnectorError::InvalidDescriptor(
            "no recognized identifier key (tgtLunWWN/tgtLunGuid/nfsSrc)".into(),
        ))
    }
}

/// Initiator HBA record discovered from sysfs. Created on demand, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hba {
    pub host_device: String,
    pub port_name: String,
    pub node_name: String,
    pub device_path: String,
}

/// Tuple describing a candidate `/dev/disk/by-path/…` rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevicePath {
    pub platform: Option<String>,
    pub pci: String,
    pub target_wwn: String,
    pub lun_id: u64,
}

impl RawDevicePath {
    /// Decimal under 256, otherwise a 16-byte hex encoding: low 16 bits
    /// then high 16 bits of the integer lun, per the formal
    /// `formatLunId` definition (low word is written first).
    pub fn format_lun_id(lun: u64) -> String {
        if lun < 256 {
            lun.to_string()
        } else {
            let hi = (lun >> 16) & 0xffff;
            let lo = lun & 0xffff;
            format!("0x{:04x}{:04x}00000000", lo, hi)
        }
    }

    pub fn render(&self) -> String {
        let lun = Self::format_lun_id(self.lun_id);
        match &self.platform {
            Some(p) => format!(
                "/dev/disk/by-path/platform-{}-pci-{}-fc-0x{}-lun-{}",
                p, self.pci, self.target_wwn, lun
            ),
            None => format!(
                "/dev/disk/by-path/pci-{}-fc-0x{}-lun-{}",
                self.pci, self.target_wwn, lun
            ),
        }
    }
}

/// Device classification, derived purely from name prefix plus, for
/// `sd*`, a vendor-tool probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    NotMultipath,
    DmMultipath,
    VendorUltraPath,
    VendorUltraPathNvme,
}

/// A resolved device: its node name, class, and (for virtuals) its
/// discovered physical members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub name: String,
    pub class: DeviceClass,
    pub physical_members: Vec<String>,
}

impl ResolvedDevice {
    pub fn path(&self) -> String {
        format!("/dev/{}", self.name)
    }

    pub fn is_multipath(&self) -> bool {
        !matches!(self.class, DeviceClass::NotMultipath)
    }
}

/// Is `name` a partition device: names ending in digits, `nvmeXnYpZ`, or a
/// mpath-alias ending in a digit are never volume devices on their own —
/// EXCEPT that a bare `dm-N` or `sdX`/`nvmeXnY` name also ends in a digit
/// and must not be misclassified. The rule only excludes names that encode
/// an explicit partition suffix.
pub fn is_partition_device(name: &str) -> bool {
    // nvmeXnYpZ: namespace device with a trailing `pN` partition suffix.
    if name.starts_with("nvme") {
        if let Some(p_pos) = name.rfind('p') {
            let (ns, part) = name.split_at(p_pos);
            let part = &part[1..];
            if ns.contains('n') && !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
        return false;
    }

    // sdXN partitions: letters followed by digits (sda1, sdb12, ...).
    if let Some(name_sans_letters) = name.strip_prefix("sd") {
        let digit_start = name_sans_letters
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i);
        if let Some(i) = digit_start {
            return i < name_sans_letters.len();
        }
        return false;
    }

    // dm-N / ultrapathN are virtual device names, never partitions of
    // themselves; a trailing-digit alias like "ultrapath0p1" would be a
    // partition but bare "dm-3" must not be excluded.
    if name.starts_with("dm-") || name.starts_with("ultrapath") {
        return false;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_identifier_matches_is_case_insensitive_and_substring_based() {
        let id = VolumeIdentifier::new("6abcd1234");
        assert!(id.matches("6ABCD1234"));
        assert!(id.matches("prefix6abcd1234suffix"));
        assert!(!id.matches("deadbeef"));
        assert!(!id.matches(""));
    }

    #[test]
    fn lun_id_encoding_switches_to_hex_at_256() {
        assert_eq!(RawDevicePath::format_lun_id(5), "5");
        assert_eq!(RawDevicePath::format_lun_id(255), "255");
        assert_eq!(RawDevicePath::format_lun_id(256), "0x0100000000000000");
        assert_eq!(RawDevicePath::format_lun_id(70_000), "0x1170000100000000");
    }

    #[test]
    fn from_map_parses_fc_descriptor() {
        let mut map = HashMap::new();
        map.insert("tgtLunWWN".to_string(), "6abcd001".to_string());
        map.insert("tgtWWNs".to_string(), "2100aa,2100bb".to_string());
        map.insert("tgtHostLUNs".to_string(), "5,5".to_string());
        map.insert("volumeUseMultiPath".to_string(), "true".to_string());
        map.insert("multiPathType".to_string(), "DM".to_string());

        let desc = ConnectionDescriptor::from_map(&map).unwrap();
        match desc {
            ConnectionDescriptor::Fc {
                lun_wwn,
                tgt_wwns,
                tgt_host_luns,
                multipath,
            } => {
                assert_eq!(lun_wwn.as_str(), "6abcd001");
                assert_eq!(tgt_wwns, vec!["2100aa", "2100bb"]);
                assert_eq!(tgt_host_luns, vec!["5", "5"]);
                assert!(multipath.enabled);
                assert_eq!(multipath.kind, MultiPathType::Dm);
            }
            other => panic!("expected Fc descriptor, got {other:?}"),
        }
    }

    #[test]
    fn from_map_rejects_mismatched_wwn_lun_lengths() {
        let mut map = HashMap::new();
        map.insert("tgtLunWWN".to_string(), "6abcd001".to_string());
        map.insert("tgtWWNs".to_string(), "2100aa,2100bb".to_string());
        map.insert("tgtHostLUNs".to_string(), "5".to_string());

        assert!(ConnectionDescriptor::from_map(&map).is_err());
    }

    #[test]
    fn partition_device_detection() {
        assert!(is_partition_device("sda1"));
        assert!(is_partition_device("nvme0n1p2"));
        assert!(!is_partition_device("nvme0n1"));
        assert!(!is_partition_device("sda"));
        assert!(!is_partition_device("dm-3"));
        assert!(!is_partition_device("ultrapath0"));
    }
}
