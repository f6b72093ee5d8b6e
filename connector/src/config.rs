//! `ConnectorConfig` — every tunable this crate recognizes, loaded as a
//! `serde::Deserialize` struct with a hand-written `Default` matching the
//! documented defaults, so a config file only needs to override what it
//! disagrees with.

use std::time::Duration;

use serde::Deserialize;

use crate::model::MultiPathType;

/// `connectorThreads` is clamped into this range at construction time;
/// values outside it are a configuration error the caller should surface
/// before the first lock attempt, not silently clamp.
pub const CONNECTOR_THREADS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectorConfig {
    /// Permits per operation-class semaphore (connect/disconnect/extend).
    pub connector_threads: u32,
    /// DM-map appearance timeout, seconds.
    pub scan_volume_timeout_secs: u64,
    /// Residual-path sweep budget, seconds.
    pub device_cleanup_timeout_secs: u64,
    /// Per-subprocess timeout, seconds.
    pub exec_command_timeout_secs: u64,
    /// Require full expected path count during DM verify.
    pub all_path_online: bool,
    /// Directory holding `hw-pvc-lock-<id>` files.
    pub lock_dir: String,
    /// This node's configured multipath stack, asserted against
    /// `multipathd`'s `systemctl` state at startup.
    pub multi_path_type: MultiPathType,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_threads: 4,
            scan_volume_timeout_secs: 3,
            device_cleanup_timeout_secs: 240,
            exec_command_timeout_secs: 30,
            all_path_online: false,
            lock_dir: "/csi/lock".to_string(),
            multi_path_type: MultiPathType::Dm,
        }
    }
}

impl ConnectorConfig {
    /// Validates range constraints (`connectorThreads ∈ [1,10]`, timeouts
    /// `∈ [1,600]`). Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        if !CONNECTOR_THREADS_RANGE.contains(&self.connector_threads) {
            return Err(format!(
                "connector_threads must be in [1,10], got {}",
                self.connector_threads
            ));
        }
        for (name, secs) in [
            ("scan_volume_timeout_secs", self.scan_volume_timeout_secs),
            ("exec_command_timeout_secs", self.exec_command_timeout_secs),
        ] {
            if !(1..=600).contains(&secs) {
                return Err(format!("{name} must be in [1,600], got {secs}"));
            }
        }
        Ok(())
    }

    pub fn scan_volume_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_volume_timeout_secs)
    }

    pub fn device_cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.device_cleanup_timeout_secs)
    }

    pub fn exec_command_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_command_timeout_secs)
    }
}
