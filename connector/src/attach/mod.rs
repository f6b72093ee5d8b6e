//! ProtocolAttachers — one pipeline per transport, sharing the skeleton
//! `parseDescriptor → plan(targets) → concurrently(login + rescan +
//! probe) → waitForDevice → classify → verify → return path`.

pub mod fc;
pub mod fc_nvme;
pub mod iscsi;
pub mod nfs;
pub mod nvme_rdma;

use crate::model::ResolvedDevice;

/// What a successful attach produced: the resolved device plus whatever
/// ancillary state (session NQNs, HBA hosts rescanned, …) Cleanup needs if
/// a later pipeline stage fails and this attach must be unwound.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    pub device: ResolvedDevice,
}

impl AttachOutcome {
    pub fn device_path(&self) -> String {
        self.device.path()
    }
}
