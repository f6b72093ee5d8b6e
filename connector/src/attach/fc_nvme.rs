//! FC-NVMe attacher.
//!
//! Same per-portal login/poll/aggregate skeleton as the RoCE-NVMe attacher
//! (`nvme_rdma.rs`) — the two protocols differ only in the NVMe-CLI
//! transport flag and in addressing targets by WWN instead of an IP
//! portal. `nvme connect -t fc ... -a <wwn>` takes the same argument shape
//! as `-t rdma -a <ip>`, so FC-NVMe is expressed here as a thin wrapper
//! rather than a parallel implementation.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::exec::Executor;
use crate::model::VolumeIdentifier;
use crate::registry::DeviceRegistry;
use crate::vendor::VendorAdapter;
use crate::verify::{Rollback, Verifier};

use super::nvme_rdma::NvmeRdmaAttacher;
use super::AttachOutcome;

pub struct FcNvmeAttacher<E: Executor> {
    inner: NvmeRdmaAttacher<E>,
}

impl<E: Executor> FcNvmeAttacher<E> {
    pub fn new(
        exec: Arc<E>,
        registry: Arc<DeviceRegistry<E>>,
        vendor: Arc<dyn VendorAdapter>,
        verifier: Arc<Verifier<E>>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            inner: NvmeRdmaAttacher::with_transport(exec, registry, vendor, verifier, exec_timeout, "fc"),
        }
    }

    pub async fn attach(
        &self,
        id: &VolumeIdentifier,
        tgt_wwns: &[String],
        multipath: bool,
        rollback: &dyn Rollback,
    ) -> Result<AttachOutcome>
    where
        E: 'static,
    {
        self.inner.attach(id, tgt_wwns, multipath, rollback).await
    }
}
