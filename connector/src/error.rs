//! Error taxonomy for the connector subsystem.
//!
//! A single `thiserror` enum, flat over named failure modes, plus a
//! crate-local `Result<T>` alias. See DESIGN.md for the grounding source.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Could not acquire the per-volume file lock within the poll budget.
    #[error("timed out waiting for lock on volume '{0}'")]
    LockTimeout(String),

    /// Could not acquire an operation-class semaphore permit in time.
    #[error("timed out waiting for '{0:?}' semaphore permit")]
    SemaphoreTimeout(OperationClass),

    /// A semaphore permit was released that was never recorded as held.
    /// Treated as a hard error rather than a logged-and-ignored condition,
    /// since it signals a bookkeeping bug in the lock manager itself.
    #[error("attempted to release a '{0:?}' permit that was not held")]
    MissingPermit(OperationClass),

    /// No candidate device ever materialized after all rescans. Retriable.
    #[error("no device found for volume '{0}'")]
    VolumeNotFound(String),

    /// A candidate device appeared but failed WWN verification.
    #[error("device '{device}' does not match volume identifier '{id}'")]
    VolumeDeviceNotFound { device: String, id: String },

    /// A DM multipath map exists but has fewer members than expected.
    #[error("multipath map for '{id}' has {found}/{expected} paths")]
    VolumePathIncomplete {
        id: String,
        found: usize,
        expected: usize,
    },

    /// More than one virtual device was discovered for one identifier.
    #[error("volume '{0}' resolves to more than one device on this host")]
    DeviceNotUnique(String),

    /// Multipath member devices disagree on their WWN.
    #[error("inconsistent WWN among members of '{0}'")]
    InconsistentWWN(String),

    /// Requested multipath type has no implementation.
    #[error("unsupported multipath type: {0}")]
    UnsupportedMultiPathType(String),

    /// Requested filesystem type has no implementation.
    #[error("unsupported filesystem type: {0}")]
    UnsupportedFsType(String),

    /// A host tool exited non-zero (or timed out) and the caller could not
    /// treat that as an idempotent no-op.
    #[error("host command failed: {0}")]
    HostCommandFailed(String),

    /// A subprocess invocation exceeded its configured deadline.
    #[error("timeout (after {0:?})")]
    Timeout(std::time::Duration),

    /// Malformed descriptor, sysfs content, or vendor CLI output.
    #[error("failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    /// A `ConnectionDescriptor` failed its own shape invariants.
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation's cancellation token fired before the pipeline
    /// reached a terminal state; any in-flight `HostExec` call is killed
    /// as its future is dropped.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// The three named operation classes sharing the process-wide semaphore
/// triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Connect,
    Disconnect,
    Extend,
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationClass::Connect => write!(f, "connect"),
            OperationClass::Disconnect => write!(f, "disconnect"),
            OperationClass::Extend => write!(f, "extend"),
        }
    }
}
