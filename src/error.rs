//! Error taxonomy for the lifecycle manager.
//!
//! Every operation surfaces one of these kinds; nothing is reported as a bare
//! string or a raw exit code. `AlreadyRunning` is deliberately absent:
//! starting a VM that is already running is benign and returns the existing
//! descriptor instead of failing.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::RpcError;

/// Errors surfaced by the lifecycle manager and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// A guest RPC was issued for a user with no active VM.
    #[error("no running VM for user {user_id}")]
    NotRunning { user_id: String },

    /// The VM failed to boot after the automatic re-clone retry.
    #[error("VM boot failed for user {user_id}: {reason}")]
    BootFailure { user_id: String, reason: String },

    /// A bounded wait elapsed. For guest RPCs the VM stays running; for
    /// boot waits the record transitions to `Failed`.
    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },

    /// Snapshot upload or download failed. Reported to the caller but never
    /// allowed to block VM teardown.
    #[error("snapshot {op} failed for user {user_id}: {message}")]
    SnapshotFailure {
        user_id: String,
        op: &'static str,
        message: String,
    },

    /// The host cannot allocate a device, lease, or VM slot. Surfaced
    /// immediately, no retry.
    #[error("resource exhausted: {what}")]
    ResourceExhausted { what: String },

    /// The hypervisor control API rejected a request.
    #[error("hypervisor API {endpoint}: {message}")]
    Hypervisor { endpoint: String, message: String },

    /// Guest RPC channel failure (connect, handshake, framing, codec, or a
    /// guest-reported error).
    #[error("guest rpc: {0}")]
    Rpc(#[from] RpcError),

    /// Startup-time misconfiguration (missing kernel image, bad paths).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable label for the error counter metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotRunning { .. } => "not_running",
            Error::BootFailure { .. } => "boot_failure",
            Error::Timeout { .. } => "timeout",
            Error::SnapshotFailure { .. } => "snapshot_failure",
            Error::ResourceExhausted { .. } => "resource_exhausted",
            Error::Hypervisor { .. } => "hypervisor",
            Error::Rpc(_) => "rpc",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
