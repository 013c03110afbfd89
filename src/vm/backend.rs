//! Backend seam between the lifecycle manager and the hypervisor.
//!
//! The manager drives everything through these traits so integration tests
//! can substitute an in-process fake for Firecracker.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::net::NetworkLease;
use crate::rpc::protocol::FileEntry;

pub use crate::rpc::client::ExecOutput;

/// Everything a backend needs to boot one VM.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub user_id: String,
    pub vm_id: String,
    /// Writable rootfs device, already materialized by the manager.
    pub rootfs_path: PathBuf,
    /// Network assignment, when networking is enabled.
    pub network: Option<NetworkLease>,
}

/// A booted VM with a reachable guest agent.
#[async_trait]
pub trait VmInstance: Send + Sync + 'static {
    fn vm_id(&self) -> &str;

    /// Liveness probe against the guest agent.
    async fn ping(&self) -> Result<()>;

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;

    async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<u64>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Quiesce the guest so the rootfs device is safe to copy.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Terminate the VM and release its host-side resources. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Launches VMs. One backend serves the whole manager.
#[async_trait]
pub trait VmBackend: Send + Sync + 'static {
    type Instance: VmInstance;

    /// Boot a VM and return once the guest agent answers its first probe.
    async fn launch(&self, spec: LaunchSpec) -> Result<Self::Instance>;
}

#[async_trait]
impl<B: VmBackend> VmBackend for std::sync::Arc<B> {
    type Instance = B::Instance;

    async fn launch(&self, spec: LaunchSpec) -> Result<Self::Instance> {
        (**self).launch(spec).await
    }
}
