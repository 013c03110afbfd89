//! Handle to one live Firecracker VM.
//!
//! Owns the hypervisor child process, the control socket paths, and the
//! guest RPC client. All guest calls are wrapped in bounded waits so a hung
//! guest can never wedge a manager task.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::VmInstance;
use super::firecracker::FirecrackerClient;
use crate::error::{Error, Result};
use crate::rpc::client::{ExecOutput, GuestClient};
use crate::rpc::protocol::FileEntry;

/// Host-side grace added to the guest-enforced execute deadline, so the
/// guest gets the first chance to report a timeout with partial output.
const EXEC_GRACE: Duration = Duration::from_secs(5);

pub struct FirecrackerVm {
    vm_id: String,
    child: Mutex<Option<tokio::process::Child>>,
    api_client: FirecrackerClient,
    guest: GuestClient,
    api_socket: PathBuf,
    vsock_uds: PathBuf,
    rpc_timeout: Duration,
}

impl FirecrackerVm {
    pub fn new(
        vm_id: String,
        child: tokio::process::Child,
        api_client: FirecrackerClient,
        guest: GuestClient,
        api_socket: PathBuf,
        vsock_uds: PathBuf,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            vm_id,
            child: Mutex::new(Some(child)),
            api_client,
            guest,
            api_socket,
            vsock_uds,
            rpc_timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &'static str, timeout: Duration, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, crate::rpc::RpcError>>,
    {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout { what, timeout }),
        }
    }
}

#[async_trait]
impl VmInstance for FirecrackerVm {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("guest ping", self.rpc_timeout, self.guest.ping())
            .await
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self.bounded(
            "guest execute",
            timeout + EXEC_GRACE,
            self.guest.execute(command, timeout_ms),
        )
        .await
    }

    async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<u64> {
        self.bounded(
            "guest write_file",
            self.rpc_timeout,
            self.guest.write_file(path, contents),
        )
        .await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.bounded(
            "guest read_file",
            self.rpc_timeout,
            self.guest.read_file(path),
        )
        .await
    }

    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.bounded(
            "guest list_files",
            self.rpc_timeout,
            self.guest.list_files(path),
        )
        .await
    }

    async fn pause(&self) -> Result<()> {
        self.api_client.pause().await
    }

    async fn resume(&self) -> Result<()> {
        self.api_client.resume().await
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.start_kill() {
                // Already exited on its own; reap below regardless.
                debug!(vm_id = %self.vm_id, error = %e, "hypervisor kill");
            }
            match child.wait().await {
                Ok(status) => debug!(vm_id = %self.vm_id, %status, "hypervisor exited"),
                Err(e) => warn!(vm_id = %self.vm_id, error = %e, "hypervisor reap failed"),
            }
            for socket in [&self.api_socket, &self.vsock_uds] {
                if let Err(e) = tokio::fs::remove_file(socket).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %socket.display(), error = %e, "socket cleanup failed");
                    }
                }
            }
        }
        Ok(())
    }
}
