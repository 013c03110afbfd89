//! Spawning the hypervisor process and waiting for its control socket.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::security::HypervisorSeccomp;

/// Spawn a Firecracker process bound to `api_socket`.
///
/// A seccomp allowlist is installed in the child between fork and exec, so
/// it constrains the hypervisor without affecting the manager. The child is
/// killed if the returned handle is dropped without an explicit wait.
pub fn spawn_hypervisor(firecracker_bin: &Path, api_socket: &Path) -> Result<tokio::process::Child> {
    let mut command = Command::new(firecracker_bin);
    command
        .arg("--api-sock")
        .arg(api_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: pre_exec runs after fork and before exec in the child; the
    // seccomp install only makes async-signal-safe prctl/seccomp syscalls.
    unsafe {
        command.pre_exec(|| HypervisorSeccomp::with_hypervisor_defaults().apply());
    }

    let child = command.spawn()?;
    debug!(pid = child.id(), socket = %api_socket.display(), "hypervisor spawned");
    Ok(child)
}

/// Poll until the control socket appears on disk.
pub async fn wait_for_api_socket(
    socket_path: &Path,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if socket_path.exists() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout {
                what: "hypervisor api socket",
                timeout,
            });
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn existing_socket_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        std::fs::write(&path, b"").unwrap();
        wait_for_api_socket(&path, Duration::from_millis(10), Duration::from_millis(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.sock");
        let err = wait_for_api_socket(&path, Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn socket_appearing_mid_wait_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                std::fs::write(&path, b"").unwrap();
            })
        };
        wait_for_api_socket(&path, Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        writer.await.unwrap();
    }
}
