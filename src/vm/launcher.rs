//! Firecracker launch sequence.
//!
//! Boots one VM end to end: spawn the hypervisor, wait for its control
//! socket, push the machine configuration, start the instance, then poll
//! the guest agent until it answers. A failure anywhere tears the child
//! down before the error propagates.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use super::backend::{LaunchSpec, VmBackend};
use super::firecracker::FirecrackerClient;
use super::handle::FirecrackerVm;
use super::lifecycle::{spawn_hypervisor, wait_for_api_socket};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::rpc::client::GuestClient;

/// Serial console on, reboot-on-panic off. The guest agent is the init
/// payload, so nothing else needs to come up.
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

pub struct FirecrackerLauncher {
    config: ManagerConfig,
    /// Guest CIDs 0-2 are reserved by the vsock spec.
    next_cid: AtomicU32,
}

impl FirecrackerLauncher {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            next_cid: AtomicU32::new(3),
        }
    }

    fn run_dir(&self) -> PathBuf {
        self.config.data_dir.join("run")
    }

    async fn configure_and_boot(
        &self,
        spec: &LaunchSpec,
        api_socket: &PathBuf,
        vsock_uds: &PathBuf,
        guest_cid: u32,
    ) -> Result<FirecrackerClient> {
        wait_for_api_socket(
            api_socket,
            self.config.boot_timeout,
            self.config.health_poll_interval,
        )
        .await?;

        let client = FirecrackerClient::new(api_socket.display().to_string());
        client
            .machine_config(self.config.vcpu_count, self.config.mem_size_mib)
            .await?;
        client
            .boot_source(self.config.kernel_path.display().to_string(), BOOT_ARGS)
            .await?;
        client
            .add_drive(
                "rootfs",
                spec.rootfs_path.display().to_string(),
                true,
                false,
            )
            .await?;
        client
            .configure_vsock(guest_cid, vsock_uds.display().to_string())
            .await?;
        if let Some(lease) = &spec.network {
            client
                .add_network_interface("eth0", &lease.guest_mac, &lease.tap_device)
                .await?;
        }
        client.start().await?;
        Ok(client)
    }

    /// Poll the agent until it answers or the boot deadline passes.
    async fn wait_for_guest(&self, guest: &GuestClient) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.boot_timeout;
        loop {
            if guest.ping().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: "guest readiness",
                    timeout: self.config.boot_timeout,
                });
            }
            tokio::time::sleep(self.config.health_poll_interval).await;
        }
    }
}

#[async_trait]
impl VmBackend for FirecrackerLauncher {
    type Instance = FirecrackerVm;

    async fn launch(&self, spec: LaunchSpec) -> Result<FirecrackerVm> {
        let run_dir = self.run_dir();
        tokio::fs::create_dir_all(&run_dir).await?;
        let api_socket = run_dir.join(format!("{}.api.sock", spec.vm_id));
        let vsock_uds = run_dir.join(format!("{}.vsock", spec.vm_id));
        // Firecracker refuses to bind over leftovers from a crashed run.
        for stale in [&api_socket, &vsock_uds] {
            match tokio::fs::remove_file(stale).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let guest_cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let child = spawn_hypervisor(&self.config.firecracker_bin, &api_socket)?;
        debug!(vm_id = %spec.vm_id, guest_cid, "hypervisor spawned, configuring");

        let api_client = match self
            .configure_and_boot(&spec, &api_socket, &vsock_uds, guest_cid)
            .await
        {
            Ok(client) => client,
            Err(e) => {
                teardown(child, &api_socket, &vsock_uds).await;
                return Err(e);
            }
        };

        let guest = GuestClient::new(&vsock_uds, self.config.vsock_port);
        if let Err(e) = self.wait_for_guest(&guest).await {
            teardown(child, &api_socket, &vsock_uds).await;
            return Err(e);
        }

        info!(vm_id = %spec.vm_id, user_id = %spec.user_id, "vm booted");
        Ok(FirecrackerVm::new(
            spec.vm_id,
            child,
            api_client,
            guest,
            api_socket,
            vsock_uds,
            self.config.rpc_timeout,
        ))
    }
}

async fn teardown(mut child: tokio::process::Child, api_socket: &PathBuf, vsock_uds: &PathBuf) {
    let _ = child.start_kill();
    let _ = child.wait().await;
    for socket in [api_socket, vsock_uds] {
        let _ = tokio::fs::remove_file(socket).await;
    }
}
