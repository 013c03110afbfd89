//! Firecracker API client.
//!
//! Thin typed wrapper over Firecracker's HTTP control API, spoken over the
//! per-VM Unix domain socket.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;
use tracing::trace;

use super::config::*;
use crate::error::{Error, Result};

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Client for one Firecracker process's control socket.
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: String,
}

impl FirecrackerClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    async fn send_request<T: Serialize>(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: &T,
    ) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_string(body).map_err(|e| Error::Hypervisor {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        trace!(%endpoint, %json, "hypervisor api request");

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| Error::Hypervisor {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| Error::Hypervisor {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            let body_bytes = http_body_util::BodyExt::collect(res.into_body())
                .await
                .map(|c| c.to_bytes())
                .unwrap_or_default();
            return Err(Error::Hypervisor {
                endpoint: endpoint.to_string(),
                message: format!("{}: {}", status, String::from_utf8_lossy(&body_bytes)),
            });
        }
        Ok(())
    }

    pub async fn boot_source(
        &self,
        kernel_image_path: impl Into<String>,
        boot_args: impl Into<String>,
    ) -> Result<()> {
        self.send_request(
            hyper::Method::PUT,
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel_image_path.into(),
                boot_args: boot_args.into(),
            },
        )
        .await
    }

    pub async fn add_drive(
        &self,
        drive_id: impl Into<String>,
        path_on_host: impl Into<String>,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        let drive_id = drive_id.into();
        let endpoint = format!("/drives/{}", drive_id);
        self.send_request(
            hyper::Method::PUT,
            &endpoint,
            &Drive {
                drive_id,
                path_on_host: path_on_host.into(),
                is_root_device,
                is_read_only,
            },
        )
        .await
    }

    pub async fn machine_config(&self, vcpu_count: u32, mem_size_mib: u32) -> Result<()> {
        self.send_request(
            hyper::Method::PUT,
            "/machine-config",
            &MachineConfig {
                vcpu_count,
                mem_size_mib,
            },
        )
        .await
    }

    pub async fn configure_vsock(&self, guest_cid: u32, uds_path: impl Into<String>) -> Result<()> {
        self.send_request(
            hyper::Method::PUT,
            "/vsock",
            &Vsock {
                guest_cid,
                uds_path: uds_path.into(),
            },
        )
        .await
    }

    pub async fn add_network_interface(
        &self,
        iface_id: impl Into<String>,
        guest_mac: impl Into<String>,
        host_dev_name: impl Into<String>,
    ) -> Result<()> {
        let iface_id = iface_id.into();
        let endpoint = format!("/network-interfaces/{}", iface_id);
        self.send_request(
            hyper::Method::PUT,
            &endpoint,
            &NetworkInterface {
                iface_id,
                guest_mac: guest_mac.into(),
                host_dev_name: host_dev_name.into(),
            },
        )
        .await
    }

    /// Start the configured instance.
    pub async fn start(&self) -> Result<()> {
        self.send_request(
            hyper::Method::PUT,
            "/actions",
            &Action {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await
    }

    /// Pause vCPUs; used to quiesce the rootfs before a snapshot upload.
    pub async fn pause(&self) -> Result<()> {
        self.send_request(
            hyper::Method::PATCH,
            "/vm",
            &VmStatePatch {
                state: "Paused".to_string(),
            },
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send_request(
            hyper::Method::PATCH,
            "/vm",
            &VmStatePatch {
                state: "Resumed".to_string(),
            },
        )
        .await
    }
}
