//! JSON payloads for the Firecracker control API.

use serde::Serialize;

#[derive(Serialize, Debug, Clone)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Serialize, Debug, Clone)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

/// VM action, e.g. `InstanceStart`.
#[derive(Serialize, Debug, Clone)]
pub struct Action {
    pub action_type: String,
}

/// `PATCH /vm` body; `state` is `Paused` or `Resumed`.
#[derive(Serialize, Debug, Clone)]
pub struct VmStatePatch {
    pub state: String,
}
