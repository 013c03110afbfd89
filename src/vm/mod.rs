//! Hypervisor integration: launch sequence, control API client, and the
//! backend traits the lifecycle manager is written against.

pub mod backend;
pub mod config;
pub mod firecracker;
pub mod handle;
pub mod launcher;
pub mod lifecycle;

pub use backend::{ExecOutput, LaunchSpec, VmBackend, VmInstance};
pub use firecracker::FirecrackerClient;
pub use handle::FirecrackerVm;
pub use launcher::FirecrackerLauncher;
