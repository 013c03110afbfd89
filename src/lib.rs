//! Burrow - per-user microVM lifecycle and persistence manager
//!
//! Runs untrusted code in Firecracker microVMs, one VM per user, with the
//! user's root filesystem persisted between sessions as versioned snapshots.
//!
//! # Modules
//!
//! - `manager` - the lifecycle manager and user → VM registry
//! - `vm` - Firecracker launch sequence, control API client, backend traits
//! - `rpc` - framed JSON guest RPC over vsock
//! - `snapshot` - durable, versioned rootfs snapshot store
//! - `image` - immutable kernel and golden rootfs images
//! - `net` - network lease pool for VM tap devices
//! - `security` - seccomp allowlist for spawned hypervisors
//! - `metrics` - Prometheus metrics
//!
//! # Quick Start
//!
//! ```ignore
//! use burrow::{FirecrackerLauncher, ImageStore, LifecycleManager, ManagerConfig, SnapshotStore};
//!
//! let config = ManagerConfig::from_env();
//! let images = ImageStore::open(config.kernel_path.clone(), config.base_rootfs_path.clone())?;
//! let snapshots = SnapshotStore::open(config.snapshot_dir.clone())?;
//! let launcher = FirecrackerLauncher::new(config.clone());
//! let manager = LifecycleManager::new(launcher, config, images, snapshots);
//!
//! let vm = manager.start("alice").await?;
//! let out = manager.execute("alice", "echo hello", Duration::from_secs(30)).await?;
//! ```

pub mod config;
pub mod error;
pub mod image;
pub mod manager;
pub mod metrics;
pub mod net;
pub mod rpc;
pub mod security;
pub mod snapshot;
pub mod vm;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use image::ImageStore;
pub use manager::{LifecycleManager, StopOutcome, UserStatus, VmDescriptor, VmState};
pub use snapshot::{SnapshotRecord, SnapshotStore};
pub use vm::{ExecOutput, FirecrackerLauncher, LaunchSpec, VmBackend, VmInstance};
