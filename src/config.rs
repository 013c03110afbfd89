//! Manager configuration.
//!
//! All knobs have defaults suitable for a single-host deployment and can be
//! overridden from the environment (the deployment scripts only speak env
//! vars).

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the lifecycle manager and the Firecracker launcher.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Path to the Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Path to the immutable kernel image.
    pub kernel_path: PathBuf,
    /// Path to the golden root filesystem image.
    pub base_rootfs_path: PathBuf,
    /// Runtime directory for per-user rootfs devices and control sockets.
    pub data_dir: PathBuf,
    /// Root directory of the snapshot object store.
    pub snapshot_dir: PathBuf,
    /// Vsock port the guest agent listens on.
    pub vsock_port: u32,
    /// vCPUs per VM.
    pub vcpu_count: u32,
    /// Guest memory per VM in MiB.
    pub mem_size_mib: u32,
    /// Upper bound on the boot wait (process spawn through guest readiness).
    pub boot_timeout: Duration,
    /// Interval between guest health probes during boot.
    pub health_poll_interval: Duration,
    /// Default deadline for file RPCs; `execute` takes a caller deadline.
    pub rpc_timeout: Duration,
    /// A VM idle longer than this is stopped (with save) by the sweeper.
    pub idle_timeout: Duration,
    /// How often the idle sweeper runs.
    pub sweep_interval: Duration,
    /// Maximum concurrently live VMs on this host.
    pub max_vms: usize,
    /// Attach a network interface to each VM from the lease pool.
    pub enable_network: bool,
    /// Size of the network lease pool (at most 250).
    pub max_network_leases: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("/usr/bin/firecracker"),
            kernel_path: PathBuf::from("/opt/burrow/vmlinux"),
            base_rootfs_path: PathBuf::from("/opt/burrow/rootfs.ext4"),
            data_dir: PathBuf::from("/var/lib/burrow/vms"),
            snapshot_dir: PathBuf::from("/var/lib/burrow/snapshots"),
            vsock_port: 6000,
            vcpu_count: 1,
            mem_size_mib: 512,
            boot_timeout: Duration::from_secs(10),
            health_poll_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(60),
            max_vms: 32,
            enable_network: false,
            max_network_leases: 64,
        }
    }
}

impl ManagerConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset. Unparseable values fall back too rather than failing
    /// the daemon at boot.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            firecracker_bin: env_path("FIRECRACKER_BIN", d.firecracker_bin),
            kernel_path: env_path("KERNEL_PATH", d.kernel_path),
            base_rootfs_path: env_path("BASE_ROOTFS_PATH", d.base_rootfs_path),
            data_dir: env_path("BURROW_DATA_DIR", d.data_dir),
            snapshot_dir: env_path("BURROW_SNAPSHOT_DIR", d.snapshot_dir),
            vsock_port: env_parse("BURROW_VSOCK_PORT", d.vsock_port),
            vcpu_count: env_parse("BURROW_VCPU_COUNT", d.vcpu_count),
            mem_size_mib: env_parse("BURROW_MEM_SIZE_MIB", d.mem_size_mib),
            boot_timeout: env_secs("BURROW_BOOT_TIMEOUT_SECS", d.boot_timeout),
            health_poll_interval: d.health_poll_interval,
            rpc_timeout: env_secs("BURROW_RPC_TIMEOUT_SECS", d.rpc_timeout),
            idle_timeout: env_secs("BURROW_IDLE_TIMEOUT_SECS", d.idle_timeout),
            sweep_interval: env_secs("BURROW_SWEEP_INTERVAL_SECS", d.sweep_interval),
            max_vms: env_parse("BURROW_MAX_VMS", d.max_vms),
            enable_network: env_parse("BURROW_ENABLE_NETWORK", d.enable_network),
            max_network_leases: env_parse("BURROW_MAX_NETWORK_LEASES", d.max_network_leases),
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
