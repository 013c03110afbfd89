//! Lifecycle manager: the sole owner of the user → VM registry.
//!
//! Concurrency model: operations for different users never block one
//! another. Start, Stop, Save, and idle eviction for the same user are
//! serialized by a per-user async lock. Guest RPCs skip that lock and read
//! the published record under a brief std mutex instead, so they run
//! concurrently with each other and fail fast with `NotRunning` once a stop
//! is in flight. The std mutex is never held across an await.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::metrics;
use crate::net::{LeaseGuard, NetworkLeasePool};
use crate::rpc::protocol::FileEntry;
use crate::snapshot::{SnapshotRecord, SnapshotStore};
use crate::vm::backend::{ExecOutput, LaunchSpec, VmBackend, VmInstance};

/// Registry states for one user's VM.
#[derive(Debug, Clone, PartialEq)]
pub enum VmState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

/// What `start` returns to the caller.
#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub user_id: String,
    pub vm_id: String,
    pub restored_from_snapshot: bool,
    /// True when the VM was already running and the call was a reconnect.
    pub reused: bool,
}

/// What `stop` returns. Snapshot failures are carried here instead of
/// failing the call, because teardown must finish regardless.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub was_running: bool,
    pub snapshot: Option<SnapshotRecord>,
    pub snapshot_error: Option<String>,
}

/// Point-in-time view of a user's registry entry.
#[derive(Debug, Clone)]
pub struct UserStatus {
    pub user_id: String,
    pub state: VmState,
    pub vm_id: Option<String>,
    pub uptime: Option<Duration>,
    pub idle: Option<Duration>,
    pub snapshot: Option<SnapshotRecord>,
}

struct ActiveVm<I> {
    vm_id: String,
    instance: I,
    booted_at: std::time::Instant,
    /// Milliseconds since the Unix epoch of the last guest RPC.
    last_activity: AtomicU64,
}

impl<I> ActiveVm<I> {
    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }
}

struct VmRecord<I> {
    active: Arc<ActiveVm<I>>,
    rootfs_path: std::path::PathBuf,
    restored_from_snapshot: bool,
    // Held for the VM's lifetime; dropping it returns the slot.
    #[allow(dead_code)]
    lease: Option<LeaseGuard>,
}

struct UserShared<I> {
    state: VmState,
    record: Option<VmRecord<I>>,
}

impl<I> Default for UserShared<I> {
    fn default() -> Self {
        Self {
            state: VmState::Stopped,
            record: None,
        }
    }
}

struct UserEntry<I> {
    op_lock: AsyncMutex<()>,
    shared: StdMutex<UserShared<I>>,
}

impl<I> Default for UserEntry<I> {
    fn default() -> Self {
        Self {
            op_lock: AsyncMutex::new(()),
            shared: StdMutex::new(UserShared::default()),
        }
    }
}

pub struct LifecycleManager<B: VmBackend> {
    backend: B,
    config: ManagerConfig,
    images: ImageStore,
    snapshots: SnapshotStore,
    leases: Arc<NetworkLeasePool>,
    registry: DashMap<String, Arc<UserEntry<B::Instance>>>,
    live_count: AtomicUsize,
}

impl<B: VmBackend> LifecycleManager<B> {
    pub fn new(
        backend: B,
        config: ManagerConfig,
        images: ImageStore,
        snapshots: SnapshotStore,
    ) -> Arc<Self> {
        let leases = NetworkLeasePool::new(config.max_network_leases);
        Arc::new(Self {
            backend,
            config,
            images,
            snapshots,
            leases,
            registry: DashMap::new(),
            live_count: AtomicUsize::new(0),
        })
    }

    fn entry(&self, user_id: &str) -> Arc<UserEntry<B::Instance>> {
        self.registry
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Existing entry only; operations on users who never started a VM must
    /// not grow the registry.
    fn lookup(&self, user_id: &str) -> Option<Arc<UserEntry<B::Instance>>> {
        self.registry.get(user_id).map(|e| e.value().clone())
    }

    /// Published record for a running VM, or `NotRunning`. Used by the RPC
    /// paths so they never wait on the per-user op lock.
    fn active(&self, user_id: &str) -> Result<Arc<ActiveVm<B::Instance>>> {
        let entry = self.lookup(user_id).ok_or_else(|| Error::NotRunning {
            user_id: user_id.to_string(),
        })?;
        let shared = entry.shared.lock().unwrap();
        match (&shared.state, &shared.record) {
            (VmState::Running, Some(record)) => Ok(record.active.clone()),
            _ => Err(Error::NotRunning {
                user_id: user_id.to_string(),
            }),
        }
    }

    /// Start (or reconnect to) the user's VM.
    pub async fn start(&self, user_id: &str) -> Result<VmDescriptor> {
        observe(self.start_inner(user_id).await)
    }

    async fn start_inner(&self, user_id: &str) -> Result<VmDescriptor> {
        let entry = self.entry(user_id);
        let _op = entry.op_lock.lock().await;

        // Reconnect path: already running is benign.
        {
            let shared = entry.shared.lock().unwrap();
            if shared.state == VmState::Running {
                let record = shared.record.as_ref().ok_or_else(|| Error::NotRunning {
                    user_id: user_id.to_string(),
                })?;
                debug!(user_id, vm_id = %record.active.vm_id, "start is a reconnect");
                return Ok(VmDescriptor {
                    user_id: user_id.to_string(),
                    vm_id: record.active.vm_id.clone(),
                    restored_from_snapshot: record.restored_from_snapshot,
                    reused: true,
                });
            }
        }

        self.reserve_slot()?;
        entry.shared.lock().unwrap().state = VmState::Provisioning;

        match self.provision(user_id).await {
            Ok((record, descriptor, boot_secs)) => {
                {
                    let mut shared = entry.shared.lock().unwrap();
                    shared.record = Some(record);
                    shared.state = VmState::Running;
                }
                metrics::VM_STARTS_TOTAL.inc();
                metrics::VM_BOOT_DURATION.observe(boot_secs);
                metrics::VMS_RUNNING.set(self.live_count.load(Ordering::Relaxed) as i64);
                info!(user_id, vm_id = %descriptor.vm_id,
                    restored = descriptor.restored_from_snapshot, "vm running");
                Ok(descriptor)
            }
            Err(e) => {
                self.release_slot();
                entry.shared.lock().unwrap().state = VmState::Failed(e.to_string());
                error!(user_id, error = %e, "vm start failed");
                // Allocation failures keep their own kind; everything else
                // on this path is a boot failure.
                match e {
                    Error::ResourceExhausted { .. } => Err(e),
                    e => Err(Error::BootFailure {
                        user_id: user_id.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Materialize a rootfs and boot, retrying once with a fresh golden
    /// clone in case a corrupt snapshot caused the failure.
    async fn provision(
        &self,
        user_id: &str,
    ) -> Result<(VmRecord<B::Instance>, VmDescriptor, f64)> {
        let rootfs_path = self
            .config
            .data_dir
            .join("users")
            .join(user_id)
            .join("rootfs.img");

        let restored = match self.snapshots.load(user_id, &rootfs_path).await {
            Ok(Some(record)) => {
                debug!(user_id, version = record.snapshot_version, "rootfs restored");
                true
            }
            Ok(None) => {
                self.images.clone_rootfs(&rootfs_path).await?;
                false
            }
            Err(e) => {
                warn!(user_id, error = %e, "snapshot restore failed, cloning golden");
                self.images.clone_rootfs(&rootfs_path).await?;
                false
            }
        };

        let lease = if self.config.enable_network {
            let guard = self.leases.acquire().ok_or_else(|| Error::ResourceExhausted {
                what: "network leases".to_string(),
            })?;
            Some(guard)
        } else {
            None
        };

        let boot_started = std::time::Instant::now();
        let mut restored_from_snapshot = restored;
        let spec = LaunchSpec {
            user_id: user_id.to_string(),
            vm_id: Uuid::now_v7().to_string(),
            rootfs_path: rootfs_path.clone(),
            network: lease.as_ref().map(|g| g.lease().clone()),
        };

        let instance = match self.backend.launch(spec.clone()).await {
            Ok(instance) => instance,
            Err(first) => {
                warn!(user_id, error = %first, "boot failed, retrying with golden clone");
                metrics::VM_BOOT_RETRIES_TOTAL.inc();
                self.images.clone_rootfs(&rootfs_path).await?;
                restored_from_snapshot = false;
                let retry_spec = LaunchSpec {
                    vm_id: Uuid::now_v7().to_string(),
                    ..spec
                };
                self.backend.launch(retry_spec).await?
            }
        };

        let active = Arc::new(ActiveVm {
            vm_id: instance.vm_id().to_string(),
            instance,
            booted_at: std::time::Instant::now(),
            last_activity: AtomicU64::new(now_millis()),
        });
        let descriptor = VmDescriptor {
            user_id: user_id.to_string(),
            vm_id: active.vm_id.clone(),
            restored_from_snapshot,
            reused: false,
        };
        let record = VmRecord {
            active,
            rootfs_path,
            restored_from_snapshot,
            lease,
        };
        Ok((record, descriptor, boot_started.elapsed().as_secs_f64()))
    }

    /// Run a shell command in the user's VM. A guest-side deadline overrun
    /// surfaces as `Timeout` and leaves the VM running and reusable.
    pub async fn execute(
        &self,
        user_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        observe(async {
            let active = self.active(user_id)?;
            active.touch();
            let output = active.instance.execute(command, timeout).await?;
            active.touch();
            if output.timed_out {
                return Err(Error::Timeout {
                    what: "guest command",
                    timeout,
                });
            }
            Ok(output)
        }
        .await)
    }

    pub async fn write_file(&self, user_id: &str, path: &str, contents: Vec<u8>) -> Result<u64> {
        observe(async {
            let active = self.active(user_id)?;
            active.touch();
            active.instance.write_file(path, contents).await
        }
        .await)
    }

    pub async fn read_file(&self, user_id: &str, path: &str) -> Result<Vec<u8>> {
        observe(async {
            let active = self.active(user_id)?;
            active.touch();
            active.instance.read_file(path).await
        }
        .await)
    }

    pub async fn list_files(&self, user_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        observe(async {
            let active = self.active(user_id)?;
            active.touch();
            active.instance.list_files(path).await
        }
        .await)
    }

    /// Snapshot the running VM's rootfs without stopping it. The guest is
    /// paused around the upload so the device is quiescent, then resumed.
    pub async fn save(&self, user_id: &str) -> Result<SnapshotRecord> {
        observe(self.save_inner(user_id).await)
    }

    async fn save_inner(&self, user_id: &str) -> Result<SnapshotRecord> {
        let entry = self.lookup(user_id).ok_or_else(|| Error::NotRunning {
            user_id: user_id.to_string(),
        })?;
        let _op = entry.op_lock.lock().await;

        let (active, rootfs_path) = {
            let shared = entry.shared.lock().unwrap();
            match (&shared.state, &shared.record) {
                (VmState::Running, Some(record)) => {
                    (record.active.clone(), record.rootfs_path.clone())
                }
                _ => {
                    return Err(Error::NotRunning {
                        user_id: user_id.to_string(),
                    })
                }
            }
        };

        active.instance.pause().await?;
        let saved = self.snapshots.save(user_id, &rootfs_path).await;
        let resumed = active.instance.resume().await;

        // A VM that failed to resume is frozen; it must not stay published
        // as Running, whatever the upload did.
        if let Err(e) = &resumed {
            error!(user_id, error = %e, "resume after snapshot failed");
            entry.shared.lock().unwrap().state = VmState::Failed(e.to_string());
        }
        let record = saved?;
        resumed?;
        active.touch();
        info!(user_id, version = record.snapshot_version, "snapshot saved");
        Ok(record)
    }

    /// Stop the user's VM. With `save`, the rootfs is uploaded first; an
    /// upload failure is reported in the outcome but never blocks teardown.
    /// Stopping a user with no running VM is a no-op.
    pub async fn stop(&self, user_id: &str, save: bool) -> Result<StopOutcome> {
        let entry = match self.lookup(user_id) {
            Some(entry) => entry,
            None => {
                return Ok(StopOutcome {
                    was_running: false,
                    snapshot: None,
                    snapshot_error: None,
                })
            }
        };
        let _op = entry.op_lock.lock().await;
        observe(self.stop_locked(user_id, entry.as_ref(), save).await)
    }

    async fn stop_locked(
        &self,
        user_id: &str,
        entry: &UserEntry<B::Instance>,
        save: bool,
    ) -> Result<StopOutcome> {
        let record = {
            let mut shared = entry.shared.lock().unwrap();
            match shared.record.take() {
                Some(record) => {
                    // New RPCs now fail fast with NotRunning.
                    shared.state = VmState::Stopping;
                    record
                }
                None => {
                    return Ok(StopOutcome {
                        was_running: false,
                        snapshot: None,
                        snapshot_error: None,
                    })
                }
            }
        };

        let mut snapshot = None;
        let mut snapshot_error = None;
        if save {
            if let Err(e) = record.active.instance.pause().await {
                warn!(user_id, error = %e, "pause before save failed");
            }
            match self.snapshots.save(user_id, &record.rootfs_path).await {
                Ok(saved) => {
                    info!(user_id, version = saved.snapshot_version, "snapshot saved on stop");
                    snapshot = Some(saved);
                }
                Err(e) => {
                    error!(user_id, error = %e, "snapshot save failed, tearing down anyway");
                    metrics::ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
                    snapshot_error = Some(e.to_string());
                }
            }
        }

        if let Err(e) = record.active.instance.shutdown().await {
            warn!(user_id, error = %e, "vm shutdown reported an error");
        }
        if let Err(e) = tokio::fs::remove_file(&record.rootfs_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(user_id, error = %e, "rootfs cleanup failed");
            }
        }
        drop(record); // releases the network lease

        entry.shared.lock().unwrap().state = VmState::Stopped;
        self.release_slot();
        metrics::VMS_RUNNING.set(self.live_count.load(Ordering::Relaxed) as i64);
        info!(user_id, save, "vm stopped");

        Ok(StopOutcome {
            was_running: true,
            snapshot,
            snapshot_error,
        })
    }

    /// Registry state plus the durable snapshot pointer for one user.
    pub async fn status(&self, user_id: &str) -> Result<UserStatus> {
        let (state, vm_id, uptime, idle) = match self.registry.get(user_id) {
            Some(entry) => {
                let shared = entry.shared.lock().unwrap();
                let vm_id = shared.record.as_ref().map(|r| r.active.vm_id.clone());
                let uptime = shared.record.as_ref().map(|r| r.active.booted_at.elapsed());
                let idle = shared.record.as_ref().map(|r| r.active.idle_for());
                (shared.state.clone(), vm_id, uptime, idle)
            }
            None => (VmState::Stopped, None, None, None),
        };
        let snapshot = self.snapshots.current(user_id).await?;
        Ok(UserStatus {
            user_id: user_id.to_string(),
            state,
            vm_id,
            uptime,
            idle,
            snapshot,
        })
    }

    /// One pass of idle eviction: stop (with save) every VM idle past the
    /// threshold. Re-checks idleness under the per-user lock, so a user
    /// request racing the sweep wins.
    pub async fn sweep_idle(&self) {
        let threshold = self.config.idle_timeout;
        let candidates: Vec<String> = self
            .registry
            .iter()
            .filter(|item| {
                let shared = item.value().shared.lock().unwrap();
                shared.state == VmState::Running
                    && shared
                        .record
                        .as_ref()
                        .is_some_and(|r| r.active.idle_for() >= threshold)
            })
            .map(|item| item.key().clone())
            .collect();

        for user_id in candidates {
            let entry = self.entry(&user_id);
            let _op = entry.op_lock.lock().await;
            let still_idle = {
                let shared = entry.shared.lock().unwrap();
                shared.state == VmState::Running
                    && shared
                        .record
                        .as_ref()
                        .is_some_and(|r| r.active.idle_for() >= threshold)
            };
            if !still_idle {
                continue;
            }
            info!(user_id = %user_id, "evicting idle vm");
            match self.stop_locked(&user_id, entry.as_ref(), true).await {
                Ok(outcome) if outcome.was_running => metrics::IDLE_EVICTIONS_TOTAL.inc(),
                Ok(_) => {}
                Err(e) => error!(user_id = %user_id, error = %e, "idle eviction failed"),
            }
        }
    }

    /// Background idle sweeper. Aborted by dropping the handle or at drain.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_idle().await;
            }
        })
    }

    /// Stop every running VM with save=true. Called on process shutdown.
    pub async fn drain(&self) {
        let users: Vec<String> = self.registry.iter().map(|i| i.key().clone()).collect();
        info!(vms = users.len(), "draining");
        for user_id in users {
            if let Err(e) = self.stop(&user_id, true).await {
                error!(user_id = %user_id, error = %e, "drain stop failed");
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.live_count.load(Ordering::Relaxed)
    }

    /// Number of users the registry has ever tracked (running or not).
    pub fn tracked_users(&self) -> usize {
        self.registry.len()
    }

    fn reserve_slot(&self) -> Result<()> {
        let max = self.config.max_vms;
        self.live_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::ResourceExhausted {
                what: format!("vm slots ({max} max)"),
            })
    }

    fn release_slot(&self) {
        self.live_count.fetch_sub(1, Ordering::SeqCst);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

fn observe<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        metrics::ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
    }
    result
}
