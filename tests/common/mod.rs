//! In-process fake hypervisor backend for lifecycle tests.
//!
//! `FakeVm` keeps its guest filesystem as an in-memory map and flushes it to
//! the rootfs device file as JSON when paused, so snapshot uploads capture
//! exactly what a quiesced guest would have on disk. Booting parses the
//! device back into the map, which makes save/restore round trips
//! byte-accurate without a real hypervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use burrow::error::{Error, Result};
use burrow::rpc::protocol::FileEntry;
use burrow::vm::backend::{ExecOutput, LaunchSpec, VmBackend, VmInstance};
use burrow::{ImageStore, LifecycleManager, ManagerConfig, SnapshotStore};

pub struct FakeVm {
    vm_id: String,
    rootfs_path: PathBuf,
    files: Mutex<HashMap<String, Vec<u8>>>,
    shut_down: AtomicBool,
    fail_resume: Arc<AtomicBool>,
}

impl FakeVm {
    fn check_up(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(Self::guest_err("vm is shut down"))
        } else {
            Ok(())
        }
    }
}

impl FakeVm {
    fn boot(spec: &LaunchSpec, fail_resume: Arc<AtomicBool>) -> std::io::Result<Self> {
        let device = std::fs::read(&spec.rootfs_path)?;
        // A golden image is opaque bytes; a snapshot is our JSON flush.
        let files = serde_json::from_slice(&device).unwrap_or_default();
        Ok(Self {
            vm_id: spec.vm_id.clone(),
            rootfs_path: spec.rootfs_path.clone(),
            files: Mutex::new(files),
            shut_down: AtomicBool::new(false),
            fail_resume,
        })
    }

    fn guest_err(message: &str) -> Error {
        Error::Rpc(burrow::rpc::RpcError::Guest(message.to_string()))
    }
}

#[async_trait]
impl VmInstance for FakeVm {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.check_up()?;
        if command == "hang" {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "command killed at deadline".to_string(),
                exit_code: -1,
                timed_out: true,
            });
        }
        Ok(ExecOutput {
            stdout: format!("{command}\n"),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        })
    }

    async fn write_file(&self, path: &str, contents: Vec<u8>) -> Result<u64> {
        self.check_up()?;
        let bytes = contents.len() as u64;
        self.files.lock().unwrap().insert(path.to_string(), contents);
        Ok(bytes)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.check_up()?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::guest_err(&format!("no such file: {path}")))
    }

    // Mirrors the guest agent's directory listing: entries are the direct
    // children of `path`, named by their final component, with a dir entry
    // standing in for anything nested deeper.
    async fn list_files(&self, path: &str) -> Result<Vec<FileEntry>> {
        self.check_up()?;
        let prefix = path.trim_matches('/');
        let files = self.files.lock().unwrap();
        let mut entries: Vec<FileEntry> = Vec::new();
        for (stored, contents) in files.iter() {
            let rest = if prefix.is_empty() {
                stored.as_str()
            } else {
                match stored
                    .strip_prefix(prefix)
                    .and_then(|r| r.strip_prefix('/'))
                {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if !entries.iter().any(|e| e.name == dir && e.is_dir) {
                        entries.push(FileEntry {
                            name: dir.to_string(),
                            size: 0,
                            is_dir: true,
                        });
                    }
                }
                None => entries.push(FileEntry {
                    name: rest.to_string(),
                    size: contents.len() as u64,
                    is_dir: false,
                }),
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn pause(&self) -> Result<()> {
        let snapshot = serde_json::to_vec(&*self.files.lock().unwrap())
            .map_err(|e| Self::guest_err(&e.to_string()))?;
        std::fs::write(&self.rootfs_path, snapshot)?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(Self::guest_err("resume rejected by hypervisor"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBackend {
    /// Total launch attempts, including failed ones.
    pub launches: AtomicUsize,
    /// Number of upcoming launch attempts that should fail.
    pub fail_next: AtomicUsize,
    /// Shared with every launched VM; set to make `resume` fail.
    fail_resume: Arc<AtomicBool>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launches(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_resumes(&self, on: bool) {
        self.fail_resume.store(on, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    type Instance = FakeVm;

    async fn launch(&self, spec: LaunchSpec) -> Result<FakeVm> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let remaining = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(Error::Hypervisor {
                endpoint: "/actions".to_string(),
                message: "injected boot failure".to_string(),
            });
        }
        Ok(FakeVm::boot(&spec, self.fail_resume.clone())?)
    }
}

pub struct Harness {
    pub manager: Arc<LifecycleManager<Arc<FakeBackend>>>,
    pub backend: Arc<FakeBackend>,
    pub config: ManagerConfig,
    _dir: tempfile::TempDir,
}

/// Build a manager over a fake backend and temp-dir stores.
pub fn harness(tune: impl FnOnce(&mut ManagerConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dir.path().join("vmlinux");
    let golden = dir.path().join("rootfs.ext4");
    std::fs::write(&kernel, b"kernel").unwrap();
    std::fs::write(&golden, b"golden image bytes").unwrap();

    let mut config = ManagerConfig {
        kernel_path: kernel,
        base_rootfs_path: golden,
        data_dir: dir.path().join("vms"),
        snapshot_dir: dir.path().join("snapshots"),
        ..ManagerConfig::default()
    };
    tune(&mut config);

    let images = ImageStore::open(
        config.kernel_path.clone(),
        config.base_rootfs_path.clone(),
    )
    .unwrap();
    let snapshots = SnapshotStore::open(config.snapshot_dir.clone()).unwrap();
    let backend = Arc::new(FakeBackend::new());
    let manager = LifecycleManager::new(backend.clone(), config.clone(), images, snapshots);

    Harness {
        manager,
        backend,
        config,
        _dir: dir,
    }
}
