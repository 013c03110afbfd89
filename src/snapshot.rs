//! Durable, versioned snapshot store for per-user rootfs images.
//!
//! Layout under the store root:
//!
//! ```text
//! users/<user_id>/rootfs.v000001.img   versioned image objects
//! users/<user_id>/current.json         pointer to the current version
//! ```
//!
//! Writes are crash-safe: the image is streamed to a temp file, fsynced, and
//! renamed into its versioned key; only then is the `current.json` pointer
//! rewritten (again via temp + fsync + rename). A reader always sees either
//! the old snapshot or the new one, never a torn object. Superseded versions
//! are pruned after the pointer flip.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

const COPY_CHUNK: usize = 1024 * 1024;

/// Metadata for one durable snapshot; serialized as `current.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRecord {
    pub user_id: String,
    pub snapshot_version: u64,
    pub size_bytes: u64,
    /// Unix seconds.
    pub created_at: u64,
    /// CRC32 of the image bytes.
    pub checksum: u32,
}

/// Filesystem-rooted object store holding one current snapshot per user.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root.join("users"))?;
        Ok(Self { root })
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join("users").join(user_id)
    }

    fn pointer_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("current.json")
    }

    fn object_path(&self, user_id: &str, version: u64) -> PathBuf {
        self.user_dir(user_id)
            .join(format!("rootfs.v{:06}.img", version))
    }

    /// Read the current pointer. `None` means the user has never saved.
    pub async fn current(&self, user_id: &str) -> Result<Option<SnapshotRecord>> {
        match tokio::fs::read(self.pointer_path(user_id)).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes).map_err(|e| {
                    upload_err(user_id, "pointer-read", &e.to_string())
                })?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stream `device` into the store as the next version for `user_id` and
    /// flip the current pointer once the object is durable. The previous
    /// snapshot stays valid and servable until the flip.
    pub async fn save(&self, user_id: &str, device: &Path) -> Result<SnapshotRecord> {
        let timer = crate::metrics::SNAPSHOT_SAVE_DURATION.start_timer();
        let dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| upload_err(user_id, "upload", &e.to_string()))?;

        let version = match self.current(user_id).await? {
            Some(record) => record.snapshot_version + 1,
            None => 1,
        };

        let object = self.object_path(user_id, version);
        let tmp = object.with_extension("img.tmp");
        let (size_bytes, checksum) = copy_with_checksum(device, &tmp)
            .await
            .map_err(|e| upload_err(user_id, "upload", &e.to_string()))?;
        tokio::fs::rename(&tmp, &object)
            .await
            .map_err(|e| upload_err(user_id, "upload", &e.to_string()))?;

        let record = SnapshotRecord {
            user_id: user_id.to_string(),
            snapshot_version: version,
            size_bytes,
            created_at: unix_now(),
            checksum,
        };
        self.write_pointer(&record)
            .await
            .map_err(|e| upload_err(user_id, "pointer-write", &e.to_string()))?;

        // The old object is no longer reachable through the pointer.
        self.prune_older_than(user_id, version).await;

        crate::metrics::SNAPSHOT_BYTES.observe(size_bytes as f64);
        timer.observe_duration();
        Ok(record)
    }

    /// Materialize the current snapshot as a writable device at `dest`.
    /// `None` means no snapshot exists and the caller should clone the
    /// golden image instead.
    pub async fn load(&self, user_id: &str, dest: &Path) -> Result<Option<SnapshotRecord>> {
        let record = match self.current(user_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let timer = crate::metrics::SNAPSHOT_LOAD_DURATION.start_timer();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| download_err(user_id, &e.to_string()))?;
        }
        let object = self.object_path(user_id, record.snapshot_version);
        let tmp = dest.with_extension("restore.tmp");
        let (size_bytes, checksum) = copy_with_checksum(&object, &tmp)
            .await
            .map_err(|e| download_err(user_id, &e.to_string()))?;

        if size_bytes != record.size_bytes || checksum != record.checksum {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(download_err(
                user_id,
                &format!(
                    "integrity check failed for v{} ({} bytes, crc {:08x})",
                    record.snapshot_version, size_bytes, checksum
                ),
            ));
        }
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| download_err(user_id, &e.to_string()))?;

        timer.observe_duration();
        Ok(Some(record))
    }

    async fn write_pointer(&self, record: &SnapshotRecord) -> std::io::Result<()> {
        let path = self.pointer_path(&record.user_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await
    }

    /// Best-effort removal of superseded versions; failures are ignored
    /// since stale objects are unreachable anyway.
    async fn prune_older_than(&self, user_id: &str, current_version: u64) {
        let dir = self.user_dir(user_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(version) = parse_object_version(&name.to_string_lossy()) else {
                continue;
            };
            if version < current_version {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

fn parse_object_version(name: &str) -> Option<u64> {
    name.strip_prefix("rootfs.v")?
        .strip_suffix(".img")?
        .parse()
        .ok()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn upload_err(user_id: &str, op: &'static str, message: &str) -> Error {
    Error::SnapshotFailure {
        user_id: user_id.to_string(),
        op,
        message: message.to_string(),
    }
}

fn download_err(user_id: &str, message: &str) -> Error {
    Error::SnapshotFailure {
        user_id: user_id.to_string(),
        op: "download",
        message: message.to_string(),
    }
}

/// Copy `src` to `dst` in chunks, fsync the result, and return
/// `(size, crc32)` of the bytes written.
async fn copy_with_checksum(src: &Path, dst: &Path) -> std::io::Result<(u64, u32)> {
    let mut reader = tokio::fs::File::open(src).await?;
    let mut writer = tokio::fs::File::create(dst).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.sync_all().await?;
    Ok((total, hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (dir, store) = store();
        let device = dir.path().join("rootfs.img");
        std::fs::write(&device, b"filesystem contents v1").unwrap();

        let record = store.save("alice", &device).await.unwrap();
        assert_eq!(record.snapshot_version, 1);
        assert_eq!(record.size_bytes, 22);

        let dest = dir.path().join("restored.img");
        let loaded = store.load("alice", &dest).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(std::fs::read(&dest).unwrap(), b"filesystem contents v1");
    }

    #[tokio::test]
    async fn missing_snapshot_is_none_not_error() {
        let (dir, store) = store();
        let dest = dir.path().join("restored.img");
        assert!(store.load("nobody", &dest).await.unwrap().is_none());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn versions_increment_and_old_objects_are_pruned() {
        let (dir, store) = store();
        let device = dir.path().join("rootfs.img");

        std::fs::write(&device, b"one").unwrap();
        let first = store.save("bob", &device).await.unwrap();
        std::fs::write(&device, b"two-two").unwrap();
        let second = store.save("bob", &device).await.unwrap();

        assert_eq!(first.snapshot_version, 1);
        assert_eq!(second.snapshot_version, 2);

        let user_dir = dir.path().join("store/users/bob");
        assert!(!user_dir.join("rootfs.v000001.img").exists());
        assert!(user_dir.join("rootfs.v000002.img").exists());

        let dest = dir.path().join("restored.img");
        store.load("bob", &dest).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two-two");
    }

    #[tokio::test]
    async fn corrupted_object_fails_integrity_check() {
        let (dir, store) = store();
        let device = dir.path().join("rootfs.img");
        std::fs::write(&device, b"precious bytes").unwrap();
        store.save("carol", &device).await.unwrap();

        // Flip a byte in the stored object behind the store's back.
        let object = dir.path().join("store/users/carol/rootfs.v000001.img");
        let mut bytes = std::fs::read(&object).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&object, bytes).unwrap();

        let dest = dir.path().join("restored.img");
        let err = store.load("carol", &dest).await.unwrap_err();
        assert_eq!(err.kind(), "snapshot_failure");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn snapshots_are_partitioned_by_user() {
        let (dir, store) = store();
        let device = dir.path().join("rootfs.img");

        std::fs::write(&device, b"alice data").unwrap();
        store.save("alice", &device).await.unwrap();
        std::fs::write(&device, b"bob data").unwrap();
        store.save("bob", &device).await.unwrap();

        let dest = dir.path().join("restored.img");
        store.load("alice", &dest).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"alice data");
    }

    #[tokio::test]
    async fn save_missing_device_reports_upload_failure() {
        let (dir, store) = store();
        let err = store
            .save("dave", &dir.path().join("no-such-device.img"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "snapshot_failure");
    }
}
