//! Image store: the immutable kernel image and golden rootfs template.
//!
//! Read-only after setup. Users with no prior snapshot get a writable clone
//! of the golden rootfs.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Immutable boot images shared by every VM on the host.
#[derive(Debug, Clone)]
pub struct ImageStore {
    kernel_path: PathBuf,
    base_rootfs_path: PathBuf,
}

impl ImageStore {
    /// Validate and open the image store. Both images must already exist;
    /// producing them is a deployment-time concern.
    pub fn open(kernel_path: PathBuf, base_rootfs_path: PathBuf) -> Result<Self> {
        if !kernel_path.is_file() {
            return Err(Error::Config(format!(
                "kernel image not found: {}",
                kernel_path.display()
            )));
        }
        if !base_rootfs_path.is_file() {
            return Err(Error::Config(format!(
                "golden rootfs not found: {}",
                base_rootfs_path.display()
            )));
        }
        Ok(Self {
            kernel_path,
            base_rootfs_path,
        })
    }

    pub fn kernel_path(&self) -> &Path {
        &self.kernel_path
    }

    pub fn base_rootfs_path(&self) -> &Path {
        &self.base_rootfs_path
    }

    /// Clone the golden rootfs to `dest`, replacing whatever is there.
    /// Returns the number of bytes copied.
    pub async fn clone_rootfs(&self, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(&self.base_rootfs_path, dest).await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clone_produces_identical_copy() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux");
        let golden = dir.path().join("rootfs.ext4");
        std::fs::write(&kernel, b"kernel").unwrap();
        std::fs::write(&golden, b"golden-bytes").unwrap();

        let store = ImageStore::open(kernel, golden.clone()).unwrap();
        let dest = dir.path().join("users/alice/rootfs.img");
        let n = store.clone_rootfs(&dest).await.unwrap();

        assert_eq!(n, 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"golden-bytes");
    }

    #[test]
    fn missing_images_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageStore::open(
            dir.path().join("no-kernel"),
            dir.path().join("no-rootfs"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
