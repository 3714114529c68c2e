use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::StoreError;
use crate::store::FileStore;

/// Free-space query, pluggable so tests can simulate a full disk
pub type FreeSpaceProbe = Box<dyn Fn(&Path) -> std::io::Result<u64> + Send + Sync>;

/// File store rooted at a media directory on the local filesystem
pub struct DiskFileStore {
    root: PathBuf,
    probe: FreeSpaceProbe,
}

impl DiskFileStore {
    pub fn new(root: &Path) -> Result<Self, StoreError> {
        Self::with_probe(root, Box::new(statvfs_free_space))
    }

    /// Construct with a custom free-space probe
    pub fn with_probe(root: &Path, probe: FreeSpaceProbe) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|e| StoreError::CreateDirectoryFailed {
            path: root.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            probe,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn save(&self, bytes: Bytes, name: &str) -> Result<PathBuf, StoreError> {
        let path = self.root.join(name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: path.clone(),
                source: e,
            })?;
        Ok(path)
    }

    async fn adopt(&self, temp: &Path, name: &str) -> Result<PathBuf, StoreError> {
        let path = self.root.join(name);
        match tokio::fs::rename(temp, &path).await {
            Ok(()) => {}
            // Rename fails across filesystems; fall back to copy + remove.
            Err(_) => {
                tokio::fs::copy(temp, &path)
                    .await
                    .map_err(|e| StoreError::WriteFailed {
                        path: path.clone(),
                        source: e,
                    })?;
                let _ = tokio::fs::remove_file(temp).await;
            }
        }
        debug!(path = %path.display(), "adopted transfer into media store");
        Ok(path)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::RemoveFailed {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn available_free_space(&self) -> Result<u64, StoreError> {
        (self.probe)(&self.root).map_err(|e| StoreError::ReadFailed {
            path: self.root.clone(),
            source: e,
        })
    }

    async fn total_used_bytes(&self) -> Result<u64, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::ReadFailed {
                path: self.root.clone(),
                source: e,
            })?;

        let mut total = 0u64;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::ReadFailed {
                path: self.root.clone(),
                source: e,
            })?
        {
            if let Ok(metadata) = entry.metadata().await
                && metadata.is_file()
            {
                total += metadata.len();
            }
        }
        Ok(total)
    }
}

#[cfg(unix)]
fn statvfs_free_space(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::other("path contains interior NUL"))?;

    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn statvfs_free_space(_path: &Path) -> std::io::Result<u64> {
    // No portable query; report unlimited and let writes fail naturally.
    Ok(u64::MAX)
}
