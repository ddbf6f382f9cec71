//! Durable blob storage.
//!
//! Everything the protocol must remember across power cycles goes through a
//! [`Store`]: the account key and URL, the open order, the certificate key
//! and the issued chain. In-memory state is only ever a cache over what is
//! in the store.

use std::{collections::HashMap, io, path::PathBuf};

use async_trait::async_trait;
use eyre::WrapErr as _;
use parking_lot::Mutex;

/// Named durable blobs. Names are flat (no directories).
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns the blob, or `None` if it was never written (or was deleted).
    async fn read(&self, name: &str) -> eyre::Result<Option<Vec<u8>>>;

    /// Durably replaces the blob. The replacement must be atomic: a crash
    /// mid-write may lose the new value but never truncate the old one.
    async fn write(&self, name: &str, data: &[u8]) -> eyre::Result<()>;

    /// Removes the blob. Deleting a missing blob is not an error.
    async fn delete(&self, name: &str) -> eyre::Result<()>;
}

/// [`Store`] over a directory on the local filesystem.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// half-written `certificate.pem` can never shadow a good one.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Creates the directory (mode 0700 on Unix; private keys land here).
    pub fn new(root: impl Into<PathBuf>) -> eyre::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .wrap_err_with(|| format!("creating store directory {}", root.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(FsStore { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl Store for FsStore {
    async fn read(&self, name: &str) -> eyre::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).wrap_err_with(|| format!("reading {name}")),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> eyre::Result<()> {
        let target = self.path(name);
        let tmp = self.path(&format!("{name}.tmp"));

        tokio::fs::write(&tmp, data)
            .await
            .wrap_err_with(|| format!("writing {name}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        tokio::fs::rename(&tmp, &target)
            .await
            .wrap_err_with(|| format!("committing {name}"))?;

        log::trace!("Wrote {} ({} bytes)", target.display(), data.len());
        Ok(())
    }

    async fn delete(&self, name: &str) -> eyre::Result<()> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).wrap_err_with(|| format!("deleting {name}")),
        }
    }
}

/// In-memory [`Store`] for tests and ephemeral deployments.
///
/// Clones share the same underlying map, so a test can keep a handle while
/// the driver owns another.
#[derive(Clone, Default)]
pub struct MemStore {
    blobs: std::sync::Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct synchronous peek, for assertions.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(name).cloned()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn read(&self, name: &str) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(name).cloned())
    }

    async fn write(&self, name: &str, data: &[u8]) -> eyre::Result<()> {
        self.blobs.lock().insert(name.to_owned(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &str) -> eyre::Result<()> {
        self.blobs.lock().remove(name);
        Ok(())
    }
}
