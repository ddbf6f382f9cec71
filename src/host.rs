//! Publication of `http-01` challenge responses.
//!
//! During validation the CA fetches
//! `http://<domain>/.well-known/acme-challenge/<token>` from the open
//! Internet and expects the exact key-authorization bytes with status 200.
//! How those bytes become reachable is the host's business: a directory
//! served by the device's own web server, a file pushed over FTP to a
//! frontend machine, an in-process handler. The protocol only needs the two
//! operations below.

use std::{collections::HashMap, io, path::PathBuf};

use async_trait::async_trait;
use eyre::WrapErr as _;
use parking_lot::Mutex;

/// Makes challenge files reachable over plain HTTP.
#[async_trait]
pub trait ChallengeHost: Send + Sync {
    /// Guarantees that a GET on `http://<domain><path>` returns `content`
    /// with status 200 until [`unpublish`](Self::unpublish) is called.
    async fn publish(&self, path: &str, content: &[u8]) -> eyre::Result<()>;

    /// Takes the file down. Unpublishing an unknown path is not an error.
    async fn unpublish(&self, path: &str) -> eyre::Result<()>;
}

/// [`ChallengeHost`] that drops files into a web server's document root.
///
/// Works with any server configured to serve the root over HTTP on port 80,
/// e.g. the device's own status page server.
pub struct WebrootHost {
    root: PathBuf,
}

impl WebrootHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WebrootHost { root: root.into() }
    }

    fn path_for(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ChallengeHost for WebrootHost {
    async fn publish(&self, path: &str, content: &[u8]) -> eyre::Result<()> {
        let target = self.path_for(path);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }

        tokio::fs::write(&target, content)
            .await
            .wrap_err_with(|| format!("publishing {}", target.display()))?;

        log::debug!("Published challenge file {}", target.display());
        Ok(())
    }

    async fn unpublish(&self, path: &str) -> eyre::Result<()> {
        let target = self.path_for(path);

        match tokio::fs::remove_file(&target).await {
            Ok(()) => {
                log::debug!("Removed challenge file {}", target.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).wrap_err_with(|| format!("unpublishing {}", target.display())),
        }
    }
}

/// In-memory [`ChallengeHost`] for tests.
///
/// Records every publication; clones share state so a test can inspect what
/// the driver served.
#[derive(Clone, Default)]
pub struct MemHost {
    live: std::sync::Arc<Mutex<HashMap<String, Vec<u8>>>>,
    history: std::sync::Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content currently published at `path`, if any.
    pub fn published(&self, path: &str) -> Option<Vec<u8>> {
        self.live.lock().get(path).cloned()
    }

    /// Number of files currently published.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Every publication ever made, in order.
    pub fn history(&self) -> Vec<(String, Vec<u8>)> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl ChallengeHost for MemHost {
    async fn publish(&self, path: &str, content: &[u8]) -> eyre::Result<()> {
        self.live.lock().insert(path.to_owned(), content.to_vec());
        self.history
            .lock()
            .push((path.to_owned(), content.to_vec()));
        Ok(())
    }

    async fn unpublish(&self, path: &str) -> eyre::Result<()> {
        self.live.lock().remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_webroot_publish_and_unpublish() {
        let dir = tempfile::tempdir().unwrap();
        let host = WebrootHost::new(dir.path());

        host.publish("/.well-known/acme-challenge/tok", b"tok.thumb")
            .await
            .unwrap();

        let on_disk = dir.path().join(".well-known/acme-challenge/tok");
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"tok.thumb");

        host.unpublish("/.well-known/acme-challenge/tok")
            .await
            .unwrap();
        assert!(!on_disk.exists());

        // unknown path is fine
        host.unpublish("/.well-known/acme-challenge/other")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mem_host_records_history() {
        let host = MemHost::new();

        host.publish("/a", b"1").await.unwrap();
        host.unpublish("/a").await.unwrap();

        assert_eq!(host.live_count(), 0);
        assert_eq!(host.history(), vec![("/a".to_owned(), b"1".to_vec())]);
    }
}
