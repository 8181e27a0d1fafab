//! The local-sync seam.
//!
//! The on-disk mirroring primitive is an external collaborator; both sync
//! sides talk to it through this trait. Implementations return errors, they
//! never panic. Create on an existing path and Remove on a missing path
//! must be no-ops, because event re-delivery across reconnects duplicates
//! work.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait Syncer: Send + Sync {
    async fn create(&self, path: &str) -> Result<()>;
    async fn write(&self, path: &str) -> Result<()>;
    async fn remove(&self, path: &str) -> Result<()>;
    async fn rename(&self, path: &str) -> Result<()>;
    async fn chmod(&self, path: &str) -> Result<()>;
    async fn symlink(&self, target: &str, link: &str) -> Result<()>;
    async fn is_dir(&self, path: &str) -> Result<bool>;
    /// Bootstrap: walk `root` and materialize every entry.
    async fn sync_once(&self, root: &str) -> Result<()>;
}

/// True for the not-exist errors that are suppressed when a Write event's
/// Create is reapplied out of order.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
}

/// A syncer that only logs. Lets the monitor binary run end to end when no
/// disk syncer is wired in.
pub struct LogSyncer;

#[async_trait]
impl Syncer for LogSyncer {
    async fn create(&self, path: &str) -> Result<()> {
        tracing::info!(path, "create");
        Ok(())
    }

    async fn write(&self, path: &str) -> Result<()> {
        tracing::info!(path, "write");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        tracing::info!(path, "remove");
        Ok(())
    }

    async fn rename(&self, path: &str) -> Result<()> {
        tracing::info!(path, "rename");
        Ok(())
    }

    async fn chmod(&self, path: &str) -> Result<()> {
        tracing::info!(path, "chmod");
        Ok(())
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        tracing::info!(link_target = target, link, "symlink");
        Ok(())
    }

    async fn is_dir(&self, _path: &str) -> Result<bool> {
        Ok(false)
    }

    async fn sync_once(&self, root: &str) -> Result<()> {
        tracing::info!(root, "sync once");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_predicate() {
        let nf: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(is_not_found(&nf));
        let other: anyhow::Error =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(!is_not_found(&other));
        let plain = anyhow::anyhow!("not io at all");
        assert!(!is_not_found(&plain));
    }
}
