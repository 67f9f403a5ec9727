//! Filesystem area owned by the file juggler.
//!
//! Uploads are assembled under `tmp/` and moved into `simple/<package>/`
//! with a same-filesystem rename, so any filename visible under `simple/`
//! has been fully received, hashed and verified. Nothing else writes to
//! either tree.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use wheelhouse_config::PathsConfig;
use wheelhouse_model::{PackageName, SlaveId};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    simple: PathBuf,
    tmp: PathBuf,
}

impl ArtifactStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            simple: paths.simple_dir(),
            tmp: paths.tmp_dir(),
        }
    }

    pub async fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(&self.simple).await?;
        fs::create_dir_all(&self.tmp).await?;
        Ok(())
    }

    /// Deletes every leftover in the staging area. Run once at startup:
    /// anything still there belongs to a transfer that died with the
    /// previous process.
    pub async fn purge_tmp(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.tmp).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Err(err) = fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), %err,
                      "failed to purge staging file");
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "purged staging area");
        }
        Ok(removed)
    }

    /// Staging path for one upload; prefixing with the slave id keeps
    /// concurrent uploads of the same filename apart.
    pub fn staging_path(&self, slave: SlaveId, filename: &str) -> PathBuf {
        self.tmp.join(format!("{}-{}", slave.as_u32(), filename))
    }

    pub fn published_path(
        &self,
        package: &PackageName,
        filename: &str,
    ) -> PathBuf {
        self.simple.join(package.as_str()).join(filename)
    }

    /// Atomically installs a fully verified staging file.
    pub async fn install(
        &self,
        staged: &Path,
        package: &PackageName,
        filename: &str,
    ) -> io::Result<PathBuf> {
        let dest = self.published_path(package, filename);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, &dest).await?;
        Ok(dest)
    }

    /// Removes a published file; `Ok(false)` if it was already gone.
    pub async fn remove(
        &self,
        package: &PackageName,
        filename: &str,
    ) -> io::Result<bool> {
        match fs::remove_file(self.published_path(package, filename)).await
        {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn discard_staged(&self, staged: &Path) {
        if let Err(err) = fs::remove_file(staged).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %staged.display(), %err,
                  "failed to discard staging file");
        }
    }

    /// Size and lowercase hex SHA-256 of a file, streamed.
    pub async fn hash_file(path: &Path) -> io::Result<(u64, String)> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok((size, hex::encode(hasher.finalize())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> ArtifactStore {
        let paths = PathsConfig {
            output_root: root.to_path_buf(),
        };
        ArtifactStore::new(&paths)
    }

    #[tokio::test]
    async fn install_moves_into_package_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_layout().await.unwrap();

        let package = PackageName::new("foo").unwrap();
        let staged = store
            .staging_path(SlaveId(1), "foo-1.0-py3-none-any.whl");
        fs::write(&staged, b"wheel bytes").await.unwrap();

        let dest = store
            .install(&staged, &package, "foo-1.0-py3-none-any.whl")
            .await
            .unwrap();
        assert!(!staged.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"wheel bytes");
        assert!(dest.ends_with("simple/foo/foo-1.0-py3-none-any.whl"));
    }

    #[tokio::test]
    async fn purge_clears_staging_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_layout().await.unwrap();

        let staged = store.staging_path(SlaveId(2), "a.whl");
        fs::write(&staged, b"partial").await.unwrap();
        let package = PackageName::new("keep").unwrap();
        let published = store.published_path(&package, "keep.whl");
        fs::create_dir_all(published.parent().unwrap()).await.unwrap();
        fs::write(&published, b"published").await.unwrap();

        assert_eq!(store.purge_tmp().await.unwrap(), 1);
        assert!(!staged.exists());
        assert!(published.exists());
    }

    #[tokio::test]
    async fn hash_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").await.unwrap();
        let (size, hash) = ArtifactStore::hash_file(&path).await.unwrap();
        assert_eq!(size, 3);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn remove_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_layout().await.unwrap();
        let package = PackageName::new("foo").unwrap();
        assert!(!store.remove(&package, "gone.whl").await.unwrap());
    }
}
