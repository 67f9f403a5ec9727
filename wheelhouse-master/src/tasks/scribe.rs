//! Renders and atomically writes the static index pages.
//!
//! The inbound channel feeds a set, not a log: bursts of notifications
//! for the same target compress to one write. The set is drained once per
//! poll cycle; the root index (and packages.json beside it) is only
//! rewritten when its rendered body actually differs from what is on
//! disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_core::index;
use wheelhouse_model::{MasterStats, PackageName};

use super::db::DbHandle;
use wheelhouse_config::PathsConfig;

#[derive(Debug, Clone)]
pub enum ScribeCmd {
    RewritePackage(PackageName),
    RewriteProject(PackageName),
    RewriteRoot,
    RewriteStats(MasterStats),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Package(PackageName),
    Project(PackageName),
    Root,
    Stats,
}

#[derive(Debug)]
pub struct Scribe {
    rx: mpsc::Receiver<ScribeCmd>,
    db: DbHandle,
    paths: PathsConfig,
    poll: Duration,
    targets: HashSet<Target>,
    latest_stats: Option<MasterStats>,
}

impl Scribe {
    pub fn new(
        rx: mpsc::Receiver<ScribeCmd>,
        db: DbHandle,
        paths: PathsConfig,
        poll: Duration,
    ) -> Self {
        Self {
            rx,
            db,
            paths,
            poll,
            targets: HashSet::new(),
            latest_stats: None,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.poll);
        tick.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.enqueue(cmd),
                    None => break,
                },
                _ = tick.tick() => self.flush().await,
            }
        }
        self.flush().await;
        debug!("scribe stopped");
    }

    fn enqueue(&mut self, cmd: ScribeCmd) {
        match cmd {
            ScribeCmd::RewritePackage(package) => {
                self.targets.insert(Target::Package(package));
            }
            ScribeCmd::RewriteProject(package) => {
                self.targets.insert(Target::Project(package));
            }
            ScribeCmd::RewriteRoot => {
                self.targets.insert(Target::Root);
            }
            ScribeCmd::RewriteStats(stats) => {
                self.latest_stats = Some(stats);
                self.targets.insert(Target::Stats);
            }
        }
    }

    async fn flush(&mut self) {
        if self.targets.is_empty() {
            return;
        }
        let mut targets: Vec<Target> =
            self.targets.drain().collect();
        // Root last: package pages land before the listing that links
        // them.
        targets.sort_by_key(|t| match t {
            Target::Package(_) => 0,
            Target::Project(_) => 1,
            Target::Stats => 2,
            Target::Root => 3,
        });
        for target in targets {
            if let Err(err) = self.rewrite(&target).await {
                error!(?target, %err, "index rewrite failed; will retry");
                self.targets.insert(target);
            }
        }
    }

    async fn rewrite(&self, target: &Target) -> anyhow::Result<()> {
        match target {
            Target::Package(package) => {
                let files = match self
                    .db
                    .call(DbOp::GetPackageFiles {
                        package: package.clone(),
                    })
                    .await?
                {
                    DbReply::PackageFiles(files) => files,
                    other => anyhow::bail!("unexpected reply: {other:?}"),
                };
                let html = index::render_package_index(package, &files)?;
                let path = self
                    .paths
                    .simple_dir()
                    .join(package.as_str())
                    .join("index.html");
                write_atomic(&path, html.as_bytes()).await?;
                debug!(%package, "package index rewritten");
            }

            Target::Project(package) => {
                let files = match self
                    .db
                    .call(DbOp::GetProjectFiles {
                        package: package.clone(),
                    })
                    .await?
                {
                    DbReply::ProjectFiles(files) => files,
                    other => anyhow::bail!("unexpected reply: {other:?}"),
                };
                let html = index::render_project_page(package, &files)?;
                let path = self
                    .paths
                    .project_dir()
                    .join(package.as_str())
                    .join("index.html");
                write_atomic(&path, html.as_bytes()).await?;
                debug!(%package, "project page rewritten");
            }

            Target::Root => {
                let packages = match self
                    .db
                    .call(DbOp::GetIndexPackages)
                    .await?
                {
                    DbReply::IndexPackages(packages) => packages,
                    other => anyhow::bail!("unexpected reply: {other:?}"),
                };
                // packages.json carries wheel counts, which move more
                // often than root membership; it is refreshed on every
                // root notification.
                let json = index::render_packages_json(&packages)?;
                write_atomic(
                    &self.paths.output_root().join("packages.json"),
                    json.as_bytes(),
                )
                .await?;

                let html = index::render_root_index(&packages)?;
                let path = self.paths.simple_dir().join("index.html");
                if on_disk_hash(&path).await
                    == Some(index::body_hash(&html))
                {
                    debug!("root index unchanged");
                    return Ok(());
                }
                write_atomic(&path, html.as_bytes()).await?;
                info!(
                    packages = packages.len(),
                    "root index rewritten"
                );
            }

            Target::Stats => {
                let Some(stats) = &self.latest_stats else {
                    return Ok(());
                };
                let html = index::render_stats_page(stats)?;
                write_atomic(
                    &self.paths.output_root().join("stats.html"),
                    html.as_bytes(),
                )
                .await?;
                debug!("stats page rewritten");
            }
        }
        Ok(())
    }
}

/// Hash of an existing page, `None` if absent or unreadable.
async fn on_disk_hash(path: &Path) -> Option<String> {
    let body = fs::read_to_string(path).await.ok()?;
    Some(index::body_hash(&body))
}

/// Temp file in the same directory, then rename; readers never observe a
/// partial page.
async fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(path);
    fs::write(&tmp, body).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.html");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"two");
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn tmp_sibling_stays_in_directory() {
        let path = Path::new("/srv/simple/foo/index.html");
        let tmp = tmp_sibling(path);
        assert_eq!(tmp.parent(), path.parent());
        assert_eq!(tmp.file_name().unwrap(), "index.html.tmp");
    }
}
