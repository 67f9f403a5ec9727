//! Polls the upstream package index and feeds the secretary.
//!
//! The upstream speaks the JSON simple-index dialect: the root document
//! lists project names, per-project documents list files (with upload
//! times) and versions. Each poll diffs the root listing against the
//! local package set; new packages are registered immediately, and a
//! rotating window of known packages is re-fetched for new versions.
//! Upstream removals become skip entries, never deletions, so historical
//! builds stay attributable.

use std::collections::BTreeMap;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_model::{PackageName, SkipReason, VersionString};

use super::db::DbHandle;
use super::secretary::{Event, SecretaryHandle};
use super::{ConfigRx, ShutdownRx};

const ACCEPT_JSON: &str = "application/vnd.pypi.simple.v1+json";
const REMOVED_REASON: &str = "deleted from upstream index";

#[derive(Debug, Deserialize)]
struct ProjectList {
    projects: Vec<ProjectRef>,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectDetail {
    #[serde(default)]
    files: Vec<ProjectFileRef>,
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectFileRef {
    filename: String,
    #[serde(rename = "upload-time")]
    upload_time: Option<DateTime<Utc>>,
}

pub struct CloudGazer {
    db: DbHandle,
    secretary: SecretaryHandle,
    config: ConfigRx,
    shutdown: ShutdownRx,
    http: reqwest::Client,
    /// Rotating refresh position over the sorted known-package list.
    cursor: usize,
}

impl std::fmt::Debug for CloudGazer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudGazer")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl CloudGazer {
    pub fn new(
        db: DbHandle,
        secretary: SecretaryHandle,
        config: ConfigRx,
        shutdown: ShutdownRx,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                "wheelhouse-master/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self {
            db,
            secretary,
            config,
            shutdown,
            http,
            cursor: 0,
        })
    }

    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if let Err(err) = self.poll().await {
                // No state change on upstream failure; the next poll
                // retries.
                warn!(%err, "upstream poll failed");
            }
            let interval = self.config.borrow().upstream.poll_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = super::wait_shutdown(&mut shutdown) => break,
            }
        }
        debug!("cloud gazer stopped");
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        let (index_url, refresh_batch) = {
            let config = self.config.borrow();
            (
                config.upstream.index_url.clone(),
                config.upstream.refresh_batch,
            )
        };
        let base = Url::parse(&index_url)
            .context("invalid upstream index url")?;

        let known = self.known_packages().await?;
        let upstream = self.fetch_project_list(&base).await?;
        debug!(
            upstream = upstream.len(),
            known = known.len(),
            "upstream index fetched"
        );

        // New packages are registered right away; their versions arrive
        // through the refresh window below.
        let mut fresh: Vec<PackageName> = Vec::new();
        for name in upstream.keys() {
            if !known.contains_key(name) {
                fresh.push(name.clone());
                self.secretary
                    .send(Event::PackageDiscovered {
                        package: name.clone(),
                        skip: SkipReason::none(),
                    })
                    .await;
            }
        }
        if !fresh.is_empty() {
            info!(count = fresh.len(), "new packages discovered");
        }

        // Packages that vanished upstream are skipped, not deleted.
        for (name, skip) in &known {
            if !upstream.contains_key(name) && !skip.is_set() {
                info!(package = %name, "package removed upstream");
                self.secretary
                    .send(Event::PackageSkipped {
                        package: name.clone(),
                        reason: SkipReason::because(REMOVED_REASON),
                    })
                    .await;
            }
        }

        // Version refresh: every new package plus a rotating window of
        // the rest.
        let names: Vec<&PackageName> = upstream
            .keys()
            .filter(|name| !fresh.contains(*name))
            .collect();
        let mut window: Vec<PackageName> = fresh.clone();
        if !names.is_empty() {
            self.cursor %= names.len();
            window.extend(
                names
                    .iter()
                    .cycle()
                    .skip(self.cursor)
                    .take(refresh_batch.min(names.len()))
                    .map(|name| (*name).clone()),
            );
            self.cursor =
                (self.cursor + refresh_batch) % names.len();
        }

        for package in window {
            if let Some(raw) = upstream.get(&package) {
                if let Err(err) =
                    self.refresh_versions(&base, &package, raw).await
                {
                    warn!(%package, %err, "version refresh failed");
                }
            }
        }
        Ok(())
    }

    async fn known_packages(
        &self,
    ) -> anyhow::Result<BTreeMap<PackageName, SkipReason>> {
        match self.db.call(DbOp::GetAllPackages).await? {
            DbReply::Packages(packages) => Ok(packages
                .into_iter()
                .map(|p| (p.name, p.skip))
                .collect()),
            other => anyhow::bail!("unexpected reply: {other:?}"),
        }
    }

    /// Root listing, keyed by normalized name with the upstream spelling
    /// kept for URL construction.
    async fn fetch_project_list(
        &self,
        base: &Url,
    ) -> anyhow::Result<BTreeMap<PackageName, String>> {
        let list: ProjectList = self
            .http
            .get(base.clone())
            .header(reqwest::header::ACCEPT, ACCEPT_JSON)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut projects = BTreeMap::new();
        for project in list.projects {
            match PackageName::new(&project.name) {
                Ok(name) => {
                    projects.insert(name, project.name);
                }
                Err(err) => {
                    debug!(raw = %project.name, %err,
                           "ignoring unparseable upstream name");
                }
            }
        }
        Ok(projects)
    }

    async fn refresh_versions(
        &self,
        base: &Url,
        package: &PackageName,
        upstream_name: &str,
    ) -> anyhow::Result<()> {
        let url = base.join(&format!("{upstream_name}/"))?;
        let detail: ProjectDetail = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT_JSON)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        for version in &detail.versions {
            let released_at =
                release_time(&detail.files, upstream_name, version)
                    .unwrap_or_else(Utc::now);
            self.secretary
                .send(Event::VersionDiscovered {
                    package: package.clone(),
                    version: VersionString::from(version.as_str()),
                    released_at,
                    skip: SkipReason::none(),
                })
                .await;
        }
        Ok(())
    }
}

/// Earliest upload time among the files of one version, if any file
/// carries one.
fn release_time(
    files: &[ProjectFileRef],
    name: &str,
    version: &str,
) -> Option<DateTime<Utc>> {
    let stem = name.replace('-', "_");
    let prefixes = [
        format!("{name}-{version}-"),
        format!("{name}-{version}."),
        format!("{stem}-{version}-"),
        format!("{stem}-{version}."),
    ];
    files
        .iter()
        .filter(|f| {
            prefixes.iter().any(|prefix| f.filename.starts_with(prefix))
        })
        .filter_map(|f| f.upload_time)
        .min()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn file(filename: &str, hour: u32) -> ProjectFileRef {
        ProjectFileRef {
            filename: filename.to_string(),
            upload_time: Some(
                Utc.with_ymd_and_hms(2021, 6, 1, hour, 0, 0).unwrap(),
            ),
        }
    }

    #[test]
    fn release_time_picks_earliest_matching_file() {
        let files = vec![
            file("foo-1.0-py3-none-any.whl", 12),
            file("foo-1.0.tar.gz", 9),
            file("foo-2.0.tar.gz", 15),
        ];
        let when = release_time(&files, "foo", "1.0").unwrap();
        assert_eq!(when.format("%H").to_string(), "09");
        assert!(release_time(&files, "foo", "3.0").is_none());
    }

    #[test]
    fn release_time_handles_underscore_stems() {
        let files = vec![file("foo_bar-1.0-py3-none-any.whl", 8)];
        assert!(release_time(&files, "foo-bar", "1.0").is_some());
    }

    #[test]
    fn project_detail_tolerates_missing_fields() {
        let detail: ProjectDetail =
            serde_json::from_str(r#"{"name": "foo"}"#).unwrap();
        assert!(detail.files.is_empty());
        assert!(detail.versions.is_empty());
    }
}
