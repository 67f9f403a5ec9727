//! Fan-in writer for ephemeral events.
//!
//! Producers (cloud gazer, lumberjack, file juggler) hand their
//! observations to the secretary instead of the database directly; its
//! bounded inbound channel is the backpressure point, and downloads are
//! batched so the worker pool sees one transaction per flush rather than
//! one per record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use wheelhouse_core::db::{DbError, DbOp, DbReply};
use wheelhouse_model::{
    BuildArtifact, BuildAttempt, DownloadRecord, PackageName, SkipReason,
    VersionString,
};

use super::db::DbHandle;
use super::indexer::IndexerEvent;

const DOWNLOAD_FLUSH: Duration = Duration::from_secs(5);
const DOWNLOAD_BATCH: usize = 100;
/// Downloads kept across flush failures before older ones are shed.
const DOWNLOAD_BUFFER_CAP: usize = 10_000;

#[derive(Debug)]
pub enum Event {
    PackageDiscovered {
        package: PackageName,
        skip: SkipReason,
    },
    VersionDiscovered {
        package: PackageName,
        version: VersionString,
        released_at: DateTime<Utc>,
        skip: SkipReason,
    },
    PackageSkipped {
        package: PackageName,
        reason: SkipReason,
    },
    /// A fully verified build; commits attempt, files and dependencies in
    /// one transaction.
    BuildFinished {
        attempt: BuildAttempt,
        files: Vec<BuildArtifact>,
    },
    DownloadSeen(DownloadRecord),
}

/// Cloneable sender; blocks when the secretary is saturated rather than
/// shedding events.
#[derive(Debug, Clone)]
pub struct SecretaryHandle {
    tx: mpsc::Sender<Event>,
}

impl SecretaryHandle {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: Event) {
        if self.tx.send(event).await.is_err() {
            warn!("secretary is gone; event dropped");
        }
    }
}

pub struct Secretary {
    rx: mpsc::Receiver<Event>,
    db: DbHandle,
    indexer: mpsc::Sender<IndexerEvent>,
    downloads: Vec<DownloadRecord>,
}

impl std::fmt::Debug for Secretary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secretary").finish_non_exhaustive()
    }
}

impl Secretary {
    pub fn new(
        rx: mpsc::Receiver<Event>,
        db: DbHandle,
        indexer: mpsc::Sender<IndexerEvent>,
    ) -> Self {
        Self {
            rx,
            db,
            indexer,
            downloads: Vec::new(),
        }
    }

    /// Runs until every producer handle has been dropped, then flushes
    /// what remains.
    pub async fn run(mut self) {
        let mut flush = tokio::time::interval(DOWNLOAD_FLUSH);
        flush.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = flush.tick() => self.flush_downloads().await,
            }
        }
        self.flush_downloads().await;
        debug!("secretary stopped");
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::PackageDiscovered { package, skip } => {
                match self
                    .db
                    .call(DbOp::AddNewPackage {
                        package: package.clone(),
                        skip,
                    })
                    .await
                {
                    Ok(DbReply::Created(true)) => {
                        info!(%package, "new package registered");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.report(&err, "failed to register package");
                    }
                }
            }

            Event::VersionDiscovered {
                package,
                version,
                released_at,
                skip,
            } => {
                match self
                    .db
                    .call(DbOp::AddNewPackageVersion {
                        package: package.clone(),
                        version: version.clone(),
                        released_at,
                        skip,
                    })
                    .await
                {
                    Ok(DbReply::Created(true)) => {
                        info!(%package, %version, "new version registered");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.report(&err, "failed to register version");
                    }
                }
            }

            Event::PackageSkipped { package, reason } => {
                match self
                    .db
                    .call(DbOp::SkipPackage {
                        package: package.clone(),
                        reason,
                    })
                    .await
                {
                    Ok(_) => {
                        info!(%package, "package skipped");
                        self.notify(IndexerEvent::PackageTouched {
                            package,
                        })
                        .await;
                    }
                    Err(err) => {
                        self.report(&err, "failed to skip package");
                    }
                }
            }

            Event::BuildFinished { attempt, files } => {
                let package = attempt.package.clone();
                let version = attempt.version.clone();
                let had_files = !files.is_empty();
                match self.db.call(DbOp::LogBuild { attempt, files }).await
                {
                    Ok(DbReply::BuildLogged(build_id)) => {
                        info!(
                            %package, %version, %build_id,
                            "build recorded"
                        );
                        if had_files {
                            self.notify(IndexerEvent::BuildLogged {
                                package,
                            })
                            .await;
                        }
                    }
                    Ok(other) => {
                        error!(?other, "unexpected reply to log_build");
                    }
                    Err(err) => {
                        self.report(&err, "failed to record build");
                    }
                }
            }

            Event::DownloadSeen(record) => {
                self.downloads.push(record);
                if self.downloads.len() >= DOWNLOAD_BATCH {
                    self.flush_downloads().await;
                }
            }
        }
    }

    async fn flush_downloads(&mut self) {
        if self.downloads.is_empty() {
            return;
        }
        let count = self.downloads.len();
        match self
            .db
            .call(DbOp::LogDownloads {
                records: self.downloads.clone(),
            })
            .await
        {
            Ok(_) => {
                debug!(count, "downloads recorded");
                self.downloads.clear();
            }
            Err(err) => {
                // Keep the batch for the next flush, bounded.
                self.report(&err, "failed to record downloads");
                if self.downloads.len() > DOWNLOAD_BUFFER_CAP {
                    let excess =
                        self.downloads.len() - DOWNLOAD_BUFFER_CAP;
                    self.downloads.drain(..excess);
                    warn!(excess, "download buffer overflow; shed oldest");
                }
            }
        }
    }

    async fn notify(&self, event: IndexerEvent) {
        if self.indexer.send(event).await.is_err() {
            warn!("indexer is gone; rewrite notification dropped");
        }
    }

    fn report(&self, err: &DbError, context: &str) {
        match err {
            DbError::Integrity(_) => warn!(%err, "{context}"),
            _ => error!(%err, "{context}"),
        }
    }
}
