//! Receives build artifact uploads, verifies them, and installs them.
//!
//! The juggler owns the published tree exclusively. Connection tasks do
//! the byte shuffling and hashing; the actor does the bookkeeping: which
//! uploads are expected from which slave, how many hash-mismatch retries
//! a file has left, and when a build is complete enough to hand to the
//! secretary. Installs are same-filesystem renames, so a filename visible
//! under `simple/` is always a fully verified file.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_model::{
    BuildArtifact, BuildAttempt, PackageName, SlaveId,
};

use crate::proto::ProtocolError;
use crate::proto::transfer::{
    CHUNK_SIZE, TransferCodec, TransferIn, TransferOut, TransferVerdict,
};
use crate::store::ArtifactStore;
use super::db::DbHandle;
use super::secretary::{Event, SecretaryHandle};
use super::slave_driver::DriverMsg;

#[derive(Debug)]
pub enum JugglerCmd {
    /// Driver or import handler: this uploader will send these files.
    Expect {
        slave: SlaveId,
        attempt: BuildAttempt,
        files: Vec<BuildArtifact>,
    },
    /// The uploader died or its build was aborted; drop expectations and
    /// staged files.
    Cancel { slave: SlaveId },
    /// Remove published files (delete_build / rebuild cascade).
    Remove {
        package: PackageName,
        filenames: Vec<String>,
    },
    /// Connection task: an uploader wants to start this file.
    Claim {
        slave: SlaveId,
        filename: String,
        reply: oneshot::Sender<Option<TransferTicket>>,
    },
    /// Connection task: the file is fully assembled and hashed.
    Staged {
        slave: SlaveId,
        filename: String,
        staged: PathBuf,
        size: u64,
        hash: String,
        reply: oneshot::Sender<TransferVerdict>,
    },
}

/// Everything a connection task needs to receive one file.
#[derive(Debug, Clone)]
pub struct TransferTicket {
    pub staging: PathBuf,
    pub expected_size: u64,
}

#[derive(Debug)]
struct ActiveBuild {
    attempt: BuildAttempt,
    files: HashMap<String, BuildArtifact>,
    installed: HashSet<String>,
    mismatches: HashMap<String, u32>,
}

pub struct FileJuggler {
    rx: mpsc::Receiver<JugglerCmd>,
    store: ArtifactStore,
    db: DbHandle,
    secretary: SecretaryHandle,
    driver: mpsc::Sender<DriverMsg>,
    transfer_retries: u32,
    active: HashMap<SlaveId, ActiveBuild>,
}

impl std::fmt::Debug for FileJuggler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJuggler")
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl FileJuggler {
    pub fn new(
        rx: mpsc::Receiver<JugglerCmd>,
        store: ArtifactStore,
        db: DbHandle,
        secretary: SecretaryHandle,
        driver: mpsc::Sender<DriverMsg>,
        transfer_retries: u32,
    ) -> Self {
        Self {
            rx,
            store,
            db,
            secretary,
            driver,
            transfer_retries,
            active: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd).await;
        }
        debug!("file juggler stopped");
    }

    async fn handle(&mut self, cmd: JugglerCmd) {
        match cmd {
            JugglerCmd::Expect {
                slave,
                attempt,
                files,
            } => {
                debug!(
                    %slave,
                    package = %attempt.package,
                    files = files.len(),
                    "expecting upload"
                );
                let files = files
                    .into_iter()
                    .map(|f| (f.filename.clone(), f))
                    .collect();
                self.active.insert(
                    slave,
                    ActiveBuild {
                        attempt,
                        files,
                        installed: HashSet::new(),
                        mismatches: HashMap::new(),
                    },
                );
            }

            JugglerCmd::Cancel { slave } => {
                if let Some(build) = self.active.remove(&slave) {
                    info!(
                        %slave,
                        package = %build.attempt.package,
                        "upload cancelled; discarding staged files"
                    );
                    for filename in build.files.keys() {
                        let staged =
                            self.store.staging_path(slave, filename);
                        self.store.discard_staged(&staged).await;
                    }
                    self.remove_installed(&build).await;
                }
            }

            JugglerCmd::Remove { package, filenames } => {
                for filename in &filenames {
                    match self.store.remove(&package, filename).await {
                        Ok(true) => {
                            debug!(%package, filename, "file removed")
                        }
                        Ok(false) => {}
                        Err(err) => warn!(
                            %package, filename, %err,
                            "failed to remove file"
                        ),
                    }
                }
            }

            JugglerCmd::Claim {
                slave,
                filename,
                reply,
            } => {
                let ticket = self.claim(slave, &filename);
                let _ = reply.send(ticket);
            }

            JugglerCmd::Staged {
                slave,
                filename,
                staged,
                size,
                hash,
                reply,
            } => {
                let verdict =
                    self.staged(slave, &filename, &staged, size, &hash)
                        .await;
                let _ = reply.send(verdict);
            }
        }
    }

    fn claim(
        &mut self,
        slave: SlaveId,
        filename: &str,
    ) -> Option<TransferTicket> {
        let build = self.active.get(&slave)?;
        if build.installed.contains(filename) {
            return None;
        }
        let file = build.files.get(filename)?;
        Some(TransferTicket {
            staging: self.store.staging_path(slave, filename),
            expected_size: file.filesize,
        })
    }

    async fn staged(
        &mut self,
        slave: SlaveId,
        filename: &str,
        staged: &std::path::Path,
        size: u64,
        hash: &str,
    ) -> TransferVerdict {
        let Some(build) = self.active.get_mut(&slave) else {
            warn!(%slave, filename, "upload for unknown build");
            self.store.discard_staged(staged).await;
            return TransferVerdict::Error;
        };
        let Some(expected) = build.files.get(filename) else {
            warn!(%slave, filename, "upload of unexpected file");
            self.store.discard_staged(staged).await;
            return TransferVerdict::Error;
        };

        if size != expected.filesize || hash != expected.filehash {
            self.store.discard_staged(staged).await;
            let misses = build
                .mismatches
                .entry(filename.to_string())
                .or_insert(0);
            *misses += 1;
            if *misses > self.transfer_retries {
                warn!(
                    %slave, filename,
                    retries = self.transfer_retries,
                    "hash mismatch persisted; build failed"
                );
                self.fail_build(slave).await;
                return TransferVerdict::Error;
            }
            warn!(%slave, filename, attempt = *misses, "hash mismatch");
            return TransferVerdict::Retry;
        }

        let package = build.attempt.package.clone();
        match self.store.install(staged, &package, filename).await {
            Ok(dest) => {
                debug!(%slave, path = %dest.display(), "file installed");
            }
            Err(err) => {
                warn!(%slave, filename, %err, "install failed");
                self.store.discard_staged(staged).await;
                return TransferVerdict::Retry;
            }
        }
        build.installed.insert(filename.to_string());

        if build.installed.len() == build.files.len() {
            self.finish_build(slave).await;
        }
        TransferVerdict::Ok
    }

    /// All files verified and installed: record the build, unless its
    /// version was skipped while it was in flight.
    async fn finish_build(&mut self, slave: SlaveId) {
        let Some(build) = self.active.remove(&slave) else {
            return;
        };
        let skipped = match self
            .db
            .call(DbOp::VersionSkipped {
                package: build.attempt.package.clone(),
                version: build.attempt.version.clone(),
            })
            .await
        {
            Ok(DbReply::Skipped(skipped)) => skipped,
            Ok(_) | Err(_) => false,
        };

        if skipped {
            info!(
                package = %build.attempt.package,
                version = %build.attempt.version,
                "version skipped mid-build; discarding artifacts"
            );
            self.remove_installed(&build).await;
        } else {
            let files = build.files.values().cloned().collect();
            self.secretary
                .send(Event::BuildFinished {
                    attempt: build.attempt,
                    files,
                })
                .await;
        }
        let _ = self
            .driver
            .send(DriverMsg::TransferComplete {
                slave,
                success: true,
            })
            .await;
    }

    /// Retry cap exceeded on some file: discard everything and record the
    /// attempt as failed.
    async fn fail_build(&mut self, slave: SlaveId) {
        let Some(build) = self.active.remove(&slave) else {
            return;
        };
        self.remove_installed(&build).await;
        let mut attempt = build.attempt;
        attempt.status = wheelhouse_model::BuildStatus::Failed;
        self.secretary
            .send(Event::BuildFinished {
                attempt,
                files: Vec::new(),
            })
            .await;
        let _ = self
            .driver
            .send(DriverMsg::TransferComplete {
                slave,
                success: false,
            })
            .await;
    }

    async fn remove_installed(&self, build: &ActiveBuild) {
        for filename in &build.installed {
            if let Err(err) = self
                .store
                .remove(&build.attempt.package, filename)
                .await
            {
                warn!(filename, %err, "failed to remove installed file");
            }
        }
    }
}

/// Serves one uploader connection on the file transfer socket.
///
/// Generic over the stream so tests can drive it over an in-memory
/// duplex.
pub async fn serve_transfer<S>(
    stream: S,
    juggler: mpsc::Sender<JugglerCmd>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, TransferCodec::new());

    let slave = match framed.next().await.transpose()? {
        Some(TransferIn::Hello { slave_id }) => slave_id,
        Some(other) => {
            return Err(ProtocolError::Unexpected(format!("{other:?}")));
        }
        None => return Ok(()),
    };

    loop {
        let filename = match framed.next().await.transpose()? {
            Some(TransferIn::Send { filename }) => filename,
            Some(other) => {
                return Err(ProtocolError::Unexpected(format!(
                    "{other:?}"
                )));
            }
            None => return Ok(()),
        };

        let (reply, ticket) = oneshot::channel();
        if juggler
            .send(JugglerCmd::Claim {
                slave,
                filename: filename.clone(),
                reply,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        let Ok(Some(ticket)) = ticket.await else {
            framed
                .send(TransferOut::Verdict(TransferVerdict::Error))
                .await?;
            continue;
        };

        let (size, hash) = receive_file(&mut framed, &ticket).await?;

        let (reply, verdict) = oneshot::channel();
        if juggler
            .send(JugglerCmd::Staged {
                slave,
                filename,
                staged: ticket.staging.clone(),
                size,
                hash,
                reply,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
        let verdict =
            verdict.await.unwrap_or(TransferVerdict::Error);
        framed.send(TransferOut::Verdict(verdict)).await?;
    }
}

/// Receives one file chunk by chunk into the staging path, re-requesting
/// anything missing when the uploader claims to be done. Returns the
/// received size and SHA-256.
async fn receive_file<S>(
    framed: &mut Framed<S, TransferCodec>,
    ticket: &TransferTicket,
) -> Result<(u64, String), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let chunks = ticket.expected_size.div_ceil(CHUNK_SIZE) as usize;
    let mut received = vec![false; chunks];

    let mut file = tokio::fs::File::create(&ticket.staging).await?;
    framed.send(TransferOut::Fetch { index: 0 }).await?;

    while received.iter().any(|r| !r) {
        match framed.next().await.transpose()? {
            Some(TransferIn::Chunk { index, data }) => {
                let index = index as usize;
                if index >= chunks {
                    return Err(ProtocolError::Unexpected(format!(
                        "chunk {index} of {chunks}"
                    )));
                }
                file.seek(SeekFrom::Start(
                    index as u64 * CHUNK_SIZE,
                ))
                .await?;
                file.write_all(&data).await?;
                received[index] = true;
            }
            Some(TransferIn::Done) => {
                // NAK: re-request whatever is missing, out of order is
                // fine.
                for (index, _) in
                    received.iter().enumerate().filter(|(_, r)| !**r)
                {
                    framed
                        .send(TransferOut::Fetch {
                            index: index as u32,
                        })
                        .await?;
                }
            }
            Some(other) => {
                return Err(ProtocolError::Unexpected(format!(
                    "{other:?}"
                )));
            }
            None => {
                return Err(ProtocolError::Unexpected(
                    "connection closed mid-transfer".to_string(),
                ));
            }
        }
    }

    // Consume the uploader's final Done.
    match framed.next().await.transpose()? {
        Some(TransferIn::Done) => {}
        Some(other) => {
            return Err(ProtocolError::Unexpected(format!("{other:?}")));
        }
        None => {
            return Err(ProtocolError::Unexpected(
                "connection closed before DONE".to_string(),
            ));
        }
    }

    file.flush().await?;
    drop(file);
    let (size, hash) =
        ArtifactStore::hash_file(&ticket.staging).await?;
    Ok((size, hash))
}
