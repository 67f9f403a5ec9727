//! Accepts externally built wheels.
//!
//! An import client announces a finished build in the same shape a slave
//! would report it, then streams the files through the file transfer
//! socket under an id allocated here. Package and version rows are
//! created synchronously before any upload is invited, so the juggler's
//! final skip check sees them. Recording then follows the exact same
//! path as a slave build.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wheelhouse_core::db::DbOp;
use wheelhouse_model::{
    AbiTag, BuildArtifact, BuildAttempt, BuildStatus, PackageName,
    SkipReason, SlaveId, VersionString, WheelFilename,
};

use crate::proto::ProtocolError;
use crate::proto::control::{ImportRequest, ImportResponse};
use crate::proto::framing::JsonFramed;
use super::db::DbHandle;
use super::juggler::JugglerCmd;
use super::{ConfigRx, ShutdownRx};

/// Stale import jobs are reaped on this cadence.
const TICK: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ImportMsg {
    pub request: ImportRequest,
    pub reply: oneshot::Sender<ImportResponse>,
}

#[derive(Debug)]
struct ImportJob {
    remaining: VecDeque<String>,
    last_seen: DateTime<Utc>,
}

pub struct ImportHandler {
    rx: mpsc::Receiver<ImportMsg>,
    db: DbHandle,
    juggler: mpsc::Sender<JugglerCmd>,
    config: ConfigRx,
    shutdown: ShutdownRx,
    ids: Arc<AtomicU32>,
    jobs: HashMap<SlaveId, ImportJob>,
}

impl std::fmt::Debug for ImportHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportHandler")
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl ImportHandler {
    pub fn new(
        rx: mpsc::Receiver<ImportMsg>,
        db: DbHandle,
        juggler: mpsc::Sender<JugglerCmd>,
        config: ConfigRx,
        shutdown: ShutdownRx,
        ids: Arc<AtomicU32>,
    ) -> Self {
        Self {
            rx,
            db,
            juggler,
            config,
            shutdown,
            ids,
            jobs: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        let response =
                            self.dispatch(msg.request).await;
                        let _ = msg.reply.send(response);
                    }
                    None => break,
                },
                _ = tick.tick() => self.reap_stale().await,
                _ = super::wait_shutdown(&mut shutdown) => break,
            }
        }
        debug!("import handler stopped");
    }

    async fn dispatch(
        &mut self,
        request: ImportRequest,
    ) -> ImportResponse {
        match request {
            ImportRequest::Import {
                label,
                package,
                version,
                duration,
                output,
                files,
            } => {
                self.import(label, package, version, duration, output, files)
                    .await
            }
            ImportRequest::Sent { import_id } => self.sent(import_id),
        }
    }

    async fn import(
        &mut self,
        label: String,
        package: PackageName,
        version: VersionString,
        duration: Duration,
        output: String,
        files: Vec<BuildArtifact>,
    ) -> ImportResponse {
        if files.is_empty() {
            return error("an import must carry at least one file");
        }
        for file in &files {
            let belongs = WheelFilename::parse(&file.filename)
                .ok()
                .and_then(|wheel| wheel.package().ok())
                .map(|name| name == package)
                .unwrap_or(false);
            if !belongs {
                return error(&format!(
                    "{} is not a wheel of {package}",
                    file.filename
                ));
            }
        }

        // Rows must exist before the upload completes; both inserts are
        // idempotent.
        if let Err(err) = self
            .db
            .call(DbOp::AddNewPackage {
                package: package.clone(),
                skip: SkipReason::none(),
            })
            .await
        {
            return error(&err.to_string());
        }
        if let Err(err) = self
            .db
            .call(DbOp::AddNewPackageVersion {
                package: package.clone(),
                version: version.clone(),
                released_at: Utc::now(),
                skip: SkipReason::none(),
            })
            .await
        {
            return error(&err.to_string());
        }

        let abi_tag = files
            .first()
            .map(|f| f.abi_tag.clone())
            .unwrap_or_else(AbiTag::none);
        let attempt = BuildAttempt {
            build_id: None,
            package: package.clone(),
            version: version.clone(),
            abi_tag,
            built_by: label,
            duration,
            status: BuildStatus::Success,
            started_at: Utc::now()
                - chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            output,
        };

        let import_id =
            SlaveId(self.ids.fetch_add(1, Ordering::Relaxed));
        let mut remaining: VecDeque<String> =
            files.iter().map(|f| f.filename.clone()).collect();

        if self
            .juggler
            .send(JugglerCmd::Expect {
                slave: import_id,
                attempt,
                files,
            })
            .await
            .is_err()
        {
            return error("file juggler unavailable");
        }

        info!(
            %import_id, %package, %version,
            files = remaining.len(),
            "import accepted"
        );
        let first = match remaining.pop_front() {
            Some(first) => first,
            None => return error("an import must carry at least one file"),
        };
        remaining.push_front(first.clone());
        self.jobs.insert(
            import_id,
            ImportJob {
                remaining,
                last_seen: Utc::now(),
            },
        );
        ImportResponse::Send {
            import_id,
            filename: first,
        }
    }

    fn sent(&mut self, import_id: SlaveId) -> ImportResponse {
        let Some(job) = self.jobs.get_mut(&import_id) else {
            return error("unknown import id");
        };
        job.last_seen = Utc::now();
        job.remaining.pop_front();
        match job.remaining.front() {
            Some(next) => ImportResponse::Send {
                import_id,
                filename: next.clone(),
            },
            None => {
                self.jobs.remove(&import_id);
                debug!(%import_id, "import upload phase finished");
                ImportResponse::Done
            }
        }
    }

    /// Clients that vanished mid-import leave expectations in the
    /// juggler; reap them with the same busy timeout slaves get.
    async fn reap_stale(&mut self) {
        let timeout = self.config.borrow().timing.busy_timeout;
        let now = Utc::now();
        let stale: Vec<SlaveId> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                (now - job.last_seen).to_std().unwrap_or_default()
                    > timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for import_id in stale {
            warn!(%import_id, "import abandoned; cleaning up");
            self.jobs.remove(&import_id);
            if self
                .juggler
                .send(JugglerCmd::Cancel { slave: import_id })
                .await
                .is_err()
            {
                debug!("file juggler is gone");
            }
        }
    }
}

fn error(message: &str) -> ImportResponse {
    ImportResponse::Error {
        message: message.to_string(),
    }
}

/// Serves one import client connection.
pub async fn serve_import<S>(
    stream: S,
    handler: mpsc::Sender<ImportMsg>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed: JsonFramed<S, ImportRequest, ImportResponse> =
        JsonFramed::new(stream);
    while let Some(request) = framed.recv().await? {
        let (reply, response) = oneshot::channel();
        if handler
            .send(ImportMsg { request, reply })
            .await
            .is_err()
        {
            break;
        }
        match response.await {
            Ok(response) => framed.send(&response).await?,
            Err(_) => break,
        }
    }
    Ok(())
}
