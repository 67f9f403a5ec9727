//! Administrative command endpoint.
//!
//! Connection tasks forward one request at a time; the actor translates
//! each into typed messages for the responsible actor (or direct
//! database calls where the caller expects a synchronous answer) and
//! replies to the caller only.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use wheelhouse_config::MasterConfig;
use wheelhouse_core::db::{DbError, DbOp, DbReply, DeletedBuild};
use wheelhouse_model::{
    BuildId, PackageName, SkipReason, VersionString,
};

use crate::proto::ProtocolError;
use crate::proto::control::{ControlRequest, ControlResponse};
use crate::proto::framing::JsonFramed;
use super::db::DbHandle;
use super::indexer::IndexerEvent;
use super::juggler::JugglerCmd;
use super::slave_driver::DriverMsg;
use super::ShutdownRx;

#[derive(Debug)]
pub struct ControlMsg {
    pub request: ControlRequest,
    pub reply: oneshot::Sender<ControlResponse>,
}

pub struct Control {
    rx: mpsc::Receiver<ControlMsg>,
    db: DbHandle,
    driver: mpsc::Sender<DriverMsg>,
    juggler: mpsc::Sender<JugglerCmd>,
    indexer: mpsc::Sender<IndexerEvent>,
    config_tx: watch::Sender<Arc<MasterConfig>>,
    config_path: Option<PathBuf>,
    shutdown: ShutdownRx,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control").finish_non_exhaustive()
    }
}

impl Control {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<ControlMsg>,
        db: DbHandle,
        driver: mpsc::Sender<DriverMsg>,
        juggler: mpsc::Sender<JugglerCmd>,
        indexer: mpsc::Sender<IndexerEvent>,
        config_tx: watch::Sender<Arc<MasterConfig>>,
        config_path: Option<PathBuf>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            rx,
            db,
            driver,
            juggler,
            indexer,
            config_tx,
            config_path,
            shutdown,
        }
    }

    pub async fn run(mut self) {
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
                _ = super::wait_shutdown(&mut shutdown) => break,
            }
        }
        debug!("control endpoint stopped");
    }

    async fn dispatch(
        &mut self,
        request: ControlRequest,
    ) -> ControlResponse {
        info!(?request, "control command");
        match request {
            ControlRequest::Pause => {
                self.to_driver(DriverMsg::Pause).await
            }
            ControlRequest::Resume => {
                self.to_driver(DriverMsg::Resume).await
            }
            ControlRequest::KillSlave { slave_id } => {
                self.to_driver(DriverMsg::Kill { slave: slave_id })
                    .await
            }

            ControlRequest::SkipPackage { package, reason } => {
                self.skip(
                    DbOp::SkipPackage {
                        package: package.clone(),
                        reason: SkipReason::because(reason),
                    },
                    package,
                    None,
                )
                .await
            }
            ControlRequest::SkipVersion {
                package,
                version,
                reason,
            } => {
                self.skip(
                    DbOp::SkipPackageVersion {
                        package: package.clone(),
                        version: version.clone(),
                        reason: SkipReason::because(reason),
                    },
                    package,
                    Some(version),
                )
                .await
            }
            ControlRequest::UnskipPackage { package } => {
                self.unskip(
                    DbOp::UnskipPackage {
                        package: package.clone(),
                    },
                    package,
                )
                .await
            }
            ControlRequest::UnskipVersion { package, version } => {
                self.unskip(
                    DbOp::UnskipPackageVersion {
                        package: package.clone(),
                        version,
                    },
                    package,
                )
                .await
            }

            ControlRequest::Rebuild { package, version } => {
                self.rebuild(package, version).await
            }
            ControlRequest::DeleteBuild { build_id } => {
                self.delete_build(build_id).await
            }

            ControlRequest::Stats => {
                match self.db.call(DbOp::GetStatistics).await {
                    Ok(DbReply::Statistics(stats)) => {
                        ControlResponse::Stats { stats }
                    }
                    Ok(other) => unexpected(&other),
                    Err(err) => failure(&err),
                }
            }
            ControlRequest::ListSlaves => {
                let (reply, rx) = oneshot::channel();
                if self
                    .driver
                    .send(DriverMsg::ListSlaves { reply })
                    .await
                    .is_err()
                {
                    return ControlResponse::Error {
                        message: "slave driver unavailable".to_string(),
                    };
                }
                match rx.await {
                    Ok(slaves) => ControlResponse::Slaves { slaves },
                    Err(_) => ControlResponse::Error {
                        message: "slave driver unavailable".to_string(),
                    },
                }
            }

            ControlRequest::ReloadConfig => self.reload_config(),
        }
    }

    async fn to_driver(&self, msg: DriverMsg) -> ControlResponse {
        if self.driver.send(msg).await.is_err() {
            return ControlResponse::Error {
                message: "slave driver unavailable".to_string(),
            };
        }
        ControlResponse::Ok
    }

    /// Commits the skip, aborts any matching in-flight build, and queues
    /// the page rewrites.
    async fn skip(
        &self,
        op: DbOp,
        package: PackageName,
        version: Option<VersionString>,
    ) -> ControlResponse {
        if let Err(err) = self.db.call(op).await {
            return failure(&err);
        }
        let _ = self
            .driver
            .send(DriverMsg::Abort {
                package: package.clone(),
                version,
            })
            .await;
        self.touch_package(package).await;
        ControlResponse::Ok
    }

    async fn unskip(
        &self,
        op: DbOp,
        package: PackageName,
    ) -> ControlResponse {
        if let Err(err) = self.db.call(op).await {
            return failure(&err);
        }
        self.touch_package(package).await;
        ControlResponse::Ok
    }

    /// Deletes every recorded build of the version that produced files,
    /// returning it to the pending queue.
    async fn rebuild(
        &self,
        package: PackageName,
        version: VersionString,
    ) -> ControlResponse {
        let ids = match self
            .db
            .call(DbOp::GetVersionBuildIds {
                package: package.clone(),
                version: version.clone(),
            })
            .await
        {
            Ok(DbReply::BuildIds(ids)) => ids,
            Ok(other) => return unexpected(&other),
            Err(err) => return failure(&err),
        };
        if ids.is_empty() {
            return ControlResponse::Error {
                message: format!(
                    "no recorded builds for {package} {version}"
                ),
            };
        }
        for build_id in ids {
            if let ControlResponse::Error { message } =
                self.delete_build(build_id).await
            {
                return ControlResponse::Error { message };
            }
        }
        info!(%package, %version, "version queued for rebuild");
        ControlResponse::Ok
    }

    async fn delete_build(&self, build_id: BuildId) -> ControlResponse {
        let deleted = match self
            .db
            .call(DbOp::DeleteBuild { build_id })
            .await
        {
            Ok(DbReply::BuildDeleted(Some(deleted))) => deleted,
            Ok(DbReply::BuildDeleted(None)) => {
                return ControlResponse::Error {
                    message: format!("no such build: {build_id}"),
                };
            }
            Ok(other) => return unexpected(&other),
            Err(err) => return failure(&err),
        };
        let DeletedBuild {
            package,
            version,
            filenames,
        } = deleted;
        info!(
            %build_id, %package, %version,
            files = filenames.len(),
            "build deleted"
        );
        if !filenames.is_empty()
            && self
                .juggler
                .send(JugglerCmd::Remove {
                    package: package.clone(),
                    filenames,
                })
                .await
                .is_err()
        {
            warn!("file juggler unavailable for file removal");
        }
        if self
            .indexer
            .send(IndexerEvent::BuildDeleted { package })
            .await
            .is_err()
        {
            warn!("indexer unavailable for rewrite");
        }
        ControlResponse::Ok
    }

    async fn touch_package(&self, package: PackageName) {
        if self
            .indexer
            .send(IndexerEvent::PackageTouched { package })
            .await
            .is_err()
        {
            warn!("indexer unavailable for rewrite");
        }
    }

    fn reload_config(&mut self) -> ControlResponse {
        match wheelhouse_config::load(self.config_path.as_deref()) {
            Ok(config) => {
                info!("configuration reloaded");
                self.config_tx.send_replace(Arc::new(config));
                ControlResponse::Ok
            }
            Err(err) => ControlResponse::Error {
                message: err.to_string(),
            },
        }
    }
}

fn failure(err: &DbError) -> ControlResponse {
    ControlResponse::Error {
        message: err.to_string(),
    }
}

fn unexpected(reply: &DbReply) -> ControlResponse {
    ControlResponse::Error {
        message: format!("unexpected database reply: {reply:?}"),
    }
}

/// Serves one control connection; requests are handled strictly in
/// order.
pub async fn serve_control<S>(
    stream: S,
    control: mpsc::Sender<ControlMsg>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed: JsonFramed<S, ControlRequest, ControlResponse> =
        JsonFramed::new(stream);
    while let Some(request) = framed.recv().await? {
        let (reply, response) = oneshot::channel();
        if control
            .send(ControlMsg { request, reply })
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
