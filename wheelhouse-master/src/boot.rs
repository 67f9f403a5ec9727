//! Process assembly: fatal checks, actor spawning, listener loops, and
//! shutdown propagation.
//!
//! Actors are wired leaves-first so teardown can cascade in reverse:
//! the shutdown watch stops the edge actors and every connection task;
//! the write-side actors (secretary, indexer, scribe, juggler, database
//! pool) then drain naturally as their inbound channels close.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use anyhow::Context;
use sqlx::{Connection, PgConnection};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wheelhouse_config::MasterConfig;

use crate::store::ArtifactStore;
use crate::tasks::cloud_gazer::CloudGazer;
use crate::tasks::control::{Control, serve_control};
use crate::tasks::db::spawn_pool;
use crate::tasks::import_handler::{ImportHandler, serve_import};
use crate::tasks::indexer::Indexer;
use crate::tasks::juggler::{FileJuggler, serve_transfer};
use crate::tasks::lumberjack::serve_logs;
use crate::tasks::scribe::{Scribe, ScribeCmd};
use crate::tasks::secretary::{Secretary, SecretaryHandle};
use crate::tasks::slave_driver::{SlaveDriver, serve_slave};
use crate::tasks::status::{Status, serve_monitor};
use crate::tasks::{self, ShutdownRx};

const JOIN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(
    config: MasterConfig,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    probe_database(&config.database.url).await?;

    let store = ArtifactStore::new(&config.paths);
    store
        .ensure_layout()
        .await
        .context("output tree is not writable")?;
    let purged = store
        .purge_tmp()
        .await
        .context("failed to clean the staging area")?;
    if purged > 0 {
        info!(purged, "staging area cleaned");
    }

    // Listeners bind before anything is spawned; a taken port is fatal.
    let slave_listener = bind(config.net.slave_addr, "slave").await?;
    let file_listener = bind(config.net.file_addr, "file").await?;
    let control_listener =
        bind(config.net.control_addr, "control").await?;
    let status_listener = bind(config.net.status_addr, "status").await?;
    let log_listener = bind(config.net.log_addr, "log").await?;
    let import_listener = bind(config.net.import_addr, "import").await?;

    let (shutdown_tx, shutdown_rx) = tasks::shutdown_channel();
    let (config_tx, config_rx) = watch::channel(Arc::new(config.clone()));

    let (db, db_join) =
        spawn_pool(&config.database.url, config.database.workers);

    let (scribe_tx, scribe_rx) = mpsc::channel(256);
    let (indexer_tx, indexer_rx) = mpsc::channel(256);
    let (secretary_tx, secretary_rx) = mpsc::channel(256);
    let (juggler_tx, juggler_rx) = mpsc::channel(256);
    let (driver_tx, driver_rx) = mpsc::channel(256);
    let (control_tx, control_rx) = mpsc::channel(64);
    let (import_tx, import_rx) = mpsc::channel(64);
    let (status_watch_tx, status_watch_rx) =
        watch::channel(String::new());

    let secretary = SecretaryHandle::new(secretary_tx);
    let ids = Arc::new(AtomicU32::new(1));

    let mut actors: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    actors.push((
        "scribe",
        tokio::spawn(
            Scribe::new(
                scribe_rx,
                db.clone(),
                config.paths.clone(),
                config.timing.scribe_poll,
            )
            .run(),
        ),
    ));
    actors.push((
        "indexer",
        tokio::spawn(Indexer::new(indexer_rx, scribe_tx.clone()).run()),
    ));
    actors.push((
        "secretary",
        tokio::spawn(
            Secretary::new(secretary_rx, db.clone(), indexer_tx.clone())
                .run(),
        ),
    ));
    actors.push((
        "juggler",
        tokio::spawn(
            FileJuggler::new(
                juggler_rx,
                store.clone(),
                db.clone(),
                secretary.clone(),
                driver_tx.clone(),
                config.builds.transfer_retries,
            )
            .run(),
        ),
    ));
    actors.push((
        "slave-driver",
        tokio::spawn(
            SlaveDriver::new(
                driver_rx,
                db.clone(),
                secretary.clone(),
                juggler_tx.clone(),
                config_rx.clone(),
                shutdown_rx.clone(),
                ids.clone(),
            )
            .run(),
        ),
    ));
    actors.push((
        "cloud-gazer",
        tokio::spawn(
            CloudGazer::new(
                db.clone(),
                secretary.clone(),
                config_rx.clone(),
                shutdown_rx.clone(),
            )?
            .run(),
        ),
    ));
    actors.push((
        "status",
        tokio::spawn(
            Status::new(
                db.clone(),
                scribe_tx.clone(),
                status_watch_tx,
                config_rx.clone(),
                shutdown_rx.clone(),
            )
            .run(),
        ),
    ));
    actors.push((
        "control",
        tokio::spawn(
            Control::new(
                control_rx,
                db.clone(),
                driver_tx.clone(),
                juggler_tx.clone(),
                indexer_tx.clone(),
                config_tx,
                config_path,
                shutdown_rx.clone(),
            )
            .run(),
        ),
    ));
    actors.push((
        "import-handler",
        tokio::spawn(
            ImportHandler::new(
                import_rx,
                db.clone(),
                juggler_tx.clone(),
                config_rx.clone(),
                shutdown_rx.clone(),
                ids,
            )
            .run(),
        ),
    ));

    // Listener loops; every connection task also aborts on shutdown.
    let driver_conns = driver_tx.clone();
    actors.push((
        "slave-listener",
        spawn_accept(
            "slave",
            slave_listener,
            shutdown_rx.clone(),
            move |stream| {
                let driver = driver_conns.clone();
                async move {
                    if let Err(err) = serve_slave(stream, driver).await {
                        debug!(%err, "slave connection error");
                    }
                }
            },
        ),
    ));
    let juggler_conns = juggler_tx.clone();
    actors.push((
        "file-listener",
        spawn_accept(
            "file",
            file_listener,
            shutdown_rx.clone(),
            move |stream| {
                let juggler = juggler_conns.clone();
                async move {
                    if let Err(err) =
                        serve_transfer(stream, juggler).await
                    {
                        debug!(%err, "transfer connection error");
                    }
                }
            },
        ),
    ));
    let control_conns = control_tx.clone();
    actors.push((
        "control-listener",
        spawn_accept(
            "control",
            control_listener,
            shutdown_rx.clone(),
            move |stream| {
                let control = control_conns.clone();
                async move {
                    if let Err(err) =
                        serve_control(stream, control).await
                    {
                        debug!(%err, "control connection error");
                    }
                }
            },
        ),
    ));
    actors.push((
        "status-listener",
        spawn_accept(
            "status",
            status_listener,
            shutdown_rx.clone(),
            move |stream| {
                let latest = status_watch_rx.clone();
                async move {
                    if let Err(err) = serve_monitor(stream, latest).await
                    {
                        debug!(%err, "monitor connection error");
                    }
                }
            },
        ),
    ));
    let log_secretary = secretary.clone();
    actors.push((
        "log-listener",
        spawn_accept(
            "log",
            log_listener,
            shutdown_rx.clone(),
            move |stream| {
                let secretary = log_secretary.clone();
                async move { serve_logs(stream, secretary).await }
            },
        ),
    ));
    let import_conns = import_tx.clone();
    actors.push((
        "import-listener",
        spawn_accept(
            "import",
            import_listener,
            shutdown_rx.clone(),
            move |stream| {
                let handler = import_conns.clone();
                async move {
                    if let Err(err) =
                        serve_import(stream, handler).await
                    {
                        debug!(%err, "import connection error");
                    }
                }
            },
        ),
    ));

    // A fresh master publishes an (empty) root index right away.
    let _ = scribe_tx.send(ScribeCmd::RewriteRoot).await;

    info!(
        slave = %config.net.slave_addr,
        file = %config.net.file_addr,
        control = %config.net.control_addr,
        "wheelhouse master running"
    );

    wait_for_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Our own handle clones must go so the close cascade can complete.
    drop(scribe_tx);
    drop(indexer_tx);
    drop(secretary);
    drop(juggler_tx);
    drop(driver_tx);
    drop(control_tx);
    drop(import_tx);
    drop(db);

    for (name, join) in actors {
        match tokio::time::timeout(JOIN_GRACE, join).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(actor = name, %err, "actor panicked"),
            Err(_) => {
                warn!(actor = name, "actor did not stop in time")
            }
        }
    }
    if tokio::time::timeout(JOIN_GRACE, db_join).await.is_err() {
        warn!("database pool did not stop in time");
    }
    info!("clean shutdown");
    Ok(())
}

async fn probe_database(url: &str) -> anyhow::Result<()> {
    let mut conn = PgConnection::connect(url)
        .await
        .context("database unreachable")?;
    sqlx::query("SELECT 1")
        .execute(&mut conn)
        .await
        .context("database probe query failed")?;
    let _ = conn.close().await;
    Ok(())
}

async fn bind(
    addr: std::net::SocketAddr,
    name: &str,
) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {name} socket {addr}"))
}

/// Accept loop for one listener; stops on shutdown and hands each
/// connection a future that is itself raced against shutdown.
fn spawn_accept<F, Fut>(
    name: &'static str,
    listener: TcpListener,
    shutdown: ShutdownRx,
    serve: F,
) -> JoinHandle<()>
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = tasks::wait_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(listener = name, %peer, "connection");
                        let fut = serve(stream);
                        let mut conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = tasks::wait_shutdown(
                                    &mut conn_shutdown) => {}
                                _ = fut => {}
                            }
                        });
                    }
                    Err(err) => {
                        warn!(listener = name, %err, "accept failed");
                        tokio::time::sleep(
                            Duration::from_millis(100),
                        )
                        .await;
                    }
                },
            }
        }
        debug!(listener = name, "listener stopped");
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(%err, "no SIGTERM handler; ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
