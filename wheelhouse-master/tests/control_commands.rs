//! Control endpoint walk: commands arrive framed over the socket, fan
//! out as typed messages to the responsible actors, and answer the
//! caller synchronously.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use wheelhouse_config::MasterConfig;
use wheelhouse_core::db::{DbOp, DbReply, DeletedBuild};
use wheelhouse_master::proto::control::{ControlRequest, ControlResponse};
use wheelhouse_master::proto::framing::JsonFramed;
use wheelhouse_master::tasks::control::{Control, serve_control};
use wheelhouse_master::tasks::db::{DbHandle, DbRequest};
use wheelhouse_master::tasks::indexer::IndexerEvent;
use wheelhouse_master::tasks::juggler::JugglerCmd;
use wheelhouse_master::tasks::shutdown_channel;
use wheelhouse_master::tasks::slave_driver::DriverMsg;
use wheelhouse_model::{
    BuildId, MasterStats, PackageName, VersionString,
};

fn pkg(name: &str) -> PackageName {
    PackageName::new(name).unwrap()
}

/// Broker stand-in that records mutating ops and answers the rest.
fn fake_db(seen: mpsc::Sender<DbOp>) -> DbHandle {
    let (tx, mut rx) = mpsc::channel::<DbRequest>(32);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let reply = match &req.op {
                DbOp::GetStatistics => {
                    DbReply::Statistics(MasterStats::default())
                }
                DbOp::DeleteBuild { .. } => {
                    DbReply::BuildDeleted(Some(DeletedBuild {
                        package: pkg("foo"),
                        version: VersionString::from("1.0"),
                        filenames: vec![
                            "foo-1.0-py3-none-any.whl".to_string(),
                        ],
                    }))
                }
                _ => DbReply::Done,
            };
            let _ = seen.send(req.op.clone()).await;
            let _ = req.reply.send(Ok(reply));
        }
    });
    DbHandle::new(tx)
}

struct Harness {
    client: JsonFramed<
        tokio::io::DuplexStream,
        ControlResponse,
        ControlRequest,
    >,
    ops_rx: mpsc::Receiver<DbOp>,
    driver_rx: mpsc::Receiver<DriverMsg>,
    juggler_rx: mpsc::Receiver<JugglerCmd>,
    indexer_rx: mpsc::Receiver<IndexerEvent>,
}

fn harness() -> Harness {
    let (ops_tx, ops_rx) = mpsc::channel(32);
    let (driver_tx, driver_rx) = mpsc::channel(32);
    let (juggler_tx, juggler_rx) = mpsc::channel(32);
    let (indexer_tx, indexer_rx) = mpsc::channel(32);
    let (control_tx, control_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    std::mem::forget(shutdown_tx);
    let (config_tx, _config_rx) =
        watch::channel(Arc::new(MasterConfig::default()));

    let control = Control::new(
        control_rx,
        fake_db(ops_tx),
        driver_tx,
        juggler_tx,
        indexer_tx,
        config_tx,
        None,
        shutdown_rx,
    );
    tokio::spawn(control.run());

    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_control(server, control_tx));
    Harness {
        client: JsonFramed::new(client),
        ops_rx,
        driver_rx,
        juggler_rx,
        indexer_rx,
    }
}

async fn call(
    harness: &mut Harness,
    request: ControlRequest,
) -> ControlResponse {
    harness.client.send(&request).await.unwrap();
    harness.client.recv().await.unwrap().expect("a response")
}

#[tokio::test]
async fn skip_version_commits_aborts_and_rewrites() {
    let mut harness = harness();
    let response = call(
        &mut harness,
        ControlRequest::SkipVersion {
            package: pkg("foo"),
            version: VersionString::from("1.0"),
            reason: "bad-build".to_string(),
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Ok);

    match harness.ops_rx.recv().await.unwrap() {
        DbOp::SkipPackageVersion {
            package,
            version,
            reason,
        } => {
            assert_eq!(package, pkg("foo"));
            assert_eq!(version, VersionString::from("1.0"));
            assert_eq!(reason.as_str(), "bad-build");
        }
        other => panic!("unexpected op: {other:?}"),
    }
    match harness.driver_rx.recv().await.unwrap() {
        DriverMsg::Abort { package, version } => {
            assert_eq!(package, pkg("foo"));
            assert_eq!(version, Some(VersionString::from("1.0")));
        }
        other => panic!("unexpected driver message: {other:?}"),
    }
    match harness.indexer_rx.recv().await.unwrap() {
        IndexerEvent::PackageTouched { package } => {
            assert_eq!(package, pkg("foo"));
        }
        other => panic!("unexpected indexer event: {other:?}"),
    }
}

#[tokio::test]
async fn delete_build_cleans_files_and_rewrites() {
    let mut harness = harness();
    let response = call(
        &mut harness,
        ControlRequest::DeleteBuild {
            build_id: BuildId(42),
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Ok);

    match harness.juggler_rx.recv().await.unwrap() {
        JugglerCmd::Remove { package, filenames } => {
            assert_eq!(package, pkg("foo"));
            assert_eq!(
                filenames,
                vec!["foo-1.0-py3-none-any.whl".to_string()]
            );
        }
        other => panic!("unexpected juggler command: {other:?}"),
    }
    match harness.indexer_rx.recv().await.unwrap() {
        IndexerEvent::BuildDeleted { package } => {
            assert_eq!(package, pkg("foo"));
        }
        other => panic!("unexpected indexer event: {other:?}"),
    }
}

#[tokio::test]
async fn stats_answers_synchronously() {
    let mut harness = harness();
    let response = call(&mut harness, ControlRequest::Stats).await;
    assert_eq!(
        response,
        ControlResponse::Stats {
            stats: MasterStats::default()
        }
    );
}

#[tokio::test]
async fn pause_and_resume_reach_the_driver() {
    let mut harness = harness();
    assert_eq!(
        call(&mut harness, ControlRequest::Pause).await,
        ControlResponse::Ok
    );
    assert_eq!(
        call(&mut harness, ControlRequest::Resume).await,
        ControlResponse::Ok
    );
    assert!(matches!(
        harness.driver_rx.recv().await.unwrap(),
        DriverMsg::Pause
    ));
    assert!(matches!(
        harness.driver_rx.recv().await.unwrap(),
        DriverMsg::Resume
    ));
}
