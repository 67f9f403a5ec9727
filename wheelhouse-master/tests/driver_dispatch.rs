//! Slave driver walk-through: registration, dispatch exclusivity,
//! failure requeueing, abort discarding, and kill semantics — against a
//! scripted database broker.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use wheelhouse_config::MasterConfig;
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_master::proto::slave::{MasterResponse, SlaveRequest};
use wheelhouse_master::tasks::db::{DbHandle, DbRequest};
use wheelhouse_master::tasks::juggler::JugglerCmd;
use wheelhouse_master::tasks::secretary::{Event, SecretaryHandle};
use wheelhouse_master::tasks::slave_driver::{DriverMsg, SlaveDriver};
use wheelhouse_master::tasks::shutdown_channel;
use wheelhouse_model::{
    AbiTag, BuildArtifact, BuildStatus, PackageName, PendingBuild,
    PlatformTag, PyTag, SlaveId, SlaveIdentity, VersionString,
};

fn pkg(name: &str) -> PackageName {
    PackageName::new(name).unwrap()
}

fn pending(package: &str, version: &str) -> PendingBuild {
    PendingBuild {
        package: pkg(package),
        version: VersionString::from(version),
    }
}

/// Broker stand-in: always answers the pending query with the same two
/// candidates; the driver's own in-flight tracking provides exclusivity.
fn fake_db() -> DbHandle {
    let (tx, mut rx) = mpsc::channel::<DbRequest>(64);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let reply = match &req.op {
                DbOp::GetPendingBuilds { .. } => {
                    DbReply::PendingBuilds(vec![
                        pending("foo", "1.0"),
                        pending("bar", "2.0"),
                    ])
                }
                _ => DbReply::Done,
            };
            let _ = req.reply.send(Ok(reply));
        }
    });
    DbHandle::new(tx)
}

fn identity(label: &str) -> SlaveIdentity {
    SlaveIdentity {
        label: label.to_string(),
        abi_tag: AbiTag::from("cp39m"),
        platform_tag: PlatformTag::from("linux_armv7l"),
        py_tag: PyTag::from("cp39"),
        os_name: "Linux".to_string(),
        os_version: "11".to_string(),
        board_revision: "c03112".to_string(),
        board_serial: "0000".to_string(),
    }
}

fn wheel(package: &str, version: &str) -> BuildArtifact {
    BuildArtifact {
        filename: format!(
            "{package}-{version}-cp39-cp39m-linux_armv7l.whl"
        ),
        filesize: 42,
        filehash: "f".repeat(64),
        package_tag: package.to_string(),
        package_version_tag: version.to_string(),
        py_version_tag: PyTag::from("cp39"),
        abi_tag: AbiTag::from("cp39m"),
        platform_tag: PlatformTag::from("linux_armv7l"),
        dependencies: vec![],
    }
}

struct Harness {
    driver_tx: mpsc::Sender<DriverMsg>,
    secretary_rx: mpsc::Receiver<Event>,
    juggler_rx: mpsc::Receiver<JugglerCmd>,
}

fn harness() -> Harness {
    let (driver_tx, driver_rx) = mpsc::channel(64);
    let (secretary_tx, secretary_rx) = mpsc::channel(64);
    let (juggler_tx, juggler_rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = shutdown_channel();
    // Leak the sender so the shutdown watch stays open for the test's
    // lifetime.
    std::mem::forget(_shutdown_tx);
    let (config_tx, config_rx) =
        watch::channel(Arc::new(MasterConfig::default()));
    std::mem::forget(config_tx);

    let driver = SlaveDriver::new(
        driver_rx,
        fake_db(),
        SecretaryHandle::new(secretary_tx),
        juggler_tx,
        config_rx,
        shutdown_rx,
        Arc::new(AtomicU32::new(1)),
    );
    tokio::spawn(driver.run());
    Harness {
        driver_tx,
        secretary_rx,
        juggler_rx,
    }
}

async fn rpc(
    driver: &mpsc::Sender<DriverMsg>,
    msg: SlaveRequest,
) -> MasterResponse {
    let (reply, rx) = oneshot::channel();
    driver.send(DriverMsg::Rpc { msg, reply }).await.unwrap();
    rx.await.unwrap()
}

async fn hello(harness: &Harness, label: &str) -> SlaveId {
    match rpc(
        &harness.driver_tx,
        SlaveRequest::Hello {
            timestamp: Utc::now(),
            identity: identity(label),
        },
    )
    .await
    {
        MasterResponse::Hello { slave_id, .. } => slave_id,
        other => panic!("expected HELLO reply, got {other:?}"),
    }
}

async fn idle(harness: &Harness, slave_id: SlaveId) -> MasterResponse {
    rpc(&harness.driver_tx, SlaveRequest::Idle { slave_id }).await
}

#[tokio::test]
async fn two_slaves_get_distinct_builds() {
    let harness = harness();
    let first = hello(&harness, "slave-a").await;
    let second = hello(&harness, "slave-b").await;
    assert_ne!(first, second);

    let a = idle(&harness, first).await;
    let b = idle(&harness, second).await;
    match (&a, &b) {
        (
            MasterResponse::Build {
                package: pa,
                version: va,
            },
            MasterResponse::Build {
                package: pb,
                version: vb,
            },
        ) => {
            assert_ne!(
                (pa, va),
                (pb, vb),
                "the same build must never be assigned twice"
            );
        }
        other => panic!("expected two BUILDs, got {other:?}"),
    }

    // Both candidates are in flight; a third slave has nothing to do.
    let third = hello(&harness, "slave-c").await;
    match idle(&harness, third).await {
        MasterResponse::Sleep { duration } => {
            assert!(duration >= Duration::from_secs(10));
        }
        other => panic!("expected SLEEP, got {other:?}"),
    }
}

#[tokio::test]
async fn successful_build_walks_send_then_done() {
    let mut harness = harness();
    let slave_id = hello(&harness, "slave-a").await;
    let (package, version) = match idle(&harness, slave_id).await {
        MasterResponse::Build { package, version } => (package, version),
        other => panic!("expected BUILD, got {other:?}"),
    };

    let artifact = wheel(package.as_str(), version.as_str());
    let filename = artifact.filename.clone();
    let response = rpc(
        &harness.driver_tx,
        SlaveRequest::Built {
            slave_id,
            status: BuildStatus::Success,
            duration: Duration::from_secs(7),
            output: "compiled fine".to_string(),
            files: vec![artifact],
        },
    )
    .await;
    assert_eq!(response, MasterResponse::Send { filename });

    // The juggler was told what to expect.
    match harness.juggler_rx.recv().await.unwrap() {
        JugglerCmd::Expect { slave, files, .. } => {
            assert_eq!(slave, slave_id);
            assert_eq!(files.len(), 1);
        }
        other => panic!("unexpected juggler command: {other:?}"),
    }

    let response =
        rpc(&harness.driver_tx, SlaveRequest::Sent { slave_id }).await;
    assert_eq!(response, MasterResponse::Done);

    // Once the juggler settles the transfer the assignment leaves the
    // in-flight set; recording happened on the juggler side, not here.
    harness
        .driver_tx
        .send(DriverMsg::TransferComplete {
            slave: slave_id,
            success: true,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_build_is_recorded_and_requeued() {
    let mut harness = harness();
    let slave_id = hello(&harness, "slave-a").await;
    let (package, version) = match idle(&harness, slave_id).await {
        MasterResponse::Build { package, version } => (package, version),
        other => panic!("expected BUILD, got {other:?}"),
    };

    let response = rpc(
        &harness.driver_tx,
        SlaveRequest::Built {
            slave_id,
            status: BuildStatus::Failed,
            duration: Duration::from_secs(3),
            output: "gcc: internal compiler error".to_string(),
            files: vec![],
        },
    )
    .await;
    assert_eq!(response, MasterResponse::Done);

    // The failed attempt is recorded with no files.
    match harness.secretary_rx.recv().await.unwrap() {
        Event::BuildFinished { attempt, files } => {
            assert_eq!(attempt.package, package);
            assert_eq!(attempt.version, version);
            assert_eq!(attempt.status, BuildStatus::Failed);
            assert!(files.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The version is pending again: within the next dispatches the same
    // build comes around once more.
    let mut seen = Vec::new();
    for _ in 0..2 {
        match idle(&harness, slave_id).await {
            MasterResponse::Build { package, version } => {
                seen.push((package, version));
                let response = rpc(
                    &harness.driver_tx,
                    SlaveRequest::Built {
                        slave_id,
                        status: BuildStatus::Failed,
                        duration: Duration::from_secs(1),
                        output: String::new(),
                        files: vec![],
                    },
                )
                .await;
                assert_eq!(response, MasterResponse::Done);
            }
            other => panic!("expected BUILD, got {other:?}"),
        }
    }
    assert!(
        seen.contains(&(package, version)),
        "the failed build must be dispatched again"
    );
}

#[tokio::test]
async fn aborted_build_is_discarded_without_recording() {
    let mut harness = harness();
    let slave_id = hello(&harness, "slave-a").await;
    let (package, version) = match idle(&harness, slave_id).await {
        MasterResponse::Build { package, version } => (package, version),
        other => panic!("expected BUILD, got {other:?}"),
    };

    harness
        .driver_tx
        .send(DriverMsg::Abort {
            package: package.clone(),
            version: Some(version.clone()),
        })
        .await
        .unwrap();

    let response = rpc(
        &harness.driver_tx,
        SlaveRequest::Built {
            slave_id,
            status: BuildStatus::Success,
            duration: Duration::from_secs(7),
            output: "too late".to_string(),
            files: vec![wheel(package.as_str(), version.as_str())],
        },
    )
    .await;
    assert_eq!(response, MasterResponse::Done);

    // No juggler expectation, no recording.
    assert!(harness.juggler_rx.try_recv().is_err());
    assert!(harness.secretary_rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_and_killed_slaves_are_told_to_die() {
    let harness = harness();
    assert_eq!(
        idle(&harness, SlaveId(999)).await,
        MasterResponse::Die
    );

    let slave_id = hello(&harness, "slave-a").await;
    harness
        .driver_tx
        .send(DriverMsg::Kill { slave: slave_id })
        .await
        .unwrap();
    assert_eq!(idle(&harness, slave_id).await, MasterResponse::Die);
    // The id is retired; a later message from it is also fatal.
    assert_eq!(idle(&harness, slave_id).await, MasterResponse::Die);
}

#[tokio::test]
async fn paused_dispatch_sends_slaves_to_sleep() {
    let harness = harness();
    let slave_id = hello(&harness, "slave-a").await;
    harness.driver_tx.send(DriverMsg::Pause).await.unwrap();
    match idle(&harness, slave_id).await {
        MasterResponse::Sleep { .. } => {}
        other => panic!("expected SLEEP, got {other:?}"),
    }

    harness.driver_tx.send(DriverMsg::Resume).await.unwrap();
    match idle(&harness, slave_id).await {
        MasterResponse::Build { .. } => {}
        other => panic!("expected BUILD, got {other:?}"),
    }
}
