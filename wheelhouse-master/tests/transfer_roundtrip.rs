//! Upload round-trip through the file juggler: the bytes received match
//! the bytes sent, the recomputed hash gates installation, and hash
//! mismatches retry up to the cap before failing the build.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use wheelhouse_config::PathsConfig;
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_master::proto::transfer::{
    CHUNK_SIZE, TransferIn, TransferOut, TransferVerdict, UploaderCodec,
};
use wheelhouse_master::store::ArtifactStore;
use wheelhouse_master::tasks::db::{DbHandle, DbRequest};
use wheelhouse_master::tasks::juggler::{
    FileJuggler, JugglerCmd, serve_transfer,
};
use wheelhouse_master::tasks::secretary::{Event, SecretaryHandle};
use wheelhouse_master::tasks::slave_driver::DriverMsg;
use wheelhouse_model::{
    AbiTag, BuildArtifact, BuildAttempt, BuildStatus, PackageName,
    PlatformTag, PyTag, SlaveId, VersionString,
};

const FILENAME: &str = "foo-1.0-cp39-cp39m-linux_armv7l.whl";

fn fake_db() -> DbHandle {
    let (tx, mut rx) = mpsc::channel::<DbRequest>(16);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let reply = match &req.op {
                DbOp::VersionSkipped { .. } => DbReply::Skipped(false),
                _ => DbReply::Done,
            };
            let _ = req.reply.send(Ok(reply));
        }
    });
    DbHandle::new(tx)
}

fn attempt() -> BuildAttempt {
    BuildAttempt {
        build_id: None,
        package: PackageName::new("foo").unwrap(),
        version: VersionString::from("1.0"),
        abi_tag: AbiTag::from("cp39m"),
        built_by: "testslave".to_string(),
        duration: Duration::from_secs(7),
        status: BuildStatus::Success,
        started_at: chrono::Utc::now(),
        output: "ok".to_string(),
    }
}

fn artifact(data: &[u8], hash: &str) -> BuildArtifact {
    BuildArtifact {
        filename: FILENAME.to_string(),
        filesize: data.len() as u64,
        filehash: hash.to_string(),
        package_tag: "foo".to_string(),
        package_version_tag: "1.0".to_string(),
        py_version_tag: PyTag::from("cp39"),
        abi_tag: AbiTag::from("cp39m"),
        platform_tag: PlatformTag::from("linux_armv7l"),
        dependencies: vec![],
    }
}

struct Harness {
    juggler_tx: mpsc::Sender<JugglerCmd>,
    secretary_rx: mpsc::Receiver<Event>,
    driver_rx: mpsc::Receiver<DriverMsg>,
    store: ArtifactStore,
    _dir: tempfile::TempDir,
}

async fn harness(transfer_retries: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        output_root: dir.path().to_path_buf(),
    };
    let store = ArtifactStore::new(&paths);
    store.ensure_layout().await.unwrap();

    let (juggler_tx, juggler_rx) = mpsc::channel(32);
    let (secretary_tx, secretary_rx) = mpsc::channel(32);
    let (driver_tx, driver_rx) = mpsc::channel(32);
    let juggler = FileJuggler::new(
        juggler_rx,
        store.clone(),
        fake_db(),
        SecretaryHandle::new(secretary_tx),
        driver_tx,
        transfer_retries,
    );
    tokio::spawn(juggler.run());
    Harness {
        juggler_tx,
        secretary_rx,
        driver_rx,
        store,
        _dir: dir,
    }
}

/// Streams one file as the uploader and returns the final verdict.
async fn upload(
    framed: &mut tokio_util::codec::Framed<tokio::io::DuplexStream, UploaderCodec>,
    data: &[u8],
) -> TransferVerdict {
    framed
        .send(TransferIn::Send {
            filename: FILENAME.to_string(),
        })
        .await
        .unwrap();
    match framed.next().await.unwrap().unwrap() {
        TransferOut::Fetch { index: 0 } => {}
        other => panic!("expected FETCH 0, got {other:?}"),
    }
    for (index, chunk) in data.chunks(CHUNK_SIZE as usize).enumerate() {
        framed
            .send(TransferIn::Chunk {
                index: index as u32,
                data: Bytes::copy_from_slice(chunk),
            })
            .await
            .unwrap();
    }
    framed.send(TransferIn::Done).await.unwrap();
    match framed.next().await.unwrap().unwrap() {
        TransferOut::Verdict(verdict) => verdict,
        other => panic!("expected a verdict, got {other:?}"),
    }
}

#[tokio::test]
async fn verified_upload_is_installed_and_recorded() {
    // Three chunks, the last one short.
    let data: Vec<u8> =
        (0..(CHUNK_SIZE as usize * 2 + 1234)).map(|i| i as u8).collect();
    let hash = hex::encode(Sha256::digest(&data));

    let mut harness = harness(3).await;
    harness
        .juggler_tx
        .send(JugglerCmd::Expect {
            slave: SlaveId(7),
            attempt: attempt(),
            files: vec![artifact(&data, &hash)],
        })
        .await
        .unwrap();

    let (client, server) = tokio::io::duplex(1 << 20);
    let server_task =
        tokio::spawn(serve_transfer(server, harness.juggler_tx.clone()));
    let mut framed =
        tokio_util::codec::Framed::new(client, UploaderCodec::default());
    framed
        .send(TransferIn::Hello {
            slave_id: SlaveId(7),
        })
        .await
        .unwrap();

    let verdict = upload(&mut framed, &data).await;
    assert_eq!(verdict, TransferVerdict::Ok);

    // The bytes on disk are the bytes sent.
    let package = PackageName::new("foo").unwrap();
    let published = harness.store.published_path(&package, FILENAME);
    assert_eq!(std::fs::read(&published).unwrap(), data);

    // The build flows to the secretary, and the driver learns the
    // transfer settled.
    match harness.secretary_rx.recv().await.unwrap() {
        Event::BuildFinished { attempt, files } => {
            assert_eq!(attempt.status, BuildStatus::Success);
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].filehash, hash);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match harness.driver_rx.recv().await.unwrap() {
        DriverMsg::TransferComplete { slave, success } => {
            assert_eq!(slave, SlaveId(7));
            assert!(success);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    drop(framed);
    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn hash_mismatch_retries_then_fails_the_build() {
    let data = vec![0x55u8; 4096];
    // The announced hash never matches what is uploaded.
    let wrong = "0".repeat(64);

    let mut harness = harness(1).await;
    harness
        .juggler_tx
        .send(JugglerCmd::Expect {
            slave: SlaveId(9),
            attempt: attempt(),
            files: vec![artifact(&data, &wrong)],
        })
        .await
        .unwrap();

    let (client, server) = tokio::io::duplex(1 << 20);
    let server_task =
        tokio::spawn(serve_transfer(server, harness.juggler_tx.clone()));
    let mut framed =
        tokio_util::codec::Framed::new(client, UploaderCodec::default());
    framed
        .send(TransferIn::Hello {
            slave_id: SlaveId(9),
        })
        .await
        .unwrap();

    assert_eq!(upload(&mut framed, &data).await, TransferVerdict::Retry);
    assert_eq!(upload(&mut framed, &data).await, TransferVerdict::Error);

    // The whole build is declared failed.
    match harness.secretary_rx.recv().await.unwrap() {
        Event::BuildFinished { attempt, files } => {
            assert_eq!(attempt.status, BuildStatus::Failed);
            assert!(files.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match harness.driver_rx.recv().await.unwrap() {
        DriverMsg::TransferComplete { success, .. } => {
            assert!(!success);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    // Nothing was published.
    let package = PackageName::new("foo").unwrap();
    assert!(
        !harness.store.published_path(&package, FILENAME).exists()
    );

    drop(framed);
    server_task.await.unwrap().unwrap();
}
