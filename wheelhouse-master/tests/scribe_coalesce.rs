//! Scribe coalescing: bursts of rewrite notifications for one target
//! produce exactly one database fetch and one rendered file per poll
//! cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use wheelhouse_config::PathsConfig;
use wheelhouse_core::db::{DbOp, DbReply, PackageFile};
use wheelhouse_master::tasks::db::{DbHandle, DbRequest};
use wheelhouse_master::tasks::scribe::{Scribe, ScribeCmd};
use wheelhouse_model::PackageName;

fn pkg(name: &str) -> PackageName {
    PackageName::new(name).unwrap()
}

/// A broker stand-in that counts package-file fetches.
fn fake_db(counter: Arc<AtomicUsize>) -> DbHandle {
    let (tx, mut rx) = mpsc::channel::<DbRequest>(64);
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let reply = match &req.op {
                DbOp::GetPackageFiles { .. } => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    DbReply::PackageFiles(vec![PackageFile {
                        filename: "foo-1.0-py3-none-any.whl".to_string(),
                        filesize: 11,
                        filehash: "deadbeef".to_string(),
                    }])
                }
                DbOp::GetProjectFiles { .. } => {
                    DbReply::ProjectFiles(vec![])
                }
                DbOp::GetIndexPackages => DbReply::IndexPackages(vec![]),
                _ => DbReply::Done,
            };
            let _ = req.reply.send(Ok(reply));
        }
    });
    DbHandle::new(tx)
}

#[tokio::test]
async fn burst_of_rewrites_coalesces_to_one_write() {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        output_root: dir.path().to_path_buf(),
    };
    let fetches = Arc::new(AtomicUsize::new(0));
    let db = fake_db(fetches.clone());

    let (tx, rx) = mpsc::channel(64);
    let scribe =
        Scribe::new(rx, db, paths.clone(), Duration::from_millis(50));
    let scribe_task = tokio::spawn(scribe.run());

    for _ in 0..5 {
        tx.send(ScribeCmd::RewritePackage(pkg("foo"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        fetches.load(Ordering::SeqCst),
        1,
        "five notifications within one cycle must fetch once"
    );
    let page = std::fs::read_to_string(
        paths.simple_dir().join("foo").join("index.html"),
    )
    .unwrap();
    assert!(page.contains("foo-1.0-py3-none-any.whl"));

    // A second burst in a later cycle triggers exactly one more.
    for _ in 0..3 {
        tx.send(ScribeCmd::RewritePackage(pkg("foo"))).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    drop(tx);
    scribe_task.await.unwrap();
}

#[tokio::test]
async fn root_rewrite_is_skipped_when_body_is_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathsConfig {
        output_root: dir.path().to_path_buf(),
    };
    let fetches = Arc::new(AtomicUsize::new(0));
    let db = fake_db(fetches.clone());

    let (tx, rx) = mpsc::channel(64);
    let scribe =
        Scribe::new(rx, db, paths.clone(), Duration::from_millis(50));
    let scribe_task = tokio::spawn(scribe.run());

    tx.send(ScribeCmd::RewriteRoot).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let root = paths.simple_dir().join("index.html");
    let first_written = std::fs::metadata(&root).unwrap().modified().unwrap();

    tx.send(ScribeCmd::RewriteRoot).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second_written =
        std::fs::metadata(&root).unwrap().modified().unwrap();

    // Same package set renders the same body; the file is not replaced.
    assert_eq!(first_written, second_written);

    drop(tx);
    scribe_task.await.unwrap();
}
