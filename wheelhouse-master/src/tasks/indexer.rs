//! Reactive bridge between database mutations and the scribe.
//!
//! Deliberately tiny: it only knows which pages a mutation can affect.
//! The scribe's coalescing set absorbs duplicate targets, so being
//! generous here costs nothing.

use tokio::sync::mpsc;
use tracing::debug;
use wheelhouse_model::PackageName;

use super::scribe::ScribeCmd;

#[derive(Debug, Clone)]
pub enum IndexerEvent {
    BuildLogged { package: PackageName },
    BuildDeleted { package: PackageName },
    /// Skip state changed; root membership and the project page may have
    /// moved.
    PackageTouched { package: PackageName },
}

#[derive(Debug)]
pub struct Indexer {
    rx: mpsc::Receiver<IndexerEvent>,
    scribe: mpsc::Sender<ScribeCmd>,
}

impl Indexer {
    pub fn new(
        rx: mpsc::Receiver<IndexerEvent>,
        scribe: mpsc::Sender<ScribeCmd>,
    ) -> Self {
        Self { rx, scribe }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let package = match event {
                IndexerEvent::BuildLogged { package }
                | IndexerEvent::BuildDeleted { package }
                | IndexerEvent::PackageTouched { package } => package,
            };
            for cmd in [
                ScribeCmd::RewritePackage(package.clone()),
                ScribeCmd::RewriteProject(package.clone()),
                ScribeCmd::RewriteRoot,
            ] {
                if self.scribe.send(cmd).await.is_err() {
                    debug!("scribe is gone; indexer stopping");
                    return;
                }
            }
        }
        debug!("indexer stopped");
    }
}
