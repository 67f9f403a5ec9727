//! Statistics snapshotting and monitor broadcast.
//!
//! Keeps the most recent counters snapshot in a watch channel; monitor
//! connections replay the latest value on attach and then follow
//! updates. Unchanged snapshots are not re-broadcast. Every accepted
//! snapshot is also forwarded to the scribe for `stats.html`.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_model::MasterStats;

use super::db::DbHandle;
use super::scribe::ScribeCmd;
use super::{ConfigRx, ShutdownRx};

pub struct Status {
    db: DbHandle,
    scribe: mpsc::Sender<ScribeCmd>,
    latest: watch::Sender<String>,
    config: ConfigRx,
    shutdown: ShutdownRx,
    last: Option<MasterStats>,
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status").finish_non_exhaustive()
    }
}

impl Status {
    pub fn new(
        db: DbHandle,
        scribe: mpsc::Sender<ScribeCmd>,
        latest: watch::Sender<String>,
        config: ConfigRx,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            db,
            scribe,
            latest,
            config,
            shutdown,
            last: None,
        }
    }

    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            self.refresh().await;
            let interval = self.config.borrow().timing.stats_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = super::wait_shutdown(&mut shutdown) => break,
            }
        }
        debug!("status broadcaster stopped");
    }

    async fn refresh(&mut self) {
        let stats = match self.db.call(DbOp::GetStatistics).await {
            Ok(DbReply::Statistics(stats)) => stats,
            Ok(other) => {
                warn!(?other, "unexpected reply to statistics fetch");
                return;
            }
            Err(err) => {
                warn!(%err, "statistics fetch failed");
                return;
            }
        };
        if self.last.as_ref() == Some(&stats) {
            return;
        }
        match serde_json::to_string(&stats) {
            Ok(line) => {
                self.latest.send_replace(line);
            }
            Err(err) => warn!(%err, "statistics serialization failed"),
        }
        if self
            .scribe
            .send(ScribeCmd::RewriteStats(stats.clone()))
            .await
            .is_err()
        {
            debug!("scribe is gone");
        }
        self.last = Some(stats);
    }
}

/// Serves one attached monitor: the latest snapshot immediately, then
/// every subsequent change, one JSON line each.
pub async fn serve_monitor<S>(
    stream: S,
    mut latest: watch::Receiver<String>,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut stream = stream;
    let mut current = latest.borrow_and_update().clone();
    if !current.is_empty() {
        stream.write_all(current.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    while latest.changed().await.is_ok() {
        current = latest.borrow_and_update().clone();
        stream.write_all(current.as_bytes()).await?;
        stream.write_all(b"\n").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    #[tokio::test]
    async fn monitor_sees_latest_then_updates() {
        let (tx, rx) = watch::channel(String::from("{\"n\":1}"));
        let (server, client) = tokio::io::duplex(1024);

        let task = tokio::spawn(serve_monitor(server, rx));
        let mut reader = BufReader::new(client);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"n\":1}\n");

        tx.send_replace(String::from("{\"n\":2}"));
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"n\":2}\n");

        drop(tx);
        task.await.unwrap().unwrap();
    }
}
