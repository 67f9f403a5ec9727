//! Database broker and worker pool.
//!
//! Producers hold a [`DbHandle`] and see a single request/reply interface;
//! behind it the broker pairs pending envelopes with idle workers FIFO.
//! Each worker owns exactly one Postgres connection, runs one transaction
//! per request, and reconnects on transient failures before rejoining the
//! idle queue.

use std::collections::VecDeque;
use std::time::Duration;

use sqlx::{Connection, PgConnection};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wheelhouse_core::db::{DbError, DbOp, DbReply, execute};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// A tagged envelope: one operation, one reply channel.
#[derive(Debug)]
pub struct DbRequest {
    pub op: DbOp,
    pub reply: oneshot::Sender<Result<DbReply, DbError>>,
}

/// Cloneable front door to the worker pool.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<DbRequest>,
}

impl DbHandle {
    pub fn new(tx: mpsc::Sender<DbRequest>) -> Self {
        Self { tx }
    }

    pub async fn call(&self, op: DbOp) -> Result<DbReply, DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbRequest { op, reply })
            .await
            .map_err(|_| {
                DbError::Other("database broker is gone".to_string())
            })?;
        rx.await.map_err(|_| {
            DbError::Other("database worker dropped the request".to_string())
        })?
    }
}

/// Spawns the broker and its workers; the pool winds down once every
/// [`DbHandle`] clone has been dropped.
pub fn spawn_pool(url: &str, workers: usize) -> (DbHandle, JoinHandle<()>) {
    let (req_tx, req_rx) = mpsc::channel(256);
    let (idle_tx, idle_rx) = mpsc::channel(workers.max(1));

    let mut mailboxes = Vec::with_capacity(workers);
    for index in 0..workers {
        let (tx, rx) = mpsc::channel(1);
        mailboxes.push(tx);
        let worker = Worker {
            index,
            url: url.to_string(),
            rx,
            idle_tx: idle_tx.clone(),
        };
        tokio::spawn(worker.run());
    }
    drop(idle_tx);

    let broker = Broker {
        requests: req_rx,
        idle: idle_rx,
        workers: mailboxes,
        pending: VecDeque::new(),
        free: (0..workers).collect(),
    };
    let join = tokio::spawn(broker.run());
    (DbHandle::new(req_tx), join)
}

struct Broker {
    requests: mpsc::Receiver<DbRequest>,
    idle: mpsc::Receiver<usize>,
    workers: Vec<mpsc::Sender<DbRequest>>,
    pending: VecDeque<DbRequest>,
    free: VecDeque<usize>,
}

impl Broker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                req = self.requests.recv() => match req {
                    Some(req) => {
                        self.pending.push_back(req);
                        self.dispatch();
                    }
                    // Every handle dropped: nothing more can arrive.
                    None => break,
                },
                idle = self.idle.recv() => match idle {
                    Some(index) => {
                        self.free.push_back(index);
                        self.dispatch();
                    }
                    None => break,
                },
            }
        }

        // Serve whatever is still queued before tearing the workers down.
        while !self.pending.is_empty() {
            match self.idle.recv().await {
                Some(index) => {
                    self.free.push_back(index);
                    self.dispatch();
                }
                None => break,
            }
        }
        debug!("database broker stopped");
    }

    fn dispatch(&mut self) {
        while !self.pending.is_empty() && !self.free.is_empty() {
            let Some(index) = self.free.pop_front() else { break };
            let Some(req) = self.pending.pop_front() else {
                self.free.push_front(index);
                break;
            };
            // An idle worker's mailbox (capacity 1) is empty, so the only
            // failure here is a dead worker.
            if let Err(err) = self.workers[index].try_send(req) {
                let req = match err {
                    mpsc::error::TrySendError::Full(req)
                    | mpsc::error::TrySendError::Closed(req) => req,
                };
                warn!(worker = index, "database worker unavailable");
                let _ = req.reply.send(Err(DbError::Other(
                    "database worker unavailable".to_string(),
                )));
            }
        }
    }
}

struct Worker {
    index: usize,
    url: String,
    rx: mpsc::Receiver<DbRequest>,
    idle_tx: mpsc::Sender<usize>,
}

impl Worker {
    async fn run(mut self) {
        let mut conn = match self.connect().await {
            Some(conn) => conn,
            None => return,
        };
        info!(worker = self.index, "database worker connected");

        while let Some(req) = self.rx.recv().await {
            let mut result = execute(&mut conn, &req.op).await;
            if matches!(&result, Err(err) if err.is_transient()) {
                warn!(
                    worker = self.index,
                    "transient database error; reconnecting"
                );
                match self.connect().await {
                    Some(fresh) => {
                        let stale = std::mem::replace(&mut conn, fresh);
                        let _ = stale.close().await;
                        result = execute(&mut conn, &req.op).await;
                    }
                    None => {
                        let _ = req.reply.send(result);
                        return;
                    }
                }
            }
            let _ = req.reply.send(result);
            if self.idle_tx.send(self.index).await.is_err() {
                break;
            }
        }
        let _ = conn.close().await;
        debug!(worker = self.index, "database worker stopped");
    }

    /// Connects with unbounded retry; gives up only when the pool is
    /// being torn down (mailbox closed).
    async fn connect(&mut self) -> Option<PgConnection> {
        loop {
            match PgConnection::connect(&self.url).await {
                Ok(conn) => return Some(conn),
                Err(err) => {
                    warn!(
                        worker = self.index,
                        %err,
                        "database connection failed; retrying"
                    );
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    if self.rx.is_closed() {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use wheelhouse_model::PackageName;

    use super::*;

    #[tokio::test]
    async fn call_fails_cleanly_when_broker_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = DbHandle::new(tx);
        let result = handle
            .call(DbOp::GetPackageFiles {
                package: PackageName::new("foo").unwrap(),
            })
            .await;
        assert!(matches!(result, Err(DbError::Other(_))));
    }
}
