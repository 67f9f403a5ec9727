//! Slave lifecycle management and build dispatch.
//!
//! One state machine per slave plus the global dispatch bookkeeping:
//! which `(package, version, abi)` triples are in flight, what is queued
//! per ABI, and which slaves have gone quiet. The protocol is strictly
//! request/response per slave; the driver never initiates traffic, it
//! only answers, so every decision happens inside `handle`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wheelhouse_core::db::{DbOp, DbReply};
use wheelhouse_model::{
    AbiTag, BuildArtifact, BuildAttempt, BuildStatus, PackageName,
    PendingBuild, SlaveId, SlaveIdentity, VersionString, WheelFilename,
};

use crate::proto::ProtocolError;
use crate::proto::control::SlaveSnapshot;
use crate::proto::framing::JsonFramed;
use crate::proto::slave::{MasterResponse, SlaveRequest};
use super::db::DbHandle;
use super::juggler::JugglerCmd;
use super::secretary::{Event, SecretaryHandle};
use super::{ConfigRx, ShutdownRx};

/// Timeout sweep cadence.
const TICK: Duration = Duration::from_secs(10);
/// How long the drain loop keeps answering after shutdown is signalled.
const DRAIN_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum DriverMsg {
    /// One slave message awaiting its single reply.
    Rpc {
        msg: SlaveRequest,
        reply: oneshot::Sender<MasterResponse>,
    },
    /// Juggler: the upload phase of this slave's build concluded.
    TransferComplete { slave: SlaveId, success: bool },
    Pause,
    Resume,
    Kill { slave: SlaveId },
    /// A package (or one version of it) was deprecated mid-build; tagged
    /// assignments are discarded at the slave's next report.
    Abort {
        package: PackageName,
        version: Option<VersionString>,
    },
    ListSlaves {
        reply: oneshot::Sender<Vec<SlaveSnapshot>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Assignment {
    package: PackageName,
    version: VersionString,
    abi: AbiTag,
}

impl Assignment {
    fn key(&self) -> (PackageName, VersionString, AbiTag) {
        (self.package.clone(), self.version.clone(), self.abi.clone())
    }
}

#[derive(Debug)]
enum SlaveState {
    Idle,
    Building {
        assignment: Assignment,
        aborted: bool,
    },
    Sending {
        assignment: Assignment,
        remaining: VecDeque<String>,
        aborted: bool,
    },
}

impl SlaveState {
    fn name(&self) -> &'static str {
        match self {
            SlaveState::Idle => "idle",
            SlaveState::Building { .. } => "building",
            SlaveState::Sending { .. } => "sending",
        }
    }
}

#[derive(Debug)]
struct SlaveRecord {
    identity: SlaveIdentity,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    misses: u32,
    kill: bool,
    state: SlaveState,
}

pub struct SlaveDriver {
    rx: mpsc::Receiver<DriverMsg>,
    db: DbHandle,
    secretary: SecretaryHandle,
    juggler: mpsc::Sender<JugglerCmd>,
    config: ConfigRx,
    shutdown: ShutdownRx,
    ids: Arc<AtomicU32>,
    slaves: HashMap<SlaveId, SlaveRecord>,
    /// Assignments whose upload phase finished at the slave but whose
    /// recording has not been confirmed by the juggler yet.
    transfers: HashMap<SlaveId, Assignment>,
    in_flight: HashSet<(PackageName, VersionString, AbiTag)>,
    aborted: HashSet<(PackageName, Option<VersionString>)>,
    pending: HashMap<AbiTag, VecDeque<PendingBuild>>,
    paused: bool,
}

impl std::fmt::Debug for SlaveDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveDriver")
            .field("slaves", &self.slaves.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl SlaveDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<DriverMsg>,
        db: DbHandle,
        secretary: SecretaryHandle,
        juggler: mpsc::Sender<JugglerCmd>,
        config: ConfigRx,
        shutdown: ShutdownRx,
        ids: Arc<AtomicU32>,
    ) -> Self {
        Self {
            rx,
            db,
            secretary,
            juggler,
            config,
            shutdown,
            ids,
            slaves: HashMap::new(),
            transfers: HashMap::new(),
            in_flight: HashSet::new(),
            aborted: HashSet::new(),
            pending: HashMap::new(),
            paused: false,
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
                    Some(msg) => self.handle(msg).await,
                    None => return,
                },
                _ = tick.tick() => self.check_timeouts().await,
                _ = super::wait_shutdown(&mut shutdown) => break,
            }
        }
        self.drain().await;
        debug!("slave driver stopped");
    }

    /// Keeps answering briefly after shutdown so slaves mid-exchange hear
    /// `DONE`/`DIE` instead of a dropped socket.
    async fn drain(&mut self) {
        loop {
            match tokio::time::timeout(DRAIN_WINDOW, self.rx.recv()).await
            {
                Ok(Some(DriverMsg::Rpc { msg, reply })) => {
                    let response = match &msg {
                        SlaveRequest::Built { .. }
                        | SlaveRequest::Sent { .. } => {
                            MasterResponse::Done
                        }
                        _ => MasterResponse::Die,
                    };
                    let _ = reply.send(response);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    async fn handle(&mut self, msg: DriverMsg) {
        match msg {
            DriverMsg::Rpc { msg, reply } => {
                let response = self.respond(msg).await;
                let _ = reply.send(response);
            }
            DriverMsg::TransferComplete { slave, success } => {
                self.transfer_complete(slave, success);
            }
            DriverMsg::Pause => {
                info!("dispatch paused");
                self.paused = true;
            }
            DriverMsg::Resume => {
                info!("dispatch resumed");
                self.paused = false;
            }
            DriverMsg::Kill { slave } => {
                if let Some(record) = self.slaves.get_mut(&slave) {
                    info!(%slave, "slave marked for termination");
                    record.kill = true;
                }
            }
            DriverMsg::Abort { package, version } => {
                self.abort(package, version);
            }
            DriverMsg::ListSlaves { reply } => {
                let _ = reply.send(self.snapshots());
            }
        }
    }

    async fn respond(&mut self, msg: SlaveRequest) -> MasterResponse {
        match msg {
            SlaveRequest::Hello {
                timestamp,
                identity,
            } => self.hello(timestamp, identity),
            SlaveRequest::Idle { slave_id } => self.idle(slave_id).await,
            SlaveRequest::Built {
                slave_id,
                status,
                duration,
                output,
                files,
            } => {
                self.built(slave_id, status, duration, output, files)
                    .await
            }
            SlaveRequest::Sent { slave_id } => self.sent(slave_id),
            SlaveRequest::Bye { slave_id } => {
                self.bye(slave_id).await;
                // BYE gets no reply; the connection task discards this.
                MasterResponse::Die
            }
        }
    }

    fn hello(
        &mut self,
        timestamp: DateTime<Utc>,
        identity: SlaveIdentity,
    ) -> MasterResponse {
        let slave_id = SlaveId(self.ids.fetch_add(1, Ordering::Relaxed));
        info!(
            %slave_id,
            label = %identity.label,
            abi = %identity.abi_tag,
            %timestamp,
            "slave connected"
        );
        let now = Utc::now();
        self.slaves.insert(
            slave_id,
            SlaveRecord {
                identity,
                first_seen: now,
                last_seen: now,
                misses: 0,
                kill: false,
                state: SlaveState::Idle,
            },
        );
        MasterResponse::Hello {
            slave_id,
            timestamp: now,
        }
    }

    async fn idle(&mut self, slave_id: SlaveId) -> MasterResponse {
        if !self.touch(slave_id) {
            return MasterResponse::Die;
        }
        let (kill, busy, abi) = {
            let Some(record) = self.slaves.get(&slave_id) else {
                return MasterResponse::Die;
            };
            (
                record.kill,
                !matches!(record.state, SlaveState::Idle),
                record.identity.abi_tag.clone(),
            )
        };
        if kill {
            self.retire(slave_id, "killed by control").await;
            return MasterResponse::Die;
        }
        if busy {
            // Mid-exchange bookkeeping still open (e.g. a transfer
            // confirmation in flight): let the slave finish what it
            // started.
            return MasterResponse::Cont;
        }

        if self.paused {
            let sleep = self.config.borrow().timing.sleep_initial;
            return MasterResponse::Sleep { duration: sleep };
        }

        match self.next_build(&abi).await {
            Some(build) => {
                let assignment = Assignment {
                    package: build.package.clone(),
                    version: build.version.clone(),
                    abi,
                };
                self.in_flight.insert(assignment.key());
                if let Some(record) = self.slaves.get_mut(&slave_id) {
                    record.misses = 0;
                    record.state = SlaveState::Building {
                        assignment,
                        aborted: false,
                    };
                }
                info!(
                    %slave_id,
                    package = %build.package,
                    version = %build.version,
                    "build dispatched"
                );
                MasterResponse::Build {
                    package: build.package,
                    version: build.version,
                }
            }
            None => {
                let timing = self.config.borrow().timing.clone();
                let misses = self
                    .slaves
                    .get_mut(&slave_id)
                    .map(|record| {
                        record.misses = record.misses.saturating_add(1);
                        record.misses
                    })
                    .unwrap_or(1);
                MasterResponse::Sleep {
                    duration: sleep_backoff(
                        timing.sleep_initial,
                        timing.sleep_max,
                        misses,
                    ),
                }
            }
        }
    }

    async fn built(
        &mut self,
        slave_id: SlaveId,
        status: BuildStatus,
        duration: Duration,
        output: String,
        files: Vec<BuildArtifact>,
    ) -> MasterResponse {
        if !self.touch(slave_id) {
            return MasterResponse::Die;
        }
        let (label, taken) = {
            let Some(record) = self.slaves.get_mut(&slave_id) else {
                return MasterResponse::Die;
            };
            let label = record.identity.label.clone();
            let taken = match std::mem::replace(
                &mut record.state,
                SlaveState::Idle,
            ) {
                SlaveState::Building {
                    assignment,
                    aborted,
                } => Some((assignment, aborted)),
                other => {
                    record.state = other;
                    None
                }
            };
            (label, taken)
        };
        let Some((assignment, aborted)) = taken else {
            warn!(
                %slave_id,
                "BUILT outside the building state; retiring slave"
            );
            self.retire(slave_id, "protocol violation").await;
            return MasterResponse::Die;
        };

        if aborted || self.is_aborted(&assignment) {
            info!(
                %slave_id,
                package = %assignment.package,
                version = %assignment.version,
                "aborted build discarded"
            );
            self.in_flight.remove(&assignment.key());
            self.aborted
                .remove(&(assignment.package.clone(), None));
            self.aborted.remove(&(
                assignment.package.clone(),
                Some(assignment.version.clone()),
            ));
            return MasterResponse::Done;
        }

        let attempt = BuildAttempt {
            build_id: None,
            package: assignment.package.clone(),
            version: assignment.version.clone(),
            abi_tag: assignment.abi.clone(),
            built_by: label,
            duration,
            status,
            started_at: Utc::now()
                - chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
            output,
        };

        if !status.is_success() || files.is_empty() {
            info!(
                %slave_id,
                package = %assignment.package,
                version = %assignment.version,
                success = status.is_success(),
                "build finished without files"
            );
            self.in_flight.remove(&assignment.key());
            self.secretary
                .send(Event::BuildFinished {
                    attempt,
                    files: Vec::new(),
                })
                .await;
            return MasterResponse::Done;
        }

        // Artifacts must be wheels of the assigned package.
        for file in &files {
            let valid = WheelFilename::parse(&file.filename)
                .ok()
                .and_then(|wheel| wheel.package().ok())
                .map(|package| package == assignment.package)
                .unwrap_or(false);
            if !valid {
                warn!(
                    %slave_id,
                    filename = %file.filename,
                    "artifact does not belong to the assignment; \
                     retiring slave"
                );
                self.in_flight.remove(&assignment.key());
                self.retire(slave_id, "protocol violation").await;
                return MasterResponse::Die;
            }
        }

        let mut remaining: VecDeque<String> =
            files.iter().map(|f| f.filename.clone()).collect();
        let first = match remaining.pop_front() {
            Some(first) => first,
            None => return MasterResponse::Done,
        };

        if self
            .juggler
            .send(JugglerCmd::Expect {
                slave: slave_id,
                attempt,
                files,
            })
            .await
            .is_err()
        {
            warn!("file juggler is gone; requeueing build");
            self.in_flight.remove(&assignment.key());
            return MasterResponse::Die;
        }

        if let Some(record) = self.slaves.get_mut(&slave_id) {
            let mut queue = remaining;
            queue.push_front(first.clone());
            record.state = SlaveState::Sending {
                assignment,
                remaining: queue,
                aborted: false,
            };
        }
        MasterResponse::Send { filename: first }
    }

    fn sent(&mut self, slave_id: SlaveId) -> MasterResponse {
        if !self.touch(slave_id) {
            return MasterResponse::Die;
        }
        let Some(record) = self.slaves.get_mut(&slave_id) else {
            return MasterResponse::Die;
        };
        match &mut record.state {
            SlaveState::Sending {
                assignment,
                remaining,
                aborted: _,
            } => {
                remaining.pop_front();
                match remaining.front() {
                    Some(next) => MasterResponse::Send {
                        filename: next.clone(),
                    },
                    None => {
                        let assignment = assignment.clone();
                        record.state = SlaveState::Idle;
                        self.transfers.insert(slave_id, assignment);
                        MasterResponse::Done
                    }
                }
            }
            _ => {
                warn!(%slave_id, "SENT outside the sending state");
                MasterResponse::Die
            }
        }
    }

    async fn bye(&mut self, slave_id: SlaveId) {
        info!(%slave_id, "slave said goodbye");
        self.retire(slave_id, "bye").await;
    }

    fn transfer_complete(&mut self, slave: SlaveId, success: bool) {
        if let Some(assignment) = self.transfers.remove(&slave) {
            self.in_flight.remove(&assignment.key());
            debug!(
                %slave,
                package = %assignment.package,
                success,
                "transfer settled"
            );
            return;
        }
        // The juggler can fail a build while the slave is still sending.
        if let Some(record) = self.slaves.get_mut(&slave)
            && let SlaveState::Sending { assignment, .. } = &record.state
        {
            let assignment = assignment.clone();
            self.in_flight.remove(&assignment.key());
            record.state = SlaveState::Idle;
            debug!(%slave, success, "transfer settled early");
        }
    }

    fn abort(
        &mut self,
        package: PackageName,
        version: Option<VersionString>,
    ) {
        for record in self.slaves.values_mut() {
            let (matching, aborted) = match &mut record.state {
                SlaveState::Building {
                    assignment,
                    aborted,
                } => (
                    assignment.package == package
                        && version
                            .as_ref()
                            .is_none_or(|v| *v == assignment.version),
                    aborted,
                ),
                SlaveState::Sending {
                    assignment,
                    aborted,
                    ..
                } => (
                    assignment.package == package
                        && version
                            .as_ref()
                            .is_none_or(|v| *v == assignment.version),
                    aborted,
                ),
                SlaveState::Idle => continue,
            };
            if matching {
                *aborted = true;
            }
        }
        // Also drop queued candidates so they are not handed out between
        // the skip commit and the next queue refill.
        for queue in self.pending.values_mut() {
            queue.retain(|build| {
                !(build.package == package
                    && version
                        .as_ref()
                        .is_none_or(|v| *v == build.version))
            });
        }
        self.aborted.insert((package, version));
    }

    fn is_aborted(&self, assignment: &Assignment) -> bool {
        self.aborted
            .contains(&(assignment.package.clone(), None))
            || self.aborted.contains(&(
                assignment.package.clone(),
                Some(assignment.version.clone()),
            ))
    }

    /// Pops the next dispatchable build for an ABI, refilling the local
    /// queue from the database when it runs dry.
    async fn next_build(&mut self, abi: &AbiTag) -> Option<PendingBuild> {
        for refilled in [false, true] {
            if let Some(build) = self.pop_candidate(abi) {
                return Some(build);
            }
            if refilled {
                break;
            }
            let limit = self.config.borrow().builds.fetch_batch as i64;
            match self
                .db
                .call(DbOp::GetPendingBuilds {
                    abi: abi.clone(),
                    limit,
                })
                .await
            {
                Ok(DbReply::PendingBuilds(builds)) => {
                    debug!(
                        abi = %abi,
                        fetched = builds.len(),
                        "pending queue refilled"
                    );
                    self.pending
                        .insert(abi.clone(), builds.into());
                }
                Ok(other) => {
                    warn!(?other, "unexpected reply to pending fetch");
                    break;
                }
                Err(err) => {
                    warn!(%err, "pending fetch failed");
                    break;
                }
            }
        }
        None
    }

    fn pop_candidate(&mut self, abi: &AbiTag) -> Option<PendingBuild> {
        let queue = self.pending.get_mut(abi)?;
        while let Some(build) = queue.pop_front() {
            let key = (
                build.package.clone(),
                build.version.clone(),
                abi.clone(),
            );
            let aborted = self
                .aborted
                .contains(&(build.package.clone(), None))
                || self.aborted.contains(&(
                    build.package.clone(),
                    Some(build.version.clone()),
                ));
            if !self.in_flight.contains(&key) && !aborted {
                return Some(build);
            }
        }
        None
    }

    fn touch(&mut self, slave_id: SlaveId) -> bool {
        match self.slaves.get_mut(&slave_id) {
            Some(record) => {
                record.last_seen = Utc::now();
                true
            }
            None => {
                debug!(%slave_id, "message from unknown slave");
                false
            }
        }
    }

    /// Forgets a slave, requeueing its assignment and telling the juggler
    /// to clean up anything half-uploaded.
    async fn retire(&mut self, slave_id: SlaveId, reason: &str) {
        let Some(record) = self.slaves.remove(&slave_id) else {
            return;
        };
        info!(%slave_id, reason, "slave retired");
        let assignment = match record.state {
            SlaveState::Building { assignment, .. }
            | SlaveState::Sending { assignment, .. } => Some(assignment),
            SlaveState::Idle => self.transfers.remove(&slave_id),
        };
        if let Some(assignment) = assignment {
            self.in_flight.remove(&assignment.key());
            info!(
                package = %assignment.package,
                version = %assignment.version,
                "assignment returned to the pending set"
            );
            if self
                .juggler
                .send(JugglerCmd::Cancel { slave: slave_id })
                .await
                .is_err()
            {
                debug!("file juggler is gone");
            }
        }
    }

    async fn check_timeouts(&mut self) {
        let timing = self.config.borrow().timing.clone();
        let now = Utc::now();
        let expired: Vec<SlaveId> = self
            .slaves
            .iter()
            .filter(|(id, record)| {
                let busy = !matches!(record.state, SlaveState::Idle)
                    || self.transfers.contains_key(id);
                let timeout = if busy {
                    timing.busy_timeout
                } else {
                    timing.idle_timeout
                };
                let silence = (now - record.last_seen)
                    .to_std()
                    .unwrap_or_default();
                silence > timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for slave_id in expired {
            warn!(%slave_id, "slave timed out");
            self.retire(slave_id, "timeout").await;
        }
    }

    fn snapshots(&self) -> Vec<SlaveSnapshot> {
        let mut snapshots: Vec<SlaveSnapshot> = self
            .slaves
            .iter()
            .map(|(id, record)| {
                let current = match &record.state {
                    SlaveState::Building { assignment, .. }
                    | SlaveState::Sending { assignment, .. } => Some((
                        assignment.package.clone(),
                        assignment.version.clone(),
                    )),
                    SlaveState::Idle => None,
                };
                SlaveSnapshot {
                    slave_id: *id,
                    label: record.identity.label.clone(),
                    abi_tag: record.identity.abi_tag.to_string(),
                    state: record.state.name().to_string(),
                    first_seen: record.first_seen,
                    last_seen: record.last_seen,
                    current,
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.slave_id);
        snapshots
    }
}

/// Consecutive-miss sleep backoff: doubles from `initial`, capped at
/// `max`, reset on dispatch.
fn sleep_backoff(initial: Duration, max: Duration, misses: u32) -> Duration {
    let exponent = misses.saturating_sub(1).min(16);
    let grown = initial.saturating_mul(2u32.saturating_pow(exponent));
    grown.min(max)
}

/// Serves one slave connection: reads framed requests, forwards them to
/// the driver, writes the single reply. Generic over the stream so tests
/// can use an in-memory duplex.
pub async fn serve_slave<S>(
    stream: S,
    driver: mpsc::Sender<DriverMsg>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed: JsonFramed<S, SlaveRequest, MasterResponse> =
        JsonFramed::new(stream);
    while let Some(msg) = framed.recv().await? {
        let silent = matches!(msg, SlaveRequest::Bye { .. });
        let (reply, response) = oneshot::channel();
        if driver
            .send(DriverMsg::Rpc { msg, reply })
            .await
            .is_err()
        {
            break;
        }
        if silent {
            break;
        }
        match response.await {
            Ok(response) => {
                let terminal =
                    matches!(response, MasterResponse::Die);
                framed.send(&response).await?;
                if terminal {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let initial = Duration::from_secs(10);
        let max = Duration::from_secs(600);
        assert_eq!(
            sleep_backoff(initial, max, 1),
            Duration::from_secs(10)
        );
        assert_eq!(
            sleep_backoff(initial, max, 2),
            Duration::from_secs(20)
        );
        assert_eq!(
            sleep_backoff(initial, max, 4),
            Duration::from_secs(80)
        );
        assert_eq!(sleep_backoff(initial, max, 10), max);
        assert_eq!(sleep_backoff(initial, max, u32::MAX), max);
    }
}
