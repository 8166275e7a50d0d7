// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication lifecycle.
//!
//! One replicator drives one direction of sync between a local database and
//! a remote peer. All mutable state lives in a single driver task; timers,
//! subscriptions, and HTTP completions send [`Command`]s back to it, so
//! inbox processing is serialized and state transitions happen between
//! commands, never concurrently.
//!
//! ```text
//!                    ┌────────────────────────────────────────────┐
//!  handle.stop() ───▶│                driver task                 │
//!  reachability  ───▶│  online/offline ▸ session ▸ checkpoint ▸   │
//!  change events ───▶│  inbox batcher ▸ process_inbox (spawned) ▸ │
//!  feed rows     ───▶│  sequence ledger ▸ coalesced checkpoint    │
//!  task results  ───▶│  save ▸ retry timer                        │
//!                    └────────────────────────────────────────────┘
//! ```
//!
//! # State Machine
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Idle | start | Running, Offline |
//! | Running, Offline | reachable | Running, Online (session check) |
//! | Running, Online | unreachable | Running, Offline (requests cancelled) |
//! | Running, Online | work queued | active |
//! | Running, active | queues drained, tasks done | idle; one-shot → Stopped |
//! | Running | stop | Stopping → Stopped when tasks drain |
//!
//! `active ⇔ batcher.count > 0 ∨ async_task_count > 0`; every transition
//! publishes a progress notification.
//!
//! # Checkpoints
//!
//! `last_sequence` only ever advances to a sequence with no earlier
//! unfinished transfer (see [`SequenceLedger`]). Saves are coalesced with a
//! dirty/in-flight flag pair on a 5 second window; a save completing while
//! overdue re-saves immediately. The local mirror is written pre-emptively
//! when the replicator detaches with a save outstanding.

pub mod puller;
pub mod pusher;

use crate::auth::Authorizer;
use crate::batcher::Batcher;
use crate::changes::ChangeEvent;
use crate::checkpoint::{checkpoint_id, RemoteCheckpoint};
use crate::config::{EngineConfig, ReplicatorOptions};
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::reachability::{Reachability, ReachabilityProbe, ReachabilityWatcher, TcpProbe};
use crate::remote::{ChangeRow, Peer};
use crate::revision::Revision;
use crate::store::{Database, FilterFn};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate the next per-process replication session ID (`repl001`, ...).
pub fn next_session_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("repl{:03}", n)
}

/// The identity of a replication, used for `cancel` matching and for the
/// checkpoint ID.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorSettings {
    pub db_name: String,
    pub remote_url: String,
    pub push: bool,
    pub continuous: bool,
    pub options: ReplicatorOptions,
}

impl ReplicatorSettings {
    /// Whether a `cancel` request naming `other` refers to this replication.
    /// Matches on everything that affects which revisions flow; not on
    /// `continuous`.
    pub fn has_same_settings_as(&self, other: &ReplicatorSettings) -> bool {
        self.db_name == other.db_name
            && self.remote_url == other.remote_url
            && self.push == other.push
            && self.options.filter == other.options.filter
            && self.options.query_params == other.options.query_params
            && self.options.doc_ids == other.options.doc_ids
    }

    pub fn checkpoint_id(&self, local_uuid: &str) -> String {
        checkpoint_id(
            local_uuid,
            &self.remote_url,
            self.push,
            self.options.filter.as_deref(),
            self.options.query_params.as_ref(),
        )
    }

    fn source(&self) -> String {
        if self.push {
            self.db_name.clone()
        } else {
            self.remote_url.clone()
        }
    }

    fn target(&self) -> String {
        if self.push {
            self.remote_url.clone()
        } else {
            self.db_name.clone()
        }
    }
}

/// Observable replicator state.
#[derive(Debug, Clone, Default)]
pub struct ReplicatorStatus {
    pub session_id: String,
    pub running: bool,
    pub online: bool,
    pub active: bool,
    pub last_sequence: u64,
    pub changes_processed: u64,
    pub changes_total: u64,
    pub revisions_failed: u64,
    pub error: Option<(u16, String)>,
}

/// Broadcast on every progress transition and on stop.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub session_id: String,
    pub info: Value,
    pub stopped: bool,
}

/// Commands delivered to the driver task.
pub(crate) enum Command {
    Stop,
    Reachability(Reachability),
    /// A local commit observed by the pusher's subscription.
    LocalChange(ChangeEvent),
    /// Rows from the puller's remote feed.
    RemoteRows(Vec<ChangeRow>),
    /// The puller's one-shot feed drained, or the pusher finished seeding.
    CaughtUp,
    FeedFailed(EngineError),
    SessionChecked(Result<Value>),
    LoggedIn(Result<()>),
    RemoteDbReady(Result<()>),
    CheckpointFetched(Result<Option<Value>>),
    InboxDone(InboxOutcome),
    CheckpointSaved { result: Result<String>, sequence: u64 },
}

/// Result of one `process_inbox` batch.
#[derive(Debug, Default)]
pub(crate) struct InboxOutcome {
    pub processed: u64,
    pub failed: u64,
    pub completed_sequences: Vec<u64>,
    pub failed_sequences: Vec<u64>,
    pub error: Option<EngineError>,
}

/// Tracks which queued sequences have finished, so the checkpoint never
/// advances past a gap.
#[derive(Debug, Default)]
pub(crate) struct SequenceLedger {
    pending: BTreeSet<u64>,
    max_seen: u64,
    committed: u64,
}

impl SequenceLedger {
    pub fn queued(&mut self, seq: u64) {
        if seq > self.committed {
            self.pending.insert(seq);
            self.max_seen = self.max_seen.max(seq);
        }
    }

    pub fn completed(&mut self, seq: u64) {
        self.pending.remove(&seq);
        self.max_seen = self.max_seen.max(seq);
        self.recompute();
    }

    /// A failed sequence stays pending: nothing after it may be committed.
    pub fn failed(&self, _seq: u64) {}

    fn recompute(&mut self) {
        let safe = match self.pending.iter().next() {
            Some(first_pending) => first_pending.saturating_sub(1),
            None => self.max_seen,
        };
        if safe > self.committed {
            self.committed = safe;
        }
    }

    /// Highest sequence with every earlier transfer acknowledged.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn adopt(&mut self, seq: u64) {
        self.committed = seq;
        self.max_seen = seq;
        self.pending.clear();
    }

    /// Forget in-flight state (retry re-seeds from `committed`).
    pub fn reset_pending(&mut self) {
        self.pending.clear();
        self.max_seen = self.committed;
    }
}

/// Shared handle to a running replicator.
pub struct ReplicatorHandle {
    pub session_id: String,
    pub settings: ReplicatorSettings,
    command_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ReplicatorStatus>,
}

impl ReplicatorHandle {
    pub fn status(&self) -> ReplicatorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.status_rx.borrow().running
    }

    /// Request a stop. Idempotent; repeated calls are no-ops.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }

    /// Wait until the driver has fully stopped.
    pub async fn wait_stopped(&self) {
        let mut rx = self.status_rx.clone();
        while rx.borrow().running {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn has_same_settings_as(&self, other: &ReplicatorSettings) -> bool {
        self.settings.has_same_settings_as(other)
    }

    /// Snapshot for `_active_tasks`.
    pub fn active_task_info(&self) -> Value {
        let status = self.status();
        task_info(&self.settings, &status)
    }
}

fn task_info(settings: &ReplicatorSettings, status: &ReplicatorStatus) -> Value {
    let state_text = if !status.running {
        "Stopped".to_string()
    } else if !status.online {
        "Offline".to_string()
    } else if !status.active {
        "Idle".to_string()
    } else {
        format!(
            "Processed {} / {} changes",
            status.changes_processed, status.changes_total
        )
    };
    let mut info = json!({
        "type": "Replication",
        "task": status.session_id,
        "source": settings.source(),
        "target": settings.target(),
        "status": state_text,
    });
    if settings.continuous {
        info["continuous"] = json!(true);
    }
    if status.changes_total > 0 {
        info["progress"] = json!(100 * status.changes_processed / status.changes_total);
    }
    if let Some((code, message)) = &status.error {
        info["error"] = json!([code, message]);
    }
    info
}

/// Everything the engine hands a new replicator.
pub(crate) struct ReplicatorContext {
    pub db: Arc<dyn Database>,
    pub peer: Arc<dyn Peer>,
    pub settings: ReplicatorSettings,
    pub config: EngineConfig,
    pub engine: Weak<Engine>,
    pub tasks_tx: broadcast::Sender<TaskEvent>,
    pub authorizer: Option<Authorizer>,
    /// Override the reachability probe (tests script transitions).
    pub probe: Option<Arc<dyn ReachabilityProbe>>,
}

/// Start a replicator; returns its shared handle. The driver registers the
/// handle's lifetime with the engine and detaches itself on stop.
pub(crate) fn spawn(ctx: ReplicatorContext) -> Arc<ReplicatorHandle> {
    let session_id = next_session_id();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(ReplicatorStatus {
        session_id: session_id.clone(),
        running: true,
        ..Default::default()
    });

    let handle = Arc::new(ReplicatorHandle {
        session_id: session_id.clone(),
        settings: ctx.settings.clone(),
        command_tx: command_tx.clone(),
        status_rx,
    });

    let checkpoint = ctx.settings.checkpoint_id(&ctx.db.private_uuid());
    info!(
        session_id = %session_id,
        db = %ctx.settings.db_name,
        remote = %ctx.settings.remote_url,
        push = ctx.settings.push,
        continuous = ctx.settings.continuous,
        checkpoint_id = %checkpoint,
        "Replication starting"
    );

    let inbox = Batcher::new(ctx.config.batcher_capacity, ctx.config.batcher_delay());
    let replicator = Replicator {
        db: ctx.db,
        peer: ctx.peer,
        settings: ctx.settings,
        config: ctx.config,
        engine: ctx.engine,
        tasks_tx: ctx.tasks_tx,
        authorizer: ctx.authorizer,
        probe: ctx.probe.unwrap_or_else(|| Arc::new(TcpProbe)),
        session_id,
        checkpoint_id: checkpoint,
        command_tx,
        status_tx,
        inbox,
        ledger: SequenceLedger::default(),
        remote_checkpoint: RemoteCheckpoint::default(),
        filter: None,
        online: false,
        stopping: false,
        stopped: false,
        caught_up: false,
        inbox_in_flight: false,
        flush_overdue: false,
        async_task_count: 0,
        was_active: false,
        last_sequence_changed: false,
        saving_checkpoint: false,
        overdue_for_save: false,
        checkpoint_deadline: None,
        retry_deadline: None,
        changes_processed: 0,
        changes_total: 0,
        revisions_failed: 0,
        error: None,
        work_tasks: Vec::new(),
        reach_task: None,
        watcher: None,
    };

    tokio::spawn(replicator.run(command_rx));
    handle
}

struct Replicator {
    db: Arc<dyn Database>,
    peer: Arc<dyn Peer>,
    settings: ReplicatorSettings,
    config: EngineConfig,
    engine: Weak<Engine>,
    tasks_tx: broadcast::Sender<TaskEvent>,
    authorizer: Option<Authorizer>,
    probe: Arc<dyn ReachabilityProbe>,

    session_id: String,
    checkpoint_id: String,
    command_tx: mpsc::UnboundedSender<Command>,
    status_tx: watch::Sender<ReplicatorStatus>,

    inbox: Batcher<Revision>,
    ledger: SequenceLedger,
    remote_checkpoint: RemoteCheckpoint,
    filter: Option<FilterFn>,

    online: bool,
    stopping: bool,
    stopped: bool,
    caught_up: bool,
    inbox_in_flight: bool,
    flush_overdue: bool,
    async_task_count: usize,
    was_active: bool,

    last_sequence_changed: bool,
    saving_checkpoint: bool,
    overdue_for_save: bool,
    checkpoint_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,

    changes_processed: u64,
    changes_total: u64,
    revisions_failed: u64,
    error: Option<EngineError>,

    /// Long-lived helper tasks (feed, change subscription); aborted when
    /// going offline and on stop.
    work_tasks: Vec<JoinHandle<()>>,
    /// Forwards reachability transitions into the command inbox.
    reach_task: Option<JoinHandle<()>>,
    watcher: Option<ReachabilityWatcher>,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

impl Replicator {
    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        if self.settings.options.reset {
            debug!(session_id = %self.session_id, "Resetting local checkpoint");
            self.db.set_last_sequence("0", &self.checkpoint_id);
        }

        if self.peer.is_local() {
            self.go_online();
        } else if let Some((host, port)) = self.peer.host_and_port() {
            let watcher = ReachabilityWatcher::start(
                host,
                port,
                self.config.reachability_interval(),
                Arc::clone(&self.probe),
            );
            let mut reach_rx = watcher.subscribe();
            let tx = self.command_tx.clone();
            self.reach_task = Some(tokio::spawn(async move {
                while reach_rx.changed().await.is_ok() {
                    let state = *reach_rx.borrow();
                    if tx.send(Command::Reachability(state)).is_err() {
                        break;
                    }
                }
            }));
            self.watcher = Some(watcher);
        } else {
            // No host to probe (odd URL); assume reachable.
            self.go_online();
        }

        self.publish();

        while !self.stopped {
            let inbox_deadline = self
                .inbox
                .time_until_flush()
                .map(|d| Instant::now() + d)
                .unwrap_or_else(far_future);
            let save_deadline = self.checkpoint_deadline.unwrap_or_else(far_future);
            let retry_deadline = self.retry_deadline.unwrap_or_else(far_future);

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(inbox_deadline) => {
                    if self.inbox.should_flush() {
                        self.flush_inbox();
                    }
                }
                _ = tokio::time::sleep_until(save_deadline) => {
                    self.checkpoint_deadline = None;
                    self.save_last_sequence();
                }
                _ = tokio::time::sleep_until(retry_deadline) => {
                    self.retry_deadline = None;
                    self.retry_if_ready();
                }
            }
            self.update_active();
        }

        self.finalize().await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Stop => self.begin_stop(),
            Command::Reachability(state) => match state {
                Reachability::Reachable => self.go_online(),
                Reachability::Unreachable => self.go_offline(),
                Reachability::Unknown => {}
            },
            Command::LocalChange(event) => self.on_local_change(event),
            Command::RemoteRows(rows) => self.on_remote_rows(rows),
            Command::CaughtUp => {
                self.caught_up = true;
            }
            Command::FeedFailed(error) => self.on_error(error),
            Command::SessionChecked(result) => self.on_session_checked(result),
            Command::LoggedIn(result) => self.on_logged_in(result),
            Command::RemoteDbReady(result) => self.on_remote_db_ready(result),
            Command::CheckpointFetched(result) => self.on_checkpoint_fetched(result),
            Command::InboxDone(outcome) => self.on_inbox_done(outcome),
            Command::CheckpointSaved { result, sequence } => {
                self.on_checkpoint_saved(result, sequence)
            }
        }
    }

    // =========================================================================
    // Online / offline
    // =========================================================================

    fn go_online(&mut self) {
        if self.online || self.stopping {
            return;
        }
        self.online = true;
        self.error = None;
        info!(session_id = %self.session_id, remote = %self.settings.remote_url, "Going online");
        metrics::record_replicator_transition(&self.settings.remote_url, "online");
        self.check_session();
        self.publish();
    }

    fn go_offline(&mut self) {
        if !self.online {
            return;
        }
        self.online = false;
        info!(session_id = %self.session_id, remote = %self.settings.remote_url, "Going offline");
        metrics::record_replicator_transition(&self.settings.remote_url, "offline");
        self.peer.stop_outstanding();
        // Feed and subscription tasks are rebuilt by the next go_online.
        for task in self.work_tasks.drain(..) {
            task.abort();
        }
        self.publish();
    }

    // =========================================================================
    // Session check and login
    // =========================================================================

    fn check_session(&mut self) {
        let needs_login = self
            .authorizer
            .as_ref()
            .map(Authorizer::has_login)
            .unwrap_or(false);
        if !needs_login {
            self.fetch_remote_checkpoint();
            return;
        }
        let peer = Arc::clone(&self.peer);
        let tx = self.command_tx.clone();
        self.async_task_started();
        tokio::spawn(async move {
            let result = peer.check_session().await;
            let _ = tx.send(Command::SessionChecked(result));
        });
    }

    fn on_session_checked(&mut self, result: Result<Value>) {
        self.async_task_finished();
        match result {
            Ok(body) => {
                let logged_in = body
                    .pointer("/userCtx/name")
                    .map(|name| !name.is_null())
                    .unwrap_or(false);
                if logged_in {
                    debug!(session_id = %self.session_id, "Session already authenticated");
                    self.fetch_remote_checkpoint();
                } else {
                    self.login();
                }
            }
            Err(err) => self.on_error(err),
        }
    }

    fn login(&mut self) {
        let Some(authorizer) = self.authorizer.clone() else {
            self.fetch_remote_checkpoint();
            return;
        };
        let (Some(path), Some(params)) =
            (authorizer.login_path(), authorizer.login_parameters())
        else {
            self.fetch_remote_checkpoint();
            return;
        };
        info!(session_id = %self.session_id, path, "Logging in");
        let peer = Arc::clone(&self.peer);
        let tx = self.command_tx.clone();
        self.async_task_started();
        tokio::spawn(async move {
            let result = peer.login(path, &params).await;
            let _ = tx.send(Command::LoggedIn(result));
        });
    }

    fn on_logged_in(&mut self, result: Result<()>) {
        self.async_task_finished();
        match result {
            Ok(()) => self.fetch_remote_checkpoint(),
            Err(err) => self.on_error(err),
        }
    }

    // =========================================================================
    // Checkpoint fetch
    // =========================================================================

    fn fetch_remote_checkpoint(&mut self) {
        let peer = Arc::clone(&self.peer);
        let id = self.checkpoint_id.clone();
        let tx = self.command_tx.clone();
        self.async_task_started();
        tokio::spawn(async move {
            let result = peer.get_checkpoint(&id).await;
            let _ = tx.send(Command::CheckpointFetched(result));
        });
    }

    fn on_checkpoint_fetched(&mut self, result: Result<Option<Value>>) {
        self.async_task_finished();
        let local = self.db.last_sequence_with_checkpoint_id(&self.checkpoint_id);
        match result {
            Ok(Some(body)) => {
                self.remote_checkpoint = RemoteCheckpoint::from_value(body);
                let remote_sequence = self.remote_checkpoint.last_sequence();
                if local.as_deref() == Some(remote_sequence.as_str()) {
                    let adopted: u64 = remote_sequence.parse().unwrap_or(0);
                    self.ledger.adopt(adopted);
                    info!(
                        session_id = %self.session_id,
                        last_sequence = adopted,
                        "Checkpoints agree; resuming"
                    );
                } else {
                    warn!(
                        session_id = %self.session_id,
                        local = ?local,
                        remote = %remote_sequence,
                        "Checkpoint mismatch; replaying from start"
                    );
                    self.ledger.adopt(0);
                }
            }
            Ok(None) => {
                debug!(session_id = %self.session_id, "No remote checkpoint");
                self.remote_checkpoint = RemoteCheckpoint::default();
                self.ledger.adopt(0);
            }
            Err(err) => {
                self.on_error(err);
                return;
            }
        }
        self.begin_replicating();
    }

    // =========================================================================
    // Direction-specific startup
    // =========================================================================

    fn begin_replicating(&mut self) {
        if self.stopping {
            return;
        }
        if self.settings.push {
            if self.settings.options.create_target {
                let peer = Arc::clone(&self.peer);
                let tx = self.command_tx.clone();
                self.async_task_started();
                tokio::spawn(async move {
                    let result = peer.create_db().await;
                    let _ = tx.send(Command::RemoteDbReady(result));
                });
            } else {
                self.begin_push();
            }
        } else {
            self.begin_pull();
        }
    }

    fn on_remote_db_ready(&mut self, result: Result<()>) {
        self.async_task_finished();
        match result {
            Ok(()) => self.begin_push(),
            Err(err) => self.on_error(err),
        }
    }

    fn begin_push(&mut self) {
        if let Some(name) = self.settings.options.filter.clone() {
            match self.db.compile_filter(&name) {
                Ok(filter) => self.filter = Some(filter),
                Err(err) => {
                    self.on_error(err);
                    return;
                }
            }
        }
        // Subscribe before the backfill so no commit slips between them;
        // the backfill/live overlap is deduped at queue time.
        let mut changes_rx = self.db.changes_broker().subscribe();
        let tx = self.command_tx.clone();
        self.work_tasks.push(tokio::spawn(async move {
            loop {
                match changes_rx.recv().await {
                    Ok(event) => {
                        if tx.send(Command::LocalChange(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Pusher change subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        match pusher::seed(
            self.db.as_ref(),
            self.ledger.committed(),
            self.filter.as_ref(),
            self.settings.options.query_params.as_ref(),
        ) {
            Ok(backfill) => {
                debug!(
                    session_id = %self.session_id,
                    count = backfill.len(),
                    "Seeding push inbox"
                );
                for revision in backfill {
                    self.queue_revision(revision);
                }
                self.caught_up = true;
            }
            Err(err) => self.on_error(err),
        }
    }

    fn begin_pull(&mut self) {
        let request = puller::feed_request(
            self.ledger.committed(),
            self.settings.continuous,
            self.config.changes_feed_limit,
            &self.settings.options,
        );
        let handle = puller::spawn_feed(
            Arc::clone(&self.peer),
            request,
            self.settings.continuous,
            self.command_tx.clone(),
        );
        self.work_tasks.push(handle);
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    fn on_local_change(&mut self, event: ChangeEvent) {
        if !self.settings.push || self.stopping {
            return;
        }
        // Skip changes we pulled from this very peer (echo suppression).
        if event.source.as_deref() == Some(self.settings.remote_url.as_str())
            || event.source.as_deref() == Some(self.peer.url())
        {
            return;
        }
        if event.revision.sequence_or_zero() <= self.ledger.committed() {
            return;
        }
        if let Some(filter) = &self.filter {
            let params = self
                .settings
                .options
                .query_params
                .clone()
                .unwrap_or(Value::Null);
            // The subscription event is a stub; load the body for the filter.
            let loaded = self
                .db
                .get_document(&event.revision.doc_id, Some(&event.revision.rev_id))
                .unwrap_or_else(|_| event.revision.clone());
            if !filter(&loaded, &params) {
                return;
            }
        }
        self.queue_revision(event.revision);
    }

    fn on_remote_rows(&mut self, rows: Vec<ChangeRow>) {
        if self.stopping {
            return;
        }
        for row in rows {
            if let Some(doc_ids) = &self.settings.options.doc_ids {
                if !doc_ids.contains(&row.id) {
                    continue;
                }
            }
            for rev_id in &row.revs {
                let revision = Revision::new(row.id.clone(), rev_id.clone())
                    .deleted(row.deleted)
                    .at_sequence(row.seq);
                self.queue_revision(revision);
            }
        }
    }

    /// Enqueue one revision, deduplicating against the pending buffer.
    fn queue_revision(&mut self, revision: Revision) {
        if self.settings.push {
            if let Some(doc_ids) = &self.settings.options.doc_ids {
                if !doc_ids.contains(&revision.doc_id) {
                    return;
                }
            }
        }
        let seq = revision.sequence_or_zero();
        self.ledger.queued(seq);
        self.changes_total += 1;
        self.inbox.queue(revision);
        if self.inbox.should_flush() {
            self.flush_inbox();
        }
        self.publish();
    }

    fn flush_inbox(&mut self) {
        if self.inbox.is_empty() {
            return;
        }
        if self.inbox_in_flight {
            // process_inbox is strictly serialized; pick this batch up when
            // the in-flight one completes.
            self.flush_overdue = true;
            return;
        }
        let mut batch = crate::revision::RevisionList::from(self.inbox.take());
        batch.dedup();
        let batch = batch.0;
        if batch.is_empty() {
            return;
        }

        self.inbox_in_flight = true;
        self.async_task_started();
        let db = Arc::clone(&self.db);
        let peer = Arc::clone(&self.peer);
        let push = self.settings.push;
        let tx = self.command_tx.clone();
        let remote = self.settings.remote_url.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let size = batch.len();
            let outcome = if push {
                pusher::process_inbox(db, peer, batch).await
            } else {
                puller::process_inbox(db, peer, batch).await
            };
            metrics::record_inbox_flush(&remote, size, started.elapsed());
            let _ = tx.send(Command::InboxDone(outcome));
        });
    }

    fn on_inbox_done(&mut self, outcome: InboxOutcome) {
        self.async_task_finished();
        self.inbox_in_flight = false;

        self.changes_processed += outcome.processed + outcome.failed;
        self.revisions_failed += outcome.failed;
        if outcome.failed > 0 {
            metrics::record_revs_failed(&self.settings.remote_url, outcome.failed as usize);
        }

        let before = self.ledger.committed();
        for seq in &outcome.completed_sequences {
            self.ledger.completed(*seq);
        }
        for seq in &outcome.failed_sequences {
            self.ledger.failed(*seq);
        }
        if self.ledger.committed() != before {
            self.note_last_sequence_changed();
        }

        if let Some(error) = outcome.error {
            self.on_error(error);
        }

        if self.flush_overdue {
            self.flush_overdue = false;
            self.flush_inbox();
        }
        self.publish();
    }

    // =========================================================================
    // Coalesced checkpoint save
    // =========================================================================

    fn note_last_sequence_changed(&mut self) {
        self.last_sequence_changed = true;
        if self.checkpoint_deadline.is_none() && !self.stopping {
            self.checkpoint_deadline = Some(Instant::now() + self.config.checkpoint_save_interval());
        }
        self.publish();
    }

    fn save_last_sequence(&mut self) {
        if !self.last_sequence_changed {
            return;
        }
        if self.saving_checkpoint {
            // A save is in flight; remember to go again when it lands.
            self.overdue_for_save = true;
            return;
        }
        self.saving_checkpoint = true;
        self.last_sequence_changed = false;

        let sequence = self.ledger.committed();
        let body = self.remote_checkpoint.body_for_save(&sequence.to_string());
        let peer = Arc::clone(&self.peer);
        let id = self.checkpoint_id.clone();
        let tx = self.command_tx.clone();
        debug!(session_id = %self.session_id, sequence, "Saving checkpoint");
        self.async_task_started();
        tokio::spawn(async move {
            let result = peer.put_checkpoint(&id, body).await;
            let _ = tx.send(Command::CheckpointSaved { result, sequence });
        });
    }

    fn on_checkpoint_saved(&mut self, result: Result<String>, sequence: u64) {
        self.async_task_finished();
        self.saving_checkpoint = false;
        match result {
            Ok(rev) => {
                self.remote_checkpoint.set_rev(rev);
                self.remote_checkpoint.set_last_sequence(sequence.to_string());
                self.db
                    .set_last_sequence(&sequence.to_string(), &self.checkpoint_id);
                metrics::record_checkpoint_save(&self.settings.remote_url, true);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                // Keep the local mirror as-is; the next sequence change
                // re-arms the coalescing window.
                warn!(session_id = %self.session_id, error = %err, "Checkpoint save failed");
                metrics::record_checkpoint_save(&self.settings.remote_url, false);
                self.last_sequence_changed = true;
            }
        }
        if self.overdue_for_save {
            self.overdue_for_save = false;
            self.save_last_sequence();
        }
    }

    // =========================================================================
    // Retry
    // =========================================================================

    fn retry_if_ready(&mut self) {
        if self.stopping {
            return;
        }
        if !self.online {
            // The watcher only reports transitions, so the retry timer
            // doubles as the online re-probe after an error took us down.
            debug!(session_id = %self.session_id, "Retry while offline; probing online");
            self.go_online();
            return;
        }
        if self.revisions_failed == 0 {
            return;
        }
        info!(
            session_id = %self.session_id,
            failed = self.revisions_failed,
            "Retrying failed revisions"
        );
        self.revisions_failed = 0;
        self.ledger.reset_pending();
        if self.settings.push {
            match pusher::seed(
                self.db.as_ref(),
                self.ledger.committed(),
                self.filter.as_ref(),
                self.settings.options.query_params.as_ref(),
            ) {
                Ok(revisions) => {
                    for revision in revisions {
                        self.queue_revision(revision);
                    }
                }
                Err(err) => self.on_error(err),
            }
        } else {
            self.begin_pull();
        }
        self.publish();
    }

    // =========================================================================
    // Errors, activity, stop
    // =========================================================================

    fn on_error(&mut self, error: EngineError) {
        if error.is_cancelled() {
            // Expected during stop()/go_offline(); never reported.
            return;
        }
        warn!(session_id = %self.session_id, error = %error, "Replication error");
        self.error = Some(error);
        if self.settings.continuous {
            // Drop offline and let the retry cycle reconnect; a 401 lands
            // back in check_session and its login flow.
            self.go_offline();
            self.retry_deadline = Some(Instant::now() + self.config.retry_interval());
        } else {
            self.begin_stop();
        }
        self.publish();
    }

    fn async_task_started(&mut self) {
        self.async_task_count += 1;
    }

    fn async_task_finished(&mut self) {
        debug_assert!(self.async_task_count > 0);
        self.async_task_count = self.async_task_count.saturating_sub(1);
    }

    fn is_active(&self) -> bool {
        self.inbox.count() > 0 || self.async_task_count > 0
    }

    fn update_active(&mut self) {
        let active = self.is_active();
        if active != self.was_active {
            self.was_active = active;
            self.publish();
        }
        if active {
            return;
        }
        if self.stopping {
            self.stopped = true;
            return;
        }
        if self.revisions_failed > 0 && self.retry_deadline.is_none() {
            self.retry_deadline = Some(Instant::now() + self.config.retry_interval());
        }
        // One-shot replications end once drained and caught up.
        if !self.settings.continuous && self.caught_up && self.online {
            self.begin_stop();
            if !self.is_active() {
                self.stopped = true;
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        info!(session_id = %self.session_id, "Replication stopping");
        self.stopping = true;
        self.retry_deadline = None;
        self.checkpoint_deadline = None;
        // Flush whatever is queued; in-flight work then gets cancelled.
        self.flush_inbox();
        self.peer.stop_outstanding();
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        for task in self.work_tasks.drain(..) {
            task.abort();
        }
        if !self.is_active() {
            self.stopped = true;
        }
    }

    async fn finalize(&mut self) {
        // Final checkpoint save. The remote PUT is attempted once more now
        // that all transfers are settled; whatever happens to it, the local
        // mirror is written so a cancelled PUT cannot lose the sequence.
        // An untouched ledger (stopped before the checkpoint fetch) leaves
        // the mirror alone.
        let sequence = self.ledger.committed();
        if self.last_sequence_changed || self.saving_checkpoint {
            let body = self.remote_checkpoint.body_for_save(&sequence.to_string());
            match tokio::time::timeout(
                Duration::from_secs(5),
                self.peer.put_checkpoint(&self.checkpoint_id, body),
            )
            .await
            {
                Ok(Ok(_rev)) => {
                    metrics::record_checkpoint_save(&self.settings.remote_url, true);
                }
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(session_id = %self.session_id, error = %err, "Final checkpoint save failed");
                    metrics::record_checkpoint_save(&self.settings.remote_url, false);
                }
                Err(_) => {
                    warn!(session_id = %self.session_id, "Final checkpoint save timed out");
                }
            }
            self.db
                .set_last_sequence(&sequence.to_string(), &self.checkpoint_id);
        }

        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.reach_task.take() {
            task.abort();
        }
        for task in self.work_tasks.drain(..) {
            task.abort();
        }

        info!(
            session_id = %self.session_id,
            last_sequence = sequence,
            processed = self.changes_processed,
            failed = self.revisions_failed,
            "Replication stopped"
        );

        // Detach from the engine before the stopped notification goes out,
        // so an observer woken by it never sees a stale registry entry.
        if let Some(engine) = self.engine.upgrade() {
            engine.unregister_replicator(&self.session_id);
        }

        let status = self.snapshot(false);
        let _ = self.status_tx.send(status.clone());
        let _ = self.tasks_tx.send(TaskEvent {
            session_id: self.session_id.clone(),
            info: task_info(&self.settings, &status),
            stopped: true,
        });
    }

    fn snapshot(&self, running: bool) -> ReplicatorStatus {
        ReplicatorStatus {
            session_id: self.session_id.clone(),
            running,
            online: self.online,
            active: self.is_active(),
            last_sequence: self.ledger.committed(),
            changes_processed: self.changes_processed,
            changes_total: self.changes_total,
            revisions_failed: self.revisions_failed,
            error: self
                .error
                .as_ref()
                .map(|e| (e.status.http_code(), e.reason().to_string())),
        }
    }

    /// Publish a progress notification.
    fn publish(&mut self) {
        let status = self.snapshot(!self.stopped);
        let changed = self.status_tx.send_if_modified(|current| {
            let differs = current.online != status.online
                || current.active != status.active
                || current.changes_processed != status.changes_processed
                || current.changes_total != status.changes_total
                || current.last_sequence != status.last_sequence
                || current.running != status.running
                || current.revisions_failed != status.revisions_failed;
            if differs {
                *current = status.clone();
            }
            differs
        });
        if changed {
            let _ = self.tasks_tx.send(TaskEvent {
                session_id: self.session_id.clone(),
                info: task_info(&self.settings, &status),
                stopped: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(a.starts_with("repl"));
        let na: u64 = a.trim_start_matches("repl").parse().unwrap();
        let nb: u64 = b.trim_start_matches("repl").parse().unwrap();
        assert!(nb > na);
    }

    #[test]
    fn test_ledger_contiguous_advance() {
        let mut ledger = SequenceLedger::default();
        ledger.queued(1);
        ledger.queued(2);
        ledger.queued(3);
        assert_eq!(ledger.committed(), 0);

        ledger.completed(2);
        // 1 still pending: nothing committed.
        assert_eq!(ledger.committed(), 0);

        ledger.completed(1);
        assert_eq!(ledger.committed(), 2);

        ledger.completed(3);
        assert_eq!(ledger.committed(), 3);
    }

    #[test]
    fn test_ledger_never_passes_a_failure() {
        let mut ledger = SequenceLedger::default();
        ledger.queued(4);
        ledger.queued(5);
        ledger.queued(6);
        ledger.completed(4);
        ledger.failed(5);
        ledger.completed(6);
        // 5 is still pending; the checkpoint may not pass it.
        assert_eq!(ledger.committed(), 4);

        // Retry clears the stall, then the sequence completes.
        ledger.reset_pending();
        ledger.queued(5);
        ledger.queued(6);
        ledger.completed(5);
        ledger.completed(6);
        assert_eq!(ledger.committed(), 6);
    }

    #[test]
    fn test_ledger_adopt() {
        let mut ledger = SequenceLedger::default();
        ledger.adopt(17);
        assert_eq!(ledger.committed(), 17);
        // Sequences at or below the adopted point are ignored.
        ledger.queued(12);
        assert_eq!(ledger.committed(), 17);
        ledger.queued(18);
        ledger.completed(18);
        assert_eq!(ledger.committed(), 18);
    }

    #[test]
    fn test_ledger_sparse_sequences() {
        let mut ledger = SequenceLedger::default();
        ledger.queued(10);
        ledger.queued(20);
        ledger.completed(20);
        assert_eq!(ledger.committed(), 9);
        ledger.completed(10);
        assert_eq!(ledger.committed(), 20);
    }

    #[test]
    fn test_settings_matching_ignores_continuous() {
        let base = ReplicatorSettings {
            db_name: "db".into(),
            remote_url: "http://peer/db".into(),
            push: true,
            continuous: false,
            options: ReplicatorOptions::default(),
        };
        let mut other = base.clone();
        other.continuous = true;
        assert!(base.has_same_settings_as(&other));

        other.options.filter = Some("ddoc/f".into());
        assert!(!base.has_same_settings_as(&other));

        let mut flipped = base.clone();
        flipped.push = false;
        assert!(!base.has_same_settings_as(&flipped));
    }

    #[test]
    fn test_task_info_shapes() {
        let settings = ReplicatorSettings {
            db_name: "db".into(),
            remote_url: "http://peer/db".into(),
            push: true,
            continuous: true,
            options: ReplicatorOptions::default(),
        };
        let mut status = ReplicatorStatus {
            session_id: "repl007".into(),
            running: true,
            online: true,
            active: true,
            changes_processed: 3,
            changes_total: 6,
            ..Default::default()
        };
        let info = task_info(&settings, &status);
        assert_eq!(info["type"], "Replication");
        assert_eq!(info["task"], "repl007");
        assert_eq!(info["source"], "db");
        assert_eq!(info["target"], "http://peer/db");
        assert_eq!(info["status"], "Processed 3 / 6 changes");
        assert_eq!(info["progress"], 50);
        assert_eq!(info["continuous"], true);

        status.active = false;
        assert_eq!(task_info(&settings, &status)["status"], "Idle");
        status.online = false;
        assert_eq!(task_info(&settings, &status)["status"], "Offline");
        status.error = Some((502, "unreachable".into()));
        let info = task_info(&settings, &status);
        assert_eq!(info["error"], json!([502, "unreachable"]));
    }
}
