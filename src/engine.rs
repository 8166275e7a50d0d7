// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level engine: the set of open databases plus the replicator
//! registry.
//!
//! The router holds an `Arc<Engine>` as its state; `POST /_replicate`
//! resolves source/target here, constructs the peer transport, and spawns
//! a replicator. The engine owns each replicator handle until the driver
//! detaches itself on stop, which is what keeps `_active_tasks` truthful.

use crate::auth::Authorizer;
use crate::config::{EngineConfig, ReplicateCommand};
use crate::error::{EngineError, Result, Status};
use crate::memory::MemoryDatabaseFactory;
use crate::metrics;
use crate::reachability::ReachabilityProbe;
use crate::remote::{HttpPeer, LocalPeer, Peer};
use crate::replicator::{
    self, ReplicatorContext, ReplicatorHandle, ReplicatorSettings, TaskEvent,
};
use crate::store::{Database, DatabaseFactory};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};
use url::Url;

/// Generate a fresh 32-hex-char identifier (doc IDs, database UUIDs).
pub fn random_uuid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let hi: u128 = rng.gen();
    format!("{:032x}", hi)
}

/// Database names: lowercase letter first, then `[a-z0-9_$()+/-]`.
pub fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    name.chars().all(|c| {
        c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || matches!(c, '_' | '$' | '(' | ')' | '+' | '/' | '-')
    })
}

/// The engine: open databases, replicators, task-event fan-out.
pub struct Engine {
    config: EngineConfig,
    factory: Arc<dyn DatabaseFactory>,
    databases: Mutex<HashMap<String, Arc<dyn Database>>>,
    replicators: Mutex<Vec<Arc<ReplicatorHandle>>>,
    tasks_tx: tokio::sync::broadcast::Sender<TaskEvent>,
    start_time: chrono::DateTime<chrono::Utc>,
    /// Handed to replicator drivers so they can detach on stop without
    /// keeping the engine alive.
    self_ref: Weak<Engine>,
    /// Reachability probe override for spawned replicators (tests).
    probe: Mutex<Option<Arc<dyn ReachabilityProbe>>>,
}

impl Engine {
    pub fn new(factory: Arc<dyn DatabaseFactory>, config: EngineConfig) -> Arc<Engine> {
        let (tasks_tx, _) = tokio::sync::broadcast::channel(256);
        Arc::new_cyclic(|weak| Engine {
            config,
            factory,
            databases: Mutex::new(HashMap::new()),
            replicators: Mutex::new(Vec::new()),
            tasks_tx,
            start_time: chrono::Utc::now(),
            self_ref: weak.clone(),
            probe: Mutex::new(None),
        })
    }

    /// An engine over in-memory databases with default tuning.
    pub fn in_memory() -> Arc<Engine> {
        Self::new(Arc::new(MemoryDatabaseFactory), EngineConfig::default())
    }

    /// In-memory engine with millisecond-scale timers.
    pub fn for_testing() -> Arc<Engine> {
        Self::new(Arc::new(MemoryDatabaseFactory), EngineConfig::for_testing())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Override the reachability probe used by future replicators.
    pub fn set_reachability_probe(&self, probe: Arc<dyn ReachabilityProbe>) {
        *self.probe.lock().unwrap() = Some(probe);
    }

    /// Microsecond start timestamp, as `instance_start_time` reports it.
    pub fn instance_start_time(&self) -> String {
        self.start_time.timestamp_micros().to_string()
    }

    // =========================================================================
    // Databases
    // =========================================================================

    pub fn database(&self, name: &str) -> Option<Arc<dyn Database>> {
        self.databases.lock().unwrap().get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.databases.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<dyn Database>> {
        if !is_valid_database_name(name) {
            return Err(EngineError::with_reason(
                Status::BadId,
                format!("invalid database name '{}'", name),
            ));
        }
        let mut databases = self.databases.lock().unwrap();
        if databases.contains_key(name) {
            return Err(EngineError::new(Status::Duplicate));
        }
        let db = self.factory.open(name)?;
        databases.insert(name.to_string(), Arc::clone(&db));
        info!(db = %name, "Database created");
        Ok(db)
    }

    pub fn delete_database(&self, name: &str) -> Result<()> {
        let removed = self.databases.lock().unwrap().remove(name);
        if removed.is_none() {
            return Err(EngineError::new(Status::NotFound));
        }
        // Stop replicators attached to the dropped database.
        let to_stop: Vec<Arc<ReplicatorHandle>> = self
            .replicators
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.settings.db_name == name)
            .cloned()
            .collect();
        for replicator in to_stop {
            warn!(
                db = %name,
                session_id = %replicator.session_id,
                "Stopping replicator for deleted database"
            );
            replicator.stop();
        }
        info!(db = %name, "Database deleted");
        Ok(())
    }

    // =========================================================================
    // Replication
    // =========================================================================

    pub fn subscribe_tasks(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.tasks_tx.subscribe()
    }

    pub fn replicators(&self) -> Vec<Arc<ReplicatorHandle>> {
        self.replicators.lock().unwrap().clone()
    }

    /// Snapshot of every running replicator's task info.
    pub fn active_tasks(&self) -> Vec<Value> {
        self.replicators
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.is_running())
            .map(|r| r.active_task_info())
            .collect()
    }

    pub(crate) fn unregister_replicator(&self, session_id: &str) {
        let mut replicators = self.replicators.lock().unwrap();
        replicators.retain(|r| r.session_id != session_id);
        metrics::set_active_replicators(replicators.len());
    }

    /// Handle `POST /_replicate`: start a replication, or cancel the one
    /// whose settings match.
    pub fn replicate(&self, command: ReplicateCommand) -> Result<Value> {
        // The authorizer must reach the peer transport (it attaches the
        // headers), not just the replicator (it drives the login flow).
        let authorizer = command
            .options
            .auth
            .as_ref()
            .and_then(Authorizer::from_options);
        let plan = self.resolve(&command, authorizer)?;
        let settings = ReplicatorSettings {
            db_name: plan.db.name().to_string(),
            remote_url: plan.peer.url().to_string(),
            push: plan.push,
            continuous: command.options.continuous,
            options: command.options.clone(),
        };

        if command.cancel {
            let found = self
                .replicators
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.has_same_settings_as(&settings))
                .cloned();
            let Some(replicator) = found else {
                return Err(EngineError::with_reason(
                    Status::NotFound,
                    "no matching replication to cancel",
                ));
            };
            info!(session_id = %replicator.session_id, "Cancelling replication");
            replicator.stop();
            return Ok(json!({"ok": true, "session_id": replicator.session_id}));
        }

        let handle = replicator::spawn(ReplicatorContext {
            db: plan.db,
            peer: plan.peer,
            settings,
            config: self.config.clone(),
            engine: self.self_ref.clone(),
            tasks_tx: self.tasks_tx.clone(),
            authorizer: plan.authorizer,
            probe: self.probe.lock().unwrap().clone(),
        });
        let session_id = handle.session_id.clone();
        {
            let mut replicators = self.replicators.lock().unwrap();
            replicators.push(handle);
            metrics::set_active_replicators(replicators.len());
        }
        Ok(json!({"ok": true, "session_id": session_id}))
    }

    fn resolve(
        &self,
        command: &ReplicateCommand,
        authorizer: Option<Authorizer>,
    ) -> Result<ReplicationPlan> {
        let source_url = parse_remote_url(&command.source);
        let target_url = parse_remote_url(&command.target);

        match (source_url, target_url) {
            (Some(_), Some(_)) => Err(EngineError::with_reason(
                Status::BadRequest,
                "one of source/target must be a local database",
            )),
            // Push to a remote target.
            (None, Some(url)) => {
                let db = self.local_db(&command.source, false, false)?;
                let authorizer = authorizer.or_else(|| Authorizer::from_url(&url));
                let peer =
                    HttpPeer::new(url, authorizer.clone(), command.options.headers.clone())?;
                Ok(ReplicationPlan {
                    db,
                    peer: Arc::new(peer),
                    push: true,
                    authorizer,
                })
            }
            // Pull from a remote source.
            (Some(url), None) => {
                let db =
                    self.local_db(&command.target, true, command.options.create_target)?;
                let authorizer = authorizer.or_else(|| Authorizer::from_url(&url));
                let peer =
                    HttpPeer::new(url, authorizer.clone(), command.options.headers.clone())?;
                Ok(ReplicationPlan {
                    db,
                    peer: Arc::new(peer),
                    push: false,
                    authorizer,
                })
            }
            // Local-to-local: push into the target's handle directly.
            (None, None) => {
                let db = self.local_db(&command.source, false, false)?;
                let target =
                    self.local_db(&command.target, true, command.options.create_target)?;
                Ok(ReplicationPlan {
                    db,
                    peer: Arc::new(LocalPeer::new(target)),
                    push: true,
                    authorizer: None,
                })
            }
        }
    }

    fn local_db(
        &self,
        name: &str,
        is_target: bool,
        create_target: bool,
    ) -> Result<Arc<dyn Database>> {
        if let Some(db) = self.database(name) {
            return Ok(db);
        }
        if is_target && create_target {
            return self.create_database(name);
        }
        Err(EngineError::with_reason(
            Status::NotFound,
            format!("no database named '{}'", name),
        ))
    }
}

struct ReplicationPlan {
    db: Arc<dyn Database>,
    peer: Arc<dyn Peer>,
    push: bool,
    authorizer: Option<Authorizer>,
}

fn parse_remote_url(spec: &str) -> Option<Url> {
    let url = Url::parse(spec).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_uuid_shape() {
        let a = random_uuid();
        let b = random_uuid();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_database_name_validation() {
        assert!(is_valid_database_name("db"));
        assert!(is_valid_database_name("my_db-2(x)+y/z$"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("_users"));
        assert!(!is_valid_database_name("9db"));
        assert!(!is_valid_database_name("DB"));
        assert!(!is_valid_database_name("db name"));
    }

    #[tokio::test]
    async fn test_create_and_delete_database() {
        let engine = Engine::for_testing();
        assert!(engine.database_names().is_empty());

        engine.create_database("db1").unwrap();
        assert!(engine.database("db1").is_some());
        assert_eq!(engine.database_names(), vec!["db1"]);

        let err = engine.create_database("db1").unwrap_err();
        assert_eq!(err.status, Status::Duplicate);

        engine.delete_database("db1").unwrap();
        assert!(engine.database("db1").is_none());
        let err = engine.delete_database("db1").unwrap_err();
        assert_eq!(err.status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_create_database_validates_name() {
        let engine = Engine::for_testing();
        let err = engine.create_database("_bad").unwrap_err();
        assert_eq!(err.status, Status::BadId);
    }

    #[tokio::test]
    async fn test_replicate_rejects_two_remotes() {
        let engine = Engine::for_testing();
        let command: ReplicateCommand = serde_json::from_value(json!({
            "source": "http://a/db",
            "target": "http://b/db"
        }))
        .unwrap();
        let err = engine.replicate(command).unwrap_err();
        assert_eq!(err.status, Status::BadRequest);
    }

    #[tokio::test]
    async fn test_replicate_missing_source_is_not_found() {
        let engine = Engine::for_testing();
        let command: ReplicateCommand = serde_json::from_value(json!({
            "source": "nope",
            "target": "http://peer/db"
        }))
        .unwrap();
        let err = engine.replicate(command).unwrap_err();
        assert_eq!(err.status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_cancel_without_match_is_not_found() {
        let engine = Engine::for_testing();
        engine.create_database("db1").unwrap();
        let command: ReplicateCommand = serde_json::from_value(json!({
            "source": "db1",
            "target": "http://peer/db",
            "cancel": true
        }))
        .unwrap();
        let err = engine.replicate(command).unwrap_err();
        assert_eq!(err.status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_local_replication_end_to_end() {
        let engine = Engine::for_testing();
        let source = engine.create_database("src").unwrap();
        engine.create_database("dst").unwrap();
        source.put(Some("doc1"), json!({"v": 1}), None, false).unwrap();
        source.put(Some("doc2"), json!({"v": 2}), None, false).unwrap();

        let command: ReplicateCommand = serde_json::from_value(json!({
            "source": "src",
            "target": "dst"
        }))
        .unwrap();
        let response = engine.replicate(command).unwrap();
        let session_id = response["session_id"].as_str().unwrap().to_string();
        assert!(session_id.starts_with("repl"));

        // One-shot replication detaches itself when done.
        let handle = engine
            .replicators()
            .into_iter()
            .find(|r| r.session_id == session_id)
            .unwrap();
        handle.wait_stopped().await;

        let target = engine.database("dst").unwrap();
        assert_eq!(target.doc_count(), 2);
        let doc = target.get_document("doc1", None).unwrap();
        assert_eq!(doc.body.unwrap()["v"], 1);

        // The registry no longer lists it.
        assert!(engine.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_local_replication_create_target() {
        let engine = Engine::for_testing();
        let source = engine.create_database("src").unwrap();
        source.put(Some("doc1"), json!({}), None, false).unwrap();

        let command: ReplicateCommand = serde_json::from_value(json!({
            "source": "src",
            "target": "newdb",
            "create_target": true
        }))
        .unwrap();
        engine.replicate(command).unwrap();
        assert!(engine.database("newdb").is_some());
    }
}
