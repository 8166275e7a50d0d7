//! Configuration for the sync engine.
//!
//! Two layers:
//!
//! - [`EngineConfig`]: process-wide tunables (batch sizing, checkpoint
//!   coalescing, retry cadence). Constructed programmatically or
//!   deserialized from JSON/YAML; [`EngineConfig::for_testing()`] shrinks
//!   every interval so test suites never sit in real timers.
//! - [`ReplicatorOptions`]: the per-replication options map recognized by
//!   `POST /_replicate` (`continuous`, `create_target`, `reset`, `filter`,
//!   `query_params`, `doc_ids`, `headers`, `auth`).
//!
//! # JSON Example
//!
//! ```json
//! {
//!     "source": "local-db",
//!     "target": "http://peer:5984/remote-db",
//!     "continuous": true,
//!     "filter": "ddoc/by_channel",
//!     "query_params": {"channel": "news"}
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Process-wide engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Revisions per replication batch before a forced flush.
    #[serde(default = "default_batcher_capacity")]
    pub batcher_capacity: usize,

    /// Milliseconds the oldest queued revision may wait before a flush.
    #[serde(default = "default_batcher_delay_ms")]
    pub batcher_delay_ms: u64,

    /// Checkpoint save coalescing window, milliseconds.
    #[serde(default = "default_checkpoint_save_interval_ms")]
    pub checkpoint_save_interval_ms: u64,

    /// Delay before retrying failed revisions, milliseconds.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Reachability probe interval, milliseconds.
    #[serde(default = "default_reachability_interval_ms")]
    pub reachability_interval_ms: u64,

    /// Page size the puller requests from the remote `_changes` feed.
    #[serde(default = "default_changes_feed_limit")]
    pub changes_feed_limit: usize,
}

fn default_batcher_capacity() -> usize {
    100
}

fn default_batcher_delay_ms() -> u64 {
    500
}

fn default_checkpoint_save_interval_ms() -> u64 {
    5_000
}

fn default_retry_interval_ms() -> u64 {
    60_000
}

fn default_reachability_interval_ms() -> u64 {
    10_000
}

fn default_changes_feed_limit() -> usize {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batcher_capacity: default_batcher_capacity(),
            batcher_delay_ms: default_batcher_delay_ms(),
            checkpoint_save_interval_ms: default_checkpoint_save_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            reachability_interval_ms: default_reachability_interval_ms(),
            changes_feed_limit: default_changes_feed_limit(),
        }
    }
}

impl EngineConfig {
    /// Millisecond-scale intervals so tests never wait on real timers.
    pub fn for_testing() -> Self {
        Self {
            batcher_capacity: 10,
            batcher_delay_ms: 10,
            checkpoint_save_interval_ms: 20,
            retry_interval_ms: 50,
            reachability_interval_ms: 10,
            changes_feed_limit: 50,
        }
    }

    pub fn batcher_delay(&self) -> Duration {
        Duration::from_millis(self.batcher_delay_ms)
    }

    pub fn checkpoint_save_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_save_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn reachability_interval(&self) -> Duration {
        Duration::from_millis(self.reachability_interval_ms)
    }
}

/// Per-replication options, as recognized in the `POST /_replicate` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplicatorOptions {
    /// Keep running after the initial catch-up.
    #[serde(default)]
    pub continuous: bool,

    /// On push, PUT the remote database if it does not exist.
    #[serde(default)]
    pub create_target: bool,

    /// Clear the local checkpoint before starting.
    #[serde(default)]
    pub reset: bool,

    /// Server-side change filter (`ddoc/name`). The pusher compiles it
    /// locally; the puller forwards it to the remote feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Parameters handed to the filter function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_params: Option<Value>,

    /// Restrict replication to these document IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,

    /// Extra headers attached to every remote request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Credential material (see `Authorizer::from_options`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

/// The full `POST /_replicate` command body.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicateCommand {
    pub source: String,
    pub target: String,
    /// Cancel the matching replication instead of starting one.
    #[serde(default)]
    pub cancel: bool,
    #[serde(flatten)]
    pub options: ReplicatorOptions,
}
