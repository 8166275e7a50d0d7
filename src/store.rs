// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage contract.
//!
//! The storage engine itself (revision trees, attachment blobs, the view
//! indexer) is an external collaborator. This module defines the
//! [`Database`] trait the router and replicator program against, plus the
//! option structs that travel with queries. The crate ships one
//! implementation, [`crate::memory::MemoryDatabase`], as a reference
//! backend for tests and local-to-local replication.
//!
//! Store operations are synchronous: per the engine's concurrency model the
//! suspension points are remote HTTP calls, body streaming, change-feed
//! subscriptions, and timers. Implementations must be cheap enough to call
//! from async tasks without yielding.
//!
//! Filter and view functions are evaluated by an embedded scripting runtime
//! that is likewise external; the contract surfaces it as
//! [`Database::compile_filter`] returning an opaque [`FilterFn`], and as
//! view queries that compile-and-update internally.

use crate::changes::ChangeBroker;
use crate::error::Result;
use crate::revision::{Revision, RevisionList};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled change filter: `(revision, params) -> keep?`.
pub type FilterFn = Arc<dyn Fn(&Revision, &Value) -> bool + Send + Sync>;

/// Options shaping document bodies on the way out.
#[derive(Debug, Clone, Default)]
pub struct DocContentOptions {
    /// Inline attachment data (`attachments=true`).
    pub attachments: bool,
    /// Include `_revisions` history (`revs=true`).
    pub revs: bool,
    /// Include `_conflicts` (`conflicts=true`).
    pub conflicts: bool,
    /// Include `_local_seq` (`local_seq=true`).
    pub local_seq: bool,
    /// Ancestor revision IDs the client already has; attachments whose
    /// `revpos` is at or below the newest common ancestor's generation are
    /// sent as stubs.
    pub atts_since: Vec<String>,
}

/// Options for a `_changes` query against the store.
///
/// Invariant: `sort_by_sequence` and `include_conflicts` are mutually
/// exclusive — conflict mode groups rows by document instead.
#[derive(Debug, Clone)]
pub struct ChangesOptions {
    /// Maximum rows to return (`None` = unlimited).
    pub limit: Option<usize>,
    /// Attach document bodies to each row.
    pub include_docs: bool,
    /// `style=all_docs`: include every leaf revision, grouped by doc.
    pub include_conflicts: bool,
    /// Plain mode: rows ordered by commit sequence.
    pub sort_by_sequence: bool,
    /// Body shaping for `include_docs`.
    pub content_options: DocContentOptions,
    /// Report the store's update sequence alongside the rows.
    pub update_seq: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self {
            limit: None,
            include_docs: false,
            include_conflicts: false,
            sort_by_sequence: true,
            content_options: DocContentOptions::default(),
            update_seq: false,
        }
    }
}

impl ChangesOptions {
    /// Switch conflict mode on or off, keeping the sort invariant.
    pub fn set_conflict_mode(&mut self, on: bool) {
        self.include_conflicts = on;
        self.sort_by_sequence = !on;
    }
}

/// Options for `_all_docs` and view queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit key set (POST `{keys: [...]}`).
    pub keys: Option<Vec<Value>>,
    /// Rows to skip from the start of the range.
    pub skip: usize,
    /// Maximum rows (`None` = unlimited).
    pub limit: Option<usize>,
    /// Inclusive range start.
    pub start_key: Option<Value>,
    /// Inclusive range end.
    pub end_key: Option<Value>,
    /// Reverse the traversal.
    pub descending: bool,
    /// Run the reduce function, when the view has one.
    pub reduce: Option<bool>,
    /// Group reduced rows by key.
    pub group: bool,
    /// Group reduced rows by key prefix of this length.
    pub group_level: u64,
    /// Attach document bodies to each row.
    pub include_docs: bool,
    /// Report the update sequence alongside the rows.
    pub update_seq: bool,
    /// Skip the index refresh (`stale=ok`).
    pub stale: bool,
}

/// One row of an `_all_docs` or view response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// Result of an `_all_docs` or view query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
    pub total_rows: u64,
    pub offset: u64,
    pub update_seq: Option<u64>,
}

/// The database handle contract.
///
/// One instance per open database. Implementations own their change
/// broker and are shared behind `Arc<dyn Database>`; interior mutability
/// is the implementation's concern, but locks must never be held across
/// suspension points (all methods are synchronous precisely so they cannot
/// be).
pub trait Database: Send + Sync + std::fmt::Debug {
    /// Database name (validated by the router on creation).
    fn name(&self) -> &str;

    /// Stable private identity, used in checkpoint IDs.
    fn private_uuid(&self) -> String;

    /// Public identity reported by `GET /db`.
    fn public_uuid(&self) -> String;

    /// Number of live (non-deleted) documents.
    fn doc_count(&self) -> u64;

    /// Latest commit sequence.
    fn last_sequence_number(&self) -> u64;

    /// Approximate on-disk footprint in bytes.
    fn disk_size(&self) -> u64;

    /// Begin a transaction. Not reentrant.
    fn begin_transaction(&self);

    /// End the open transaction, committing or rolling back.
    fn end_transaction(&self, commit: bool);

    /// Create or update a document.
    ///
    /// `prev_rev_id` must name the current winning revision (or be `None`
    /// for a new document), otherwise the update conflicts. `deleting`
    /// writes a tombstone. A generated doc ID is used when `doc_id` is
    /// `None`.
    fn put(
        &self,
        doc_id: Option<&str>,
        body: Value,
        prev_rev_id: Option<&str>,
        deleting: bool,
    ) -> Result<Revision>;

    /// Insert a revision with an explicit history (replication path).
    ///
    /// `history` lists revision IDs newest-first, starting with
    /// `rev.rev_id` itself. Ancestors already present are left untouched;
    /// missing ones are grafted in as bodiless interior nodes.
    ///
    /// `source` names the peer the revision arrived from, when any; it is
    /// carried on the change notification so a pusher replicating back to
    /// that same peer can skip the echo.
    fn force_insert(&self, rev: &Revision, history: &[String], source: Option<&str>)
        -> Result<()>;

    /// Fetch a revision. `rev_id = None` returns the current winner and
    /// fails with `Deleted` when the winner is a tombstone.
    fn get_document(&self, doc_id: &str, rev_id: Option<&str>) -> Result<Revision>;

    /// Revision IDs from `rev_id` back to the root, newest first.
    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Vec<String>;

    /// All revisions of a document; leaves only when `only_leaves`.
    fn get_all_revisions(&self, doc_id: &str, only_leaves: bool) -> RevisionList;

    /// Non-winning, non-deleted leaf revision IDs.
    fn conflicting_rev_ids(&self, doc_id: &str) -> Vec<String>;

    /// Fetch a local (non-replicated) document: `(rev, body)`.
    fn get_local_document(&self, doc_id: &str) -> Option<(String, Value)>;

    /// Write (`Some(body)`) or delete (`None`) a local document. Returns
    /// the new local revision, or `None` on delete.
    fn put_local_document(
        &self,
        doc_id: &str,
        body: Option<Value>,
        prev_rev_id: Option<&str>,
    ) -> Result<Option<String>>;

    /// Query the primary index.
    fn all_docs(&self, options: &QueryOptions) -> Result<QueryResult>;

    /// Changes committed after `since`, optionally filtered.
    ///
    /// Rows are leaf revisions ordered by sequence; in conflict mode every
    /// leaf of a changed document appears, otherwise only winners.
    fn changes_since(
        &self,
        since: u64,
        options: &ChangesOptions,
        filter: Option<&FilterFn>,
        filter_params: &Value,
    ) -> Result<RevisionList>;

    /// Remove from `revs` every revision this store already has.
    fn find_missing_revisions(&self, revs: &mut RevisionList);

    /// Known revision IDs of `rev.doc_id` with generation below the
    /// revision's own, newest first, at most `limit` (0 = unlimited).
    fn possible_ancestors(&self, rev: &Revision, limit: usize) -> Vec<String>;

    /// Drop non-leaf revision bodies.
    fn compact(&self) -> Result<()>;

    /// Permanently remove the given revisions (`"*"` removes the doc).
    /// Returns what was actually purged, per document.
    fn purge(
        &self,
        docs: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>>;

    /// Compile a named filter (`ddoc/filter`) via the scripting runtime.
    fn compile_filter(&self, name: &str) -> Result<FilterFn>;

    /// Query a design-document view, refreshing its index first unless the
    /// options say `stale`.
    fn query_view(&self, ddoc: &str, view: &str, options: &QueryOptions) -> Result<QueryResult>;

    /// Compile `{map, reduce?}` as a disposable view, query it, tear it
    /// down.
    fn query_temp_view(&self, definition: &Value, options: &QueryOptions) -> Result<QueryResult>;

    /// Checkpoint mirror: last saved sequence for a checkpoint ID.
    fn last_sequence_with_checkpoint_id(&self, checkpoint_id: &str) -> Option<String>;

    /// Checkpoint mirror: record the last saved sequence.
    fn set_last_sequence(&self, sequence: &str, checkpoint_id: &str);

    /// The change-notification broker for this database.
    fn changes_broker(&self) -> &ChangeBroker;
}

/// Opens database handles by name. The engine calls this on `PUT /db` and
/// when lazily reattaching to databases the backend already has.
pub trait DatabaseFactory: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn Database>>;
}
