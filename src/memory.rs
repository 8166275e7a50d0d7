// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory reference store.
//!
//! [`MemoryDatabase`] implements the [`Database`] contract with a full
//! revision tree per document: deterministic winner selection among leaves,
//! a commit-sequence log driving the change feeds, local (non-replicated)
//! documents, the checkpoint mirror, and a registry seam standing in for
//! the scripting runtime (tests register plain Rust closures as filters,
//! views, and view compilers).
//!
//! # Winner Selection
//!
//! Among leaf revisions, non-deleted leaves beat tombstones; ties break by
//! generation, then by suffix bytes. This is stable across processes, so
//! two stores that hold the same revision tree agree on the winner.
//!
//! # Transactions
//!
//! `begin_transaction` snapshots the whole state; rollback restores it.
//! Change notifications raised inside a transaction are buffered and only
//! posted on commit, so subscribers never observe rolled-back sequences.
//!
//! All state sits behind one `std::sync::Mutex` that is never held across
//! an await point (the contract's methods are synchronous).

use crate::changes::{ChangeBroker, ChangeEvent};
use crate::engine::random_uuid;
use crate::error::{EngineError, Result, Status};
use crate::revision::{compare_rev_ids, parse_rev_id, Revision, RevisionList};
use crate::store::{
    ChangesOptions, Database, DatabaseFactory, FilterFn, QueryOptions, QueryResult, QueryRow,
};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A map function: document body (with `_id`/`_rev`) to emitted rows.
pub type MapFn = Arc<dyn Fn(&Value) -> Vec<(Value, Value)> + Send + Sync>;

/// A reduce function over emitted `(key, value)` rows.
pub type ReduceFn = Arc<dyn Fn(&[(Value, Value)]) -> Value + Send + Sync>;

/// A view definition as the scripting runtime would compile it.
#[derive(Clone)]
pub struct CompiledView {
    pub map: MapFn,
    pub reduce: Option<ReduceFn>,
}

/// Compiles a `{map, reduce?}` definition (the `_temp_view` path).
pub type ViewCompiler = Arc<dyn Fn(&Value) -> Result<CompiledView> + Send + Sync>;

/// CouchDB-style collation over JSON values:
/// null < false < true < numbers < strings < arrays < objects.
pub fn collate_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ea, eb) in x.iter().zip(y.iter()) {
                let ord = collate_json(ea, eb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let ka: Vec<&String> = x.keys().collect();
            let kb: Vec<&String> = y.keys().collect();
            ka.cmp(&kb).then_with(|| x.len().cmp(&y.len()))
        }
        _ => Ordering::Equal,
    }
}

/// One node in a document's revision tree.
#[derive(Debug, Clone)]
struct RevNode {
    parent: Option<String>,
    deleted: bool,
    body: Option<Value>,
    sequence: u64,
}

#[derive(Debug, Clone, Default)]
struct DocTree {
    nodes: HashMap<String, RevNode>,
}

impl DocTree {
    fn leaves(&self) -> Vec<&str> {
        self.nodes
            .keys()
            .filter(|rev_id| {
                !self
                    .nodes
                    .values()
                    .any(|n| n.parent.as_deref() == Some(rev_id.as_str()))
            })
            .map(String::as_str)
            .collect()
    }

    /// Deterministic winner: non-deleted leaves first, then rev-ID order.
    fn winner(&self) -> Option<&str> {
        let leaves = self.leaves();
        let live: Vec<&&str> = leaves
            .iter()
            .filter(|id| !self.nodes[**id].deleted)
            .collect();
        let pool: Vec<&str> = if live.is_empty() {
            leaves.clone()
        } else {
            live.into_iter().copied().collect()
        };
        pool.into_iter().max_by(|a, b| compare_rev_ids(a, b))
    }

    fn history(&self, rev_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = Some(rev_id.to_string());
        while let Some(id) = current {
            match self.nodes.get(&id) {
                Some(node) => {
                    current = node.parent.clone();
                    out.push(id);
                }
                None => break,
            }
        }
        out
    }
}

#[derive(Clone, Default)]
struct Inner {
    docs: HashMap<String, DocTree>,
    local_docs: HashMap<String, (u64, Value)>,
    checkpoints: HashMap<String, String>,
    last_seq: u64,
    filters: HashMap<String, FilterFn>,
    views: HashMap<String, CompiledView>,
    view_compiler: Option<ViewCompiler>,
    /// Snapshot taken by `begin_transaction`, minus this field itself.
    txn_backup: Option<Box<Inner>>,
    /// Change events held back until the open transaction commits.
    txn_events: Vec<ChangeEvent>,
    in_txn: bool,
}

/// In-memory [`Database`] implementation.
pub struct MemoryDatabase {
    name: String,
    private_uuid: String,
    public_uuid: String,
    broker: ChangeBroker,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.name)
            .field("private_uuid", &self.private_uuid)
            .field("public_uuid", &self.public_uuid)
            .finish()
    }
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private_uuid: random_uuid(),
            public_uuid: random_uuid(),
            broker: ChangeBroker::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a named filter (`ddoc/name`), standing in for the
    /// scripting runtime compiling a design-document function.
    pub fn register_filter(&self, name: impl Into<String>, filter: FilterFn) {
        self.inner.lock().unwrap().filters.insert(name.into(), filter);
    }

    /// Register a named view (`ddoc/view`).
    pub fn register_view(&self, name: impl Into<String>, view: CompiledView) {
        self.inner.lock().unwrap().views.insert(name.into(), view);
    }

    /// Install the `_temp_view` compiler.
    pub fn set_view_compiler(&self, compiler: ViewCompiler) {
        self.inner.lock().unwrap().view_compiler = Some(compiler);
    }

    fn post_or_buffer(&self, inner: &mut Inner, event: ChangeEvent) {
        if inner.in_txn {
            inner.txn_events.push(event);
        } else {
            self.broker.post(event);
        }
    }

    fn generate_rev_id(parent: Option<&str>, deleted: bool, body: &Value) -> String {
        let generation = parent.and_then(parse_rev_id).map(|(g, _)| g).unwrap_or(0) + 1;
        let mut hasher = Sha1::new();
        hasher.update(parent.unwrap_or("").as_bytes());
        hasher.update([deleted as u8]);
        hasher.update(crate::checkpoint::canonical_json(body).as_bytes());
        let digest = hasher.finalize();
        let suffix: String = digest
            .iter()
            .take(16)
            .map(|b| format!("{:02x}", b))
            .collect();
        format!("{}-{}", generation, suffix)
    }

    /// Strip reserved keys that are identity, not content.
    fn scrub_body(body: Value) -> Value {
        match body {
            Value::Object(map) => {
                let scrubbed: Map<String, Value> = map
                    .into_iter()
                    .filter(|(k, _)| {
                        !matches!(k.as_str(), "_id" | "_rev" | "_revisions" | "_deleted")
                    })
                    .collect();
                Value::Object(scrubbed)
            }
            other => other,
        }
    }

    fn change_event(
        &self,
        tree: &DocTree,
        rev: &Revision,
        source: Option<&str>,
    ) -> ChangeEvent {
        let winning = tree.winner().unwrap_or(&rev.rev_id).to_string();
        let live_leaves = tree
            .leaves()
            .iter()
            .filter(|id| !tree.nodes[**id].deleted)
            .count();
        ChangeEvent {
            revision: rev.clone(),
            winning_rev_id: winning,
            in_conflict: live_leaves > 1,
            source: source.map(str::to_string),
        }
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn private_uuid(&self) -> String {
        self.private_uuid.clone()
    }

    fn public_uuid(&self) -> String {
        self.public_uuid.clone()
    }

    fn doc_count(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .docs
            .values()
            .filter(|tree| {
                tree.winner()
                    .map(|w| !tree.nodes[w].deleted)
                    .unwrap_or(false)
            })
            .count() as u64
    }

    fn last_sequence_number(&self) -> u64 {
        self.inner.lock().unwrap().last_seq
    }

    fn disk_size(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .docs
            .values()
            .flat_map(|tree| tree.nodes.values())
            .filter_map(|node| node.body.as_ref())
            .map(|body| body.to_string().len() as u64)
            .sum()
    }

    fn begin_transaction(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_txn {
            warn!(db = %self.name, "Nested transaction ignored");
            return;
        }
        let mut snapshot = inner.clone();
        snapshot.txn_backup = None;
        snapshot.txn_events.clear();
        inner.txn_backup = Some(Box::new(snapshot));
        inner.in_txn = true;
    }

    fn end_transaction(&self, commit: bool) {
        let events = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.in_txn {
                return;
            }
            let backup = inner.txn_backup.take();
            let events = std::mem::take(&mut inner.txn_events);
            inner.in_txn = false;
            if !commit {
                if let Some(backup) = backup {
                    *inner = *backup;
                }
                return;
            }
            events
        };
        for event in events {
            self.broker.post(event);
        }
    }

    fn put(
        &self,
        doc_id: Option<&str>,
        body: Value,
        prev_rev_id: Option<&str>,
        deleting: bool,
    ) -> Result<Revision> {
        let mut inner = self.inner.lock().unwrap();
        let doc_id = match doc_id {
            Some(id) => id.to_string(),
            None => random_uuid(),
        };

        let tree = inner.docs.entry(doc_id.clone()).or_default();
        let winner = tree.winner().map(str::to_string);
        let winner_deleted = winner
            .as_deref()
            .map(|w| tree.nodes[w].deleted)
            .unwrap_or(true);

        let parent = match (prev_rev_id, &winner) {
            (Some(prev), Some(w)) => {
                if prev != w {
                    return Err(EngineError::new(Status::Conflict));
                }
                Some(prev.to_string())
            }
            (Some(_), None) => return Err(EngineError::new(Status::Conflict)),
            (None, Some(w)) => {
                if !winner_deleted {
                    // Updating a live doc requires naming its revision.
                    return Err(EngineError::new(Status::Conflict));
                }
                // Recreation extends the tombstone's branch.
                Some(w.clone())
            }
            (None, None) => None,
        };

        if deleting && winner.is_none() {
            return Err(EngineError::new(Status::NotFound));
        }

        let body = Self::scrub_body(body);
        let rev_id = Self::generate_rev_id(parent.as_deref(), deleting, &body);
        inner.last_seq += 1;
        let sequence = inner.last_seq;

        let tree = inner.docs.get_mut(&doc_id).unwrap();
        tree.nodes.insert(
            rev_id.clone(),
            RevNode {
                parent,
                deleted: deleting,
                body: if deleting { None } else { Some(body.clone()) },
                sequence,
            },
        );

        let rev = Revision {
            doc_id: doc_id.clone(),
            rev_id,
            deleted: deleting,
            sequence: Some(sequence),
            body: if deleting { None } else { Some(body) },
        };
        debug!(db = %self.name, doc_id = %doc_id, rev_id = %rev.rev_id, seq = sequence, "put");

        let event = self.change_event(inner.docs.get(&doc_id).unwrap(), &rev, None);
        self.post_or_buffer(&mut inner, event);
        Ok(rev)
    }

    fn force_insert(&self, rev: &Revision, history: &[String], source: Option<&str>) -> Result<()> {
        if parse_rev_id(&rev.rev_id).is_none() {
            return Err(EngineError::with_reason(Status::BadId, "invalid rev ID"));
        }
        let mut chain: Vec<String> = if history.is_empty() {
            vec![rev.rev_id.clone()]
        } else {
            history.to_vec()
        };
        if chain[0] != rev.rev_id {
            return Err(EngineError::with_reason(
                Status::BadRequest,
                "history does not start at the inserted revision",
            ));
        }
        // Generations must descend one per step.
        for window in chain.windows(2) {
            let (ga, gb) = match (parse_rev_id(&window[0]), parse_rev_id(&window[1])) {
                (Some((ga, _)), Some((gb, _))) => (ga, gb),
                _ => return Err(EngineError::with_reason(Status::BadId, "invalid rev ID")),
            };
            if ga != gb + 1 {
                return Err(EngineError::with_reason(
                    Status::BadRequest,
                    "revision history is not contiguous",
                ));
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let tree = inner.docs.entry(rev.doc_id.clone()).or_default();
        if tree.nodes.contains_key(&rev.rev_id) {
            // Already known: nothing to do, and no change to announce.
            return Ok(());
        }

        // Graft the chain bottom-up, reusing ancestors already present.
        chain.reverse();
        let mut parent: Option<String> = None;
        for (i, id) in chain.iter().enumerate() {
            let is_tip = i == chain.len() - 1;
            if tree.nodes.contains_key(id) {
                parent = Some(id.clone());
                continue;
            }
            tree.nodes.insert(
                id.clone(),
                RevNode {
                    parent: parent.clone(),
                    deleted: if is_tip { rev.deleted } else { false },
                    body: if is_tip {
                        rev.body.clone().map(Self::scrub_body)
                    } else {
                        None
                    },
                    sequence: 0,
                },
            );
            parent = Some(id.clone());
        }

        inner.last_seq += 1;
        let sequence = inner.last_seq;
        let tree = inner.docs.get_mut(&rev.doc_id).unwrap();
        tree.nodes.get_mut(&rev.rev_id).unwrap().sequence = sequence;

        let inserted = Revision {
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            deleted: rev.deleted,
            sequence: Some(sequence),
            body: None,
        };
        debug!(
            db = %self.name,
            doc_id = %rev.doc_id,
            rev_id = %rev.rev_id,
            seq = sequence,
            "force insert"
        );
        let event = self.change_event(inner.docs.get(&rev.doc_id).unwrap(), &inserted, source);
        self.post_or_buffer(&mut inner, event);
        Ok(())
    }

    fn get_document(&self, doc_id: &str, rev_id: Option<&str>) -> Result<Revision> {
        let inner = self.inner.lock().unwrap();
        let tree = inner
            .docs
            .get(doc_id)
            .ok_or_else(|| EngineError::new(Status::NotFound))?;
        let rev_id = match rev_id {
            Some(id) => id.to_string(),
            None => {
                let winner = tree
                    .winner()
                    .ok_or_else(|| EngineError::new(Status::NotFound))?;
                if tree.nodes[winner].deleted {
                    return Err(EngineError::new(Status::Deleted));
                }
                winner.to_string()
            }
        };
        let node = tree
            .nodes
            .get(&rev_id)
            .ok_or_else(|| EngineError::new(Status::NotFound))?;
        Ok(Revision {
            doc_id: doc_id.to_string(),
            rev_id,
            deleted: node.deleted,
            sequence: Some(node.sequence),
            body: node.body.clone(),
        })
    }

    fn revision_history(&self, doc_id: &str, rev_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .docs
            .get(doc_id)
            .map(|tree| tree.history(rev_id))
            .unwrap_or_default()
    }

    fn get_all_revisions(&self, doc_id: &str, only_leaves: bool) -> RevisionList {
        let inner = self.inner.lock().unwrap();
        let Some(tree) = inner.docs.get(doc_id) else {
            return RevisionList::new();
        };
        let leaf_set: Vec<&str> = tree.leaves();
        let mut revs: Vec<Revision> = tree
            .nodes
            .iter()
            .filter(|(id, _)| !only_leaves || leaf_set.contains(&id.as_str()))
            .map(|(id, node)| Revision {
                doc_id: doc_id.to_string(),
                rev_id: id.clone(),
                deleted: node.deleted,
                sequence: Some(node.sequence),
                body: node.body.clone(),
            })
            .collect();
        revs.sort_by(|a, b| compare_rev_ids(&a.rev_id, &b.rev_id));
        RevisionList::from(revs)
    }

    fn conflicting_rev_ids(&self, doc_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let Some(tree) = inner.docs.get(doc_id) else {
            return Vec::new();
        };
        let winner = tree.winner().map(str::to_string);
        let mut out: Vec<String> = tree
            .leaves()
            .into_iter()
            .filter(|id| Some(*id) != winner.as_deref() && !tree.nodes[*id].deleted)
            .map(str::to_string)
            .collect();
        out.sort_by(|a, b| compare_rev_ids(b, a));
        out
    }

    fn get_local_document(&self, doc_id: &str) -> Option<(String, Value)> {
        let inner = self.inner.lock().unwrap();
        inner
            .local_docs
            .get(doc_id)
            .map(|(gen, body)| (format!("0-{}", gen), body.clone()))
    }

    fn put_local_document(
        &self,
        doc_id: &str,
        body: Option<Value>,
        prev_rev_id: Option<&str>,
    ) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        let current_gen = inner.local_docs.get(doc_id).map(|(gen, _)| *gen);
        if let Some(gen) = current_gen {
            let expected = format!("0-{}", gen);
            if prev_rev_id != Some(expected.as_str()) {
                return Err(EngineError::new(Status::Conflict));
            }
        } else if prev_rev_id.is_some() {
            return Err(EngineError::new(Status::Conflict));
        }

        match body {
            Some(body) => {
                let next = current_gen.unwrap_or(0) + 1;
                inner
                    .local_docs
                    .insert(doc_id.to_string(), (next, Self::scrub_body(body)));
                Ok(Some(format!("0-{}", next)))
            }
            None => {
                if current_gen.is_none() {
                    return Err(EngineError::new(Status::NotFound));
                }
                inner.local_docs.remove(doc_id);
                Ok(None)
            }
        }
    }

    fn all_docs(&self, options: &QueryOptions) -> Result<QueryResult> {
        let inner = self.inner.lock().unwrap();
        let total_rows = inner
            .docs
            .values()
            .filter(|tree| {
                tree.winner()
                    .map(|w| !tree.nodes[w].deleted)
                    .unwrap_or(false)
            })
            .count() as u64;

        let row_for = |doc_id: &str, tree: &DocTree| -> Option<QueryRow> {
            let winner = tree.winner()?;
            let node = &tree.nodes[winner];
            let mut value = json!({"rev": winner});
            if node.deleted {
                value["deleted"] = json!(true);
            }
            let doc = if options.include_docs && !node.deleted {
                let rev = Revision {
                    doc_id: doc_id.to_string(),
                    rev_id: winner.to_string(),
                    deleted: false,
                    sequence: Some(node.sequence),
                    body: node.body.clone(),
                };
                Some(rev.body_for_wire())
            } else {
                None
            };
            Some(QueryRow {
                id: Some(doc_id.to_string()),
                key: json!(doc_id),
                value,
                doc,
            })
        };

        let mut rows: Vec<QueryRow> = Vec::new();
        if let Some(keys) = &options.keys {
            for key in keys {
                let doc_id = key.as_str().unwrap_or_default();
                match inner.docs.get(doc_id).and_then(|t| row_for(doc_id, t)) {
                    Some(row) => rows.push(row),
                    None => rows.push(QueryRow {
                        id: None,
                        key: key.clone(),
                        value: json!({"error": "not_found"}),
                        doc: None,
                    }),
                }
            }
        } else {
            let mut ids: Vec<&String> = inner
                .docs
                .iter()
                .filter(|(_, tree)| {
                    tree.winner()
                        .map(|w| !tree.nodes[w].deleted)
                        .unwrap_or(false)
                })
                .map(|(id, _)| id)
                .collect();
            ids.sort();
            if options.descending {
                ids.reverse();
            }
            for id in ids {
                let key = json!(id);
                if let Some(start) = &options.start_key {
                    let ord = collate_json(&key, start);
                    let out_of_range = if options.descending {
                        ord == Ordering::Greater
                    } else {
                        ord == Ordering::Less
                    };
                    if out_of_range {
                        continue;
                    }
                }
                if let Some(end) = &options.end_key {
                    let ord = collate_json(&key, end);
                    let out_of_range = if options.descending {
                        ord == Ordering::Less
                    } else {
                        ord == Ordering::Greater
                    };
                    if out_of_range {
                        continue;
                    }
                }
                if let Some(row) = row_for(id, &inner.docs[id]) {
                    rows.push(row);
                }
            }
        }

        let offset = options.skip.min(rows.len());
        let mut rows: Vec<QueryRow> = rows.into_iter().skip(options.skip).collect();
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }

        Ok(QueryResult {
            rows,
            total_rows,
            offset: offset as u64,
            update_seq: options.update_seq.then_some(inner.last_seq),
        })
    }

    fn changes_since(
        &self,
        since: u64,
        options: &ChangesOptions,
        filter: Option<&FilterFn>,
        filter_params: &Value,
    ) -> Result<RevisionList> {
        let inner = self.inner.lock().unwrap();
        let mut revs: Vec<Revision> = Vec::new();
        for (doc_id, tree) in &inner.docs {
            for leaf in tree.leaves() {
                let node = &tree.nodes[leaf];
                if node.sequence <= since {
                    continue;
                }
                revs.push(Revision {
                    doc_id: doc_id.clone(),
                    rev_id: leaf.to_string(),
                    deleted: node.deleted,
                    sequence: Some(node.sequence),
                    body: node.body.clone(),
                });
            }
        }
        revs.sort_by_key(Revision::sequence_or_zero);

        if let Some(filter) = filter {
            revs.retain(|rev| filter(rev, filter_params));
        }

        let mut list = if options.sort_by_sequence {
            RevisionList::from(revs)
        } else {
            // Conflict mode: group by doc, doc order by first sequence.
            let sequenced = RevisionList::from(revs);
            let mut flat = Vec::new();
            for (_, group) in sequenced.grouped_by_doc_id() {
                flat.extend(group.into_iter().cloned());
            }
            RevisionList::from(flat)
        };
        if let Some(limit) = options.limit {
            list.truncate(limit);
        }
        Ok(list)
    }

    fn find_missing_revisions(&self, revs: &mut RevisionList) {
        let inner = self.inner.lock().unwrap();
        revs.retain(|rev| {
            inner
                .docs
                .get(&rev.doc_id)
                .map(|tree| !tree.nodes.contains_key(&rev.rev_id))
                .unwrap_or(true)
        });
    }

    fn possible_ancestors(&self, rev: &Revision, limit: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let Some(tree) = inner.docs.get(&rev.doc_id) else {
            return Vec::new();
        };
        let generation = rev.generation();
        let mut out: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(id, _)| {
                parse_rev_id(id)
                    .map(|(g, _)| g < generation)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        out.sort_by(|a, b| compare_rev_ids(b, a));
        if limit > 0 {
            out.truncate(limit);
        }
        out
    }

    fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0usize;
        for tree in inner.docs.values_mut() {
            let leaves: Vec<String> = tree.leaves().iter().map(|s| s.to_string()).collect();
            for (id, node) in tree.nodes.iter_mut() {
                if !leaves.contains(id) && node.body.is_some() {
                    node.body = None;
                    dropped += 1;
                }
            }
        }
        debug!(db = %self.name, dropped, "compacted");
        Ok(())
    }

    fn purge(
        &self,
        docs: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut inner = self.inner.lock().unwrap();
        let mut purged = HashMap::new();
        for (doc_id, rev_ids) in docs {
            let Some(tree) = inner.docs.get_mut(doc_id) else {
                purged.insert(doc_id.clone(), Vec::new());
                continue;
            };
            let mut removed = Vec::new();
            if rev_ids.iter().any(|r| r == "*") {
                removed = tree.nodes.keys().cloned().collect();
                inner.docs.remove(doc_id);
            } else {
                for rev_id in rev_ids {
                    if tree.nodes.remove(rev_id).is_some() {
                        removed.push(rev_id.clone());
                    }
                }
                if tree.nodes.is_empty() {
                    inner.docs.remove(doc_id);
                }
            }
            purged.insert(doc_id.clone(), removed);
        }
        Ok(purged)
    }

    fn compile_filter(&self, name: &str) -> Result<FilterFn> {
        let inner = self.inner.lock().unwrap();
        inner.filters.get(name).cloned().ok_or_else(|| {
            EngineError::with_reason(Status::NotFound, format!("no filter named '{}'", name))
        })
    }

    fn query_view(&self, ddoc: &str, view: &str, options: &QueryOptions) -> Result<QueryResult> {
        let compiled = {
            let inner = self.inner.lock().unwrap();
            let name = format!("{}/{}", ddoc, view);
            inner.views.get(&name).cloned().ok_or_else(|| {
                EngineError::with_reason(Status::NotFound, format!("no view named '{}'", name))
            })?
        };
        self.run_view(&compiled, options)
    }

    fn query_temp_view(&self, definition: &Value, options: &QueryOptions) -> Result<QueryResult> {
        let compiler = {
            let inner = self.inner.lock().unwrap();
            inner.view_compiler.clone()
        };
        let compiler = compiler.ok_or_else(|| {
            EngineError::with_reason(Status::BadRequest, "no view compiler installed")
        })?;
        // Compiled on the fly and dropped on return; nothing to tear down
        // beyond letting the closure go.
        let compiled = compiler(definition)?;
        self.run_view(&compiled, options)
    }

    fn last_sequence_with_checkpoint_id(&self, checkpoint_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.checkpoints.get(checkpoint_id).cloned()
    }

    fn set_last_sequence(&self, sequence: &str, checkpoint_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .checkpoints
            .insert(checkpoint_id.to_string(), sequence.to_string());
    }

    fn changes_broker(&self) -> &ChangeBroker {
        &self.broker
    }
}

impl MemoryDatabase {
    /// Index update plus query. The "index" here is recomputed per query,
    /// which keeps the reference store honest about `stale` semantics
    /// without persisting anything.
    fn run_view(&self, view: &CompiledView, options: &QueryOptions) -> Result<QueryResult> {
        let inner = self.inner.lock().unwrap();
        let mut emitted: Vec<(Value, Value, String)> = Vec::new();
        for (doc_id, tree) in &inner.docs {
            let Some(winner) = tree.winner() else { continue };
            let node = &tree.nodes[winner];
            if node.deleted {
                continue;
            }
            let rev = Revision {
                doc_id: doc_id.clone(),
                rev_id: winner.to_string(),
                deleted: false,
                sequence: Some(node.sequence),
                body: node.body.clone(),
            };
            let wire = rev.body_for_wire();
            for (key, value) in (view.map)(&wire) {
                emitted.push((key, value, doc_id.clone()));
            }
        }
        emitted.sort_by(|a, b| {
            collate_json(&a.0, &b.0).then_with(|| a.2.cmp(&b.2))
        });
        if options.descending {
            emitted.reverse();
        }

        let in_range = |key: &Value| -> bool {
            if let Some(keys) = &options.keys {
                return keys.iter().any(|k| collate_json(k, key) == Ordering::Equal);
            }
            if let Some(start) = &options.start_key {
                let ord = collate_json(key, start);
                let bad = if options.descending {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                };
                if bad {
                    return false;
                }
            }
            if let Some(end) = &options.end_key {
                let ord = collate_json(key, end);
                let bad = if options.descending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };
                if bad {
                    return false;
                }
            }
            true
        };
        let filtered: Vec<&(Value, Value, String)> =
            emitted.iter().filter(|(k, _, _)| in_range(k)).collect();
        let total_rows = filtered.len() as u64;

        // A view with a reduce runs it unless the query opts out.
        let use_reduce = view.reduce.is_some() && options.reduce.unwrap_or(true);
        if use_reduce {
            let reduce = view.reduce.as_ref().unwrap();
            let pairs: Vec<(Value, Value)> = filtered
                .iter()
                .map(|(k, v, _)| (k.clone(), v.clone()))
                .collect();
            let rows = if options.group {
                let mut groups: Vec<(Value, Vec<(Value, Value)>)> = Vec::new();
                for (k, v) in pairs {
                    match groups.last_mut() {
                        Some((gk, items)) if collate_json(gk, &k) == Ordering::Equal => {
                            items.push((k, v));
                        }
                        _ => groups.push((k.clone(), vec![(k, v)])),
                    }
                }
                groups
                    .into_iter()
                    .map(|(key, items)| QueryRow {
                        id: None,
                        key,
                        value: reduce(&items),
                        doc: None,
                    })
                    .collect()
            } else {
                vec![QueryRow {
                    id: None,
                    key: Value::Null,
                    value: reduce(&pairs),
                    doc: None,
                }]
            };
            return Ok(QueryResult {
                rows,
                total_rows,
                offset: 0,
                update_seq: options.update_seq.then_some(inner.last_seq),
            });
        }

        let offset = options.skip.min(filtered.len());
        let mut rows: Vec<QueryRow> = filtered
            .into_iter()
            .skip(options.skip)
            .map(|(key, value, doc_id)| {
                let doc = if options.include_docs {
                    inner.docs.get(doc_id).and_then(|tree| {
                        let w = tree.winner()?;
                        let node = &tree.nodes[w];
                        let rev = Revision {
                            doc_id: doc_id.clone(),
                            rev_id: w.to_string(),
                            deleted: node.deleted,
                            sequence: Some(node.sequence),
                            body: node.body.clone(),
                        };
                        Some(rev.body_for_wire())
                    })
                } else {
                    None
                };
                QueryRow {
                    id: Some(doc_id.clone()),
                    key: key.clone(),
                    value: value.clone(),
                    doc,
                }
            })
            .collect();
        if let Some(limit) = options.limit {
            rows.truncate(limit);
        }
        Ok(QueryResult {
            rows,
            total_rows,
            offset: offset as u64,
            update_seq: options.update_seq.then_some(inner.last_seq),
        })
    }
}

/// Factory handing out [`MemoryDatabase`] instances.
#[derive(Default)]
pub struct MemoryDatabaseFactory;

impl DatabaseFactory for MemoryDatabaseFactory {
    fn open(&self, name: &str) -> Result<Arc<dyn Database>> {
        Ok(Arc::new(MemoryDatabase::new(name)))
    }
}
