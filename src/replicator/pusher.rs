// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push direction: local changes out to the remote.
//!
//! Seeding reads everything after the checkpoint from the local store (all
//! leaf revisions, so conflicts propagate too); after that the change
//! subscription keeps the inbox fed. Each inbox batch:
//!
//! 1. `POST _revs_diff` — ask the remote which of these revisions it lacks.
//! 2. Load each missing revision's body (attachments inline) plus its
//!    `_revisions` history from the local store.
//! 3. `POST _bulk_docs` with `new_edits: false` so the remote grafts the
//!    revisions verbatim instead of minting new IDs.
//!
//! Revisions the remote already has count as processed without a transfer;
//! that is what makes a restarted replication cheap.

use super::InboxOutcome;
use crate::error::Result;
use crate::metrics;
use crate::remote::Peer;
use crate::revision::{parse_rev_id, Revision, RevisionList};
use crate::store::{ChangesOptions, Database, FilterFn};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backfill: leaf revisions committed after `since`, filtered.
pub(crate) fn seed(
    db: &dyn Database,
    since: u64,
    filter: Option<&FilterFn>,
    filter_params: Option<&Value>,
) -> Result<Vec<Revision>> {
    let mut options = ChangesOptions::default();
    options.set_conflict_mode(true);
    let params = filter_params.cloned().unwrap_or(Value::Null);
    let list = db.changes_since(since, &options, filter, &params)?;
    Ok(list.0)
}

/// Materialize one revision for `_bulk_docs`: full body, inline
/// attachments, `_revisions` history.
fn payload_for(db: &dyn Database, revision: &Revision) -> Result<Value> {
    let loaded = db.get_document(&revision.doc_id, Some(&revision.rev_id))?;
    let mut body = loaded.body_for_wire();
    let history = db.revision_history(&revision.doc_id, &revision.rev_id);
    if let Some(revisions) = revisions_object(&history) {
        body["_revisions"] = revisions;
    }
    Ok(body)
}

/// `["3-c","2-b","1-a"]` → `{"start": 3, "ids": ["c","b","a"]}`.
fn revisions_object(history: &[String]) -> Option<Value> {
    let (start, _) = parse_rev_id(history.first()?)?;
    let ids: Vec<&str> = history
        .iter()
        .filter_map(|rev_id| parse_rev_id(rev_id).map(|(_, suffix)| suffix))
        .collect();
    if ids.len() != history.len() {
        return None;
    }
    Some(json!({"start": start, "ids": ids}))
}

/// Transfer one batch. Never panics; every queued sequence ends up either
/// completed or failed so the ledger stays consistent.
pub(crate) async fn process_inbox(
    db: Arc<dyn Database>,
    peer: Arc<dyn Peer>,
    batch: Vec<Revision>,
) -> InboxOutcome {
    let mut outcome = InboxOutcome::default();
    let all_sequences: Vec<u64> = dedup_sequences(&batch);

    // 1. Which of these does the remote lack?
    let mut diff_request = Map::new();
    for (doc_id, group) in RevisionList::from(batch.clone()).grouped_by_doc_id() {
        let revs: Vec<&str> = group.iter().map(|r| r.rev_id.as_str()).collect();
        diff_request.insert(doc_id, json!(revs));
    }
    let diff = match peer.revs_diff(Value::Object(diff_request)).await {
        Ok(diff) => diff,
        Err(err) => {
            return whole_batch_failure(outcome, all_sequences, err, batch.len());
        }
    };

    let is_missing = |rev: &Revision| -> bool {
        diff.get(&rev.doc_id)
            .and_then(|entry| entry.get("missing"))
            .and_then(Value::as_array)
            .map(|missing| missing.iter().any(|m| m.as_str() == Some(&rev.rev_id)))
            .unwrap_or(false)
    };

    // 2. Build the bulk payload for the missing ones.
    let mut docs = Vec::new();
    let mut uploading: Vec<&Revision> = Vec::new();
    let mut per_seq: HashMap<u64, SeqState> = HashMap::new();
    for revision in &batch {
        let state = per_seq.entry(revision.sequence_or_zero()).or_default();
        state.total += 1;
        if !is_missing(revision) {
            // Remote already has it; nothing to send.
            state.done += 1;
            outcome.processed += 1;
            continue;
        }
        match payload_for(db.as_ref(), revision) {
            Ok(payload) => {
                docs.push(payload);
                uploading.push(revision);
            }
            Err(err) => {
                warn!(
                    doc_id = %revision.doc_id,
                    rev_id = %revision.rev_id,
                    error = %err,
                    "Could not load revision for push"
                );
                state.failed += 1;
                outcome.failed += 1;
            }
        }
    }

    // 3. Ship them.
    if !docs.is_empty() {
        debug!(count = docs.len(), "Pushing revisions via _bulk_docs");
        match peer.bulk_docs(docs).await {
            Ok(results) => {
                let failed_ids: HashSet<String> = results
                    .iter()
                    .filter(|row| row.get("error").is_some())
                    .filter_map(|row| row.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                let mut pushed = 0usize;
                for revision in uploading {
                    let state = per_seq.entry(revision.sequence_or_zero()).or_default();
                    if failed_ids.contains(&revision.doc_id) {
                        state.failed += 1;
                        outcome.failed += 1;
                    } else {
                        state.done += 1;
                        outcome.processed += 1;
                        pushed += 1;
                    }
                }
                metrics::record_revs_pushed(peer.url(), pushed);
            }
            Err(err) => {
                let uploading_count = uploading.len() as u64;
                for revision in uploading {
                    per_seq
                        .entry(revision.sequence_or_zero())
                        .or_default()
                        .failed += 1;
                }
                if err.is_cancelled() {
                    // Cancellation is not a failure; the sequences simply
                    // stay unacknowledged.
                } else {
                    outcome.failed += uploading_count;
                    outcome.error = Some(err);
                }
            }
        }
    }

    for (seq, state) in per_seq {
        if state.failed > 0 || state.done < state.total {
            outcome.failed_sequences.push(seq);
        } else {
            outcome.completed_sequences.push(seq);
        }
    }
    outcome
}

#[derive(Default)]
struct SeqState {
    total: u32,
    done: u32,
    failed: u32,
}

fn dedup_sequences(batch: &[Revision]) -> Vec<u64> {
    let mut seqs: Vec<u64> = batch.iter().map(Revision::sequence_or_zero).collect();
    seqs.sort_unstable();
    seqs.dedup();
    seqs
}

fn whole_batch_failure(
    mut outcome: InboxOutcome,
    sequences: Vec<u64>,
    err: crate::error::EngineError,
    batch_len: usize,
) -> InboxOutcome {
    outcome.failed_sequences = sequences;
    if !err.is_cancelled() {
        outcome.failed = batch_len as u64;
        outcome.error = Some(err);
    }
    outcome
}
