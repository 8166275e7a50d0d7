// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `GET /db/_changes` in its three feed modes.
//!
//! - `normal`: one batch, `{results, last_seq}`.
//! - `longpoll`: returns immediately when the batch is non-empty,
//!   otherwise parks on the change broker and answers with the first
//!   non-empty batch.
//! - `continuous`: NDJSON, one change per line, open until the client
//!   disconnects (dropping the stream drops the broker subscription).
//!
//! Row shape: `{seq, id, changes: [{rev}], deleted?, doc?}`.
//!
//! In plain mode each document appears at most once: a change that did not
//! move the winning revision is suppressed, and one that did reports the
//! winner under the triggering change's sequence. In conflict mode
//! (`style=all_docs`) a document's row accumulates every leaf revision
//! seen in the window; rows are then ordered by sequence and truncated to
//! `limit`.

use super::{RouterRequest, RouterResponse};
use crate::error::{EngineError, Result, Status};
use crate::metrics;
use crate::revision::{compare_rev_ids, Revision};
use crate::store::{ChangesOptions, Database, FilterFn};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Query parameters the feed itself consumes; everything else is handed
/// to the filter as a parameter.
const RESERVED_PARAMS: &[&str] = &[
    "feed",
    "since",
    "limit",
    "style",
    "include_docs",
    "conflicts",
    "filter",
    "heartbeat",
    "timeout",
    "descending",
    "att_encoding_info",
];

struct FeedOptions {
    since: u64,
    limit: Option<usize>,
    conflict_mode: bool,
    include_docs: bool,
    filter: Option<FilterFn>,
    filter_params: Value,
}

impl FeedOptions {
    fn parse(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<FeedOptions> {
        let filter = match request.query_str("filter") {
            Some(name) => Some(db.compile_filter(name)?),
            None => None,
        };
        // Filter params come off the query string, parsed as JSON where
        // they look like it.
        let mut params = Map::new();
        for (name, value) in &request.query {
            if RESERVED_PARAMS.contains(&name.as_str()) {
                continue;
            }
            let parsed = serde_json::from_str(value)
                .unwrap_or_else(|_| Value::String(value.clone()));
            params.insert(name.clone(), parsed);
        }
        Ok(FeedOptions {
            since: request.query_u64("since")?.unwrap_or(0),
            limit: request.query_u64("limit")?.map(|l| l as usize),
            conflict_mode: request.query_str("style") == Some("all_docs"),
            include_docs: request.query_bool("include_docs", false)?,
            filter,
            filter_params: Value::Object(params),
        })
    }
}

pub(super) async fn changes(
    db: &Arc<dyn Database>,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let options = FeedOptions::parse(db, request)?;
    match request.query_str("feed").unwrap_or("normal") {
        "normal" => normal(db, &options),
        "longpoll" => longpoll(db, options).await,
        "continuous" => continuous(db, options),
        other => Err(EngineError::with_reason(
            Status::BadParam,
            format!("unknown feed mode '{}'", other),
        )),
    }
}

fn normal(db: &Arc<dyn Database>, options: &FeedOptions) -> Result<RouterResponse> {
    let (rows, last_seq) = compute_batch(db, options)?;
    metrics::record_changes_rows("normal", rows.len());
    Ok(RouterResponse::json(
        Status::Ok,
        json!({"results": rows, "last_seq": last_seq}),
    ))
}

async fn longpoll(db: &Arc<dyn Database>, options: FeedOptions) -> Result<RouterResponse> {
    // Subscribe first: a commit landing between the batch computation and
    // the park would otherwise be missed.
    let mut receiver = db.changes_broker().subscribe();
    loop {
        let (rows, last_seq) = compute_batch(db, &options)?;
        if !rows.is_empty() {
            metrics::record_changes_rows("longpoll", rows.len());
            return Ok(RouterResponse::json(
                Status::Ok,
                json!({"results": rows, "last_seq": last_seq}),
            ));
        }
        match receiver.recv().await {
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "longpoll subscription lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                // Database went away; report what we have (an empty batch).
                return Ok(RouterResponse::json(
                    Status::Ok,
                    json!({"results": [], "last_seq": options.since}),
                ));
            }
        }
    }
}

fn continuous(db: &Arc<dyn Database>, options: FeedOptions) -> Result<RouterResponse> {
    // Subscribe before the backfill; overlap is trimmed by sequence.
    let receiver = db.changes_broker().subscribe();
    let (rows, mut seen_seq) = compute_batch(db, &options)?;
    metrics::record_changes_rows("continuous", rows.len());
    seen_seq = seen_seq.max(options.since);

    let initial: Vec<Bytes> = rows.iter().map(ndjson_line).collect();
    let db = Arc::clone(db);
    let live = futures::stream::unfold(
        (receiver, db, options, seen_seq),
        |(mut receiver, db, options, mut seen_seq)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let seq = event.revision.sequence_or_zero();
                        if seq <= seen_seq {
                            continue;
                        }
                        seen_seq = seq;
                        if let Some(row) = row_for_event(&db, &event.revision, &options) {
                            return Some((ndjson_line(&row), (receiver, db, options, seen_seq)));
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "continuous feed lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        },
    );
    let stream = futures::stream::iter(initial).chain(live).boxed();
    Ok(RouterResponse::stream(stream, "application/json"))
}

fn ndjson_line(value: &Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

/// The current winning revision, tombstone or not.
fn winning_revision(db: &Arc<dyn Database>, doc_id: &str) -> Option<Revision> {
    let leaves = db.get_all_revisions(doc_id, true);
    let live: Vec<&Revision> = leaves.iter().filter(|r| !r.deleted).collect();
    let pool: Vec<&Revision> = if live.is_empty() {
        leaves.iter().collect()
    } else {
        live
    };
    pool.into_iter()
        .max_by(|a, b| compare_rev_ids(&a.rev_id, &b.rev_id))
        .cloned()
}

/// One batch of change rows after `since`.
fn compute_batch(db: &Arc<dyn Database>, options: &FeedOptions) -> Result<(Vec<Value>, u64)> {
    let mut store_options = ChangesOptions::default();
    store_options.set_conflict_mode(options.conflict_mode);
    let list = db.changes_since(
        options.since,
        &store_options,
        options.filter.as_ref(),
        &options.filter_params,
    )?;

    // One row per document. Plain mode: the winner, keyed to the highest
    // triggering sequence. Conflict mode: every leaf accumulates into
    // `changes`.
    let mut order: Vec<String> = Vec::new();
    let mut rows: HashMap<String, RowState> = HashMap::new();
    for revision in list.iter() {
        let state = rows.entry(revision.doc_id.clone()).or_insert_with(|| {
            order.push(revision.doc_id.clone());
            RowState::default()
        });
        state.seq = state.seq.max(revision.sequence_or_zero());
        if options.conflict_mode {
            state.revs.push(revision.rev_id.clone());
        }
    }

    let mut out: Vec<(u64, Value)> = Vec::new();
    for doc_id in order {
        let state = &rows[&doc_id];
        let Some(winner) = winning_revision(db, &doc_id) else {
            continue;
        };
        let revs: Vec<&str> = if options.conflict_mode {
            state.revs.iter().map(String::as_str).collect()
        } else {
            vec![winner.rev_id.as_str()]
        };
        let changes: Vec<Value> = revs.iter().map(|rev| json!({"rev": rev})).collect();
        let mut row = json!({
            "seq": state.seq,
            "id": doc_id,
            "changes": changes,
        });
        if winner.deleted {
            row["deleted"] = json!(true);
        }
        if options.include_docs && !winner.deleted {
            row["doc"] = winner.body_for_wire();
        }
        out.push((state.seq, row));
    }

    // Merge happened per-doc above; now order by sequence and truncate.
    out.sort_by_key(|(seq, _)| *seq);
    if let Some(limit) = options.limit {
        out.truncate(limit);
    }
    let last_seq = out.last().map(|(seq, _)| *seq).unwrap_or(options.since);
    Ok((out.into_iter().map(|(_, row)| row).collect(), last_seq))
}

#[derive(Default)]
struct RowState {
    seq: u64,
    revs: Vec<String>,
}

/// A live row for one broadcast event (continuous mode).
fn row_for_event(
    db: &Arc<dyn Database>,
    revision: &Revision,
    options: &FeedOptions,
) -> Option<Value> {
    if let Some(filter) = &options.filter {
        let loaded = db
            .get_document(&revision.doc_id, Some(&revision.rev_id))
            .unwrap_or_else(|_| revision.clone());
        if !filter(&loaded, &options.filter_params) {
            return None;
        }
    }
    let winner = winning_revision(db, &revision.doc_id)?;
    let changes: Vec<Value> = if options.conflict_mode {
        db.get_all_revisions(&revision.doc_id, true)
            .iter()
            .map(|leaf| json!({"rev": leaf.rev_id}))
            .collect()
    } else {
        vec![json!({"rev": winner.rev_id})]
    };
    let mut row = json!({
        "seq": revision.sequence_or_zero(),
        "id": revision.doc_id,
        "changes": changes,
    });
    if winner.deleted {
        row["deleted"] = json!(true);
    }
    if options.include_docs && !winner.deleted {
        row["doc"] = winner.body_for_wire();
    }
    Some(row)
}
