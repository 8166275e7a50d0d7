// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database-level handlers: info, create/delete, `_all_docs`,
//! `_bulk_docs`, `_revs_diff`, `_compact`, `_ensure_full_commit`,
//! `_purge`.

use super::{document, parse_query_options, RouterRequest, RouterResponse};
use crate::engine::Engine;
use crate::error::{EngineError, Result, Status};
use crate::remote::history_from_revisions;
use crate::revision::{compare_rev_ids, Revision, RevisionList};
use crate::store::Database;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub(super) fn db_info(db: &Arc<dyn Database>, _request: &RouterRequest) -> Result<RouterResponse> {
    Ok(RouterResponse::json(
        Status::Ok,
        json!({
            "db_name": db.name(),
            "db_uuid": db.public_uuid(),
            "doc_count": db.doc_count(),
            "update_seq": db.last_sequence_number(),
            "disk_size": db.disk_size(),
        }),
    ))
}

pub(super) fn create_db(engine: &Arc<Engine>, name: &str) -> Result<RouterResponse> {
    engine.create_database(name)?;
    Ok(RouterResponse::json(Status::Created, json!({"ok": true}))
        .with_header("location", format!("/{}", name)))
}

pub(super) fn delete_db(
    engine: &Arc<Engine>,
    name: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    // A ?rev= here means the client thought it was deleting a document.
    if request.query_str("rev").is_some() {
        return Err(EngineError::with_reason(
            Status::BadRequest,
            "you can't delete a database with a rev parameter",
        ));
    }
    engine.delete_database(name)?;
    Ok(RouterResponse::json(Status::Ok, json!({"ok": true})))
}

pub(super) fn all_docs(
    db: &Arc<dyn Database>,
    request: &RouterRequest,
    posted: Option<Value>,
) -> Result<RouterResponse> {
    let options = parse_query_options(request, posted.as_ref())?;
    let etag = db.last_sequence_number().to_string();
    let result = db.all_docs(&options)?;

    let mut body = json!({
        "rows": result.rows,
        "total_rows": result.total_rows,
        "offset": result.offset,
    });
    if let Some(update_seq) = result.update_seq {
        body["update_seq"] = json!(update_seq);
    }
    Ok(RouterResponse::json(Status::Ok, body).conditional(request, &etag))
}

/// `POST /db/_bulk_docs`.
///
/// The whole batch runs in one store transaction. Policy:
/// - any server-side (5xx) failure aborts the transaction;
/// - `all_or_nothing` aborts on any per-document failure;
/// - otherwise per-document failures become `{id, error, reason}` rows.
pub(super) fn bulk_docs(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<RouterResponse> {
    let body = request.body_json()?;
    let docs = body
        .get("docs")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::with_reason(Status::BadJson, "docs array required"))?
        .clone();
    let all_or_nothing = body
        .get("all_or_nothing")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let new_edits = body
        .get("new_edits")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut results: Vec<Value> = Vec::new();
    db.begin_transaction();
    for doc in &docs {
        let doc_id = doc.get("_id").and_then(Value::as_str).map(str::to_string);
        let outcome = bulk_one(db, doc, new_edits);
        match outcome {
            Ok(Some(revision)) => {
                if new_edits {
                    results.push(json!({
                        "ok": true,
                        "id": revision.doc_id,
                        "rev": revision.rev_id,
                    }));
                }
            }
            Ok(None) => {}
            Err(err) => {
                let aborts = err.status.http_code() >= 500 || all_or_nothing;
                if aborts {
                    db.end_transaction(false);
                    return Err(err);
                }
                warn!(
                    db = %db.name(),
                    doc_id = ?doc_id,
                    error = %err,
                    "bulk_docs entry failed"
                );
                results.push(json!({
                    "id": doc_id.unwrap_or_default(),
                    "error": err.status.error_string(),
                    "reason": err.reason(),
                }));
            }
        }
    }
    db.end_transaction(true);
    Ok(RouterResponse::json(Status::Created, json!(results)))
}

/// One `_bulk_docs` entry. `Ok(Some)` is a reportable success (new edit),
/// `Ok(None)` a silent one (`new_edits == false`).
fn bulk_one(
    db: &Arc<dyn Database>,
    doc: &Value,
    new_edits: bool,
) -> Result<Option<Revision>> {
    if !doc.is_object() {
        return Err(EngineError::with_reason(Status::BadJson, "doc must be an object"));
    }
    if new_edits {
        let doc_id = doc.get("_id").and_then(Value::as_str);
        let prev_rev = doc.get("_rev").and_then(Value::as_str);
        let deleting = doc
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        document::validate_doc_id(doc_id)?;
        let revision = db.put(doc_id, doc.clone(), prev_rev, deleting)?;
        Ok(Some(revision))
    } else {
        let doc_id = doc
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::with_reason(Status::BadId, "_id required"))?;
        let rev_id = doc
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::with_reason(Status::BadId, "_rev required"))?;
        let deleted = doc
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let history = history_from_revisions(doc, rev_id);
        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            deleted,
            sequence: None,
            body: Some(doc.clone()),
        };
        db.force_insert(&revision, &history, None)?;
        Ok(None)
    }
}

/// Shared by the handler and the in-process peer: which of the proposed
/// revisions are missing here, and what ancestors could shrink the upload.
pub(crate) fn compute_revs_diff(db: &dyn Database, input: &Map<String, Value>) -> Value {
    let mut probe = RevisionList::new();
    for (doc_id, rev_ids) in input {
        if let Some(rev_ids) = rev_ids.as_array() {
            for rev_id in rev_ids.iter().filter_map(Value::as_str) {
                probe.push(Revision::new(doc_id.clone(), rev_id));
            }
        }
    }
    db.find_missing_revisions(&mut probe);

    let mut out = Map::new();
    for (doc_id, group) in probe.grouped_by_doc_id() {
        let mut missing: Vec<String> = group.iter().map(|r| r.rev_id.clone()).collect();
        missing.sort_by(|a, b| compare_rev_ids(a, b));
        let mut entry = json!({"missing": missing});
        // Ancestors are computed against the highest-generation missing
        // revision only.
        if let Some(top) = group
            .iter()
            .max_by(|a, b| compare_rev_ids(&a.rev_id, &b.rev_id))
        {
            let ancestors = db.possible_ancestors(top, 0);
            if !ancestors.is_empty() {
                entry["possible_ancestors"] = json!(ancestors);
            }
        }
        out.insert(doc_id, entry);
    }
    Value::Object(out)
}

pub(super) fn revs_diff(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<RouterResponse> {
    let body = request.body_json()?;
    let Value::Object(input) = body else {
        return Err(EngineError::with_reason(
            Status::BadJson,
            "expected {docID: [revIDs]}",
        ));
    };
    Ok(RouterResponse::json(
        Status::Ok,
        compute_revs_diff(db.as_ref(), &input),
    ))
}

pub(super) fn compact(db: &Arc<dyn Database>) -> Result<RouterResponse> {
    db.compact()?;
    Ok(RouterResponse::json(Status::Accepted, json!({"ok": true})))
}

pub(super) fn ensure_full_commit(
    engine: &Arc<Engine>,
    _db: &Arc<dyn Database>,
) -> Result<RouterResponse> {
    Ok(RouterResponse::json(
        Status::Created,
        json!({
            "ok": true,
            "instance_start_time": engine.instance_start_time(),
        }),
    ))
}

pub(super) fn purge(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<RouterResponse> {
    let body = request.body_json()?;
    let Value::Object(input) = body else {
        return Err(EngineError::with_reason(
            Status::BadJson,
            "expected {docID: [revIDs]}",
        ));
    };
    let mut spec: HashMap<String, Vec<String>> = HashMap::new();
    for (doc_id, rev_ids) in input {
        let rev_ids = rev_ids
            .as_array()
            .ok_or_else(|| EngineError::with_reason(Status::BadJson, "revIDs must be an array"))?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        spec.insert(doc_id, rev_ids);
    }
    let purged = db.purge(&spec)?;
    Ok(RouterResponse::json(Status::Ok, json!({"purged": purged})))
}
