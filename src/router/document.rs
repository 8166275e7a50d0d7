// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document and attachment handlers.
//!
//! Attachments ride inside the document body under `_attachments`, stored
//! with inline base64 `data`. On the way out they are either inlined
//! (`attachments=true`), stubbed (`stub: true` with metadata only), or
//! streamed as multipart parts when the client sends `Accept:
//! multipart/*` (`follows: true` in the JSON root part, bytes in the
//! binary parts). `atts_since` elides attachments the client provably
//! already has: anything whose `revpos` is at or below the newest listed
//! ancestor's generation.
//!
//! `_local/...` documents bypass the revision tree and conflict handling
//! entirely and ignore `open_revs`.

use super::{RouterRequest, RouterResponse};
use crate::engine::random_uuid;
use crate::error::{EngineError, Result, Status};
use crate::remote::history_from_revisions;
use crate::revision::{parse_rev_id, Revision};
use crate::store::Database;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Reject reserved document IDs (outside `_design/` and `_local/`).
pub(super) fn validate_doc_id(doc_id: Option<&str>) -> Result<()> {
    match doc_id {
        Some(id)
            if id.starts_with('_')
                && !id.starts_with("_design/")
                && !id.starts_with("_local/") =>
        {
            Err(EngineError::with_reason(
                Status::BadId,
                format!("invalid document ID '{}'", id),
            ))
        }
        Some("") => Err(EngineError::with_reason(Status::BadId, "empty document ID")),
        _ => Ok(()),
    }
}

// =============================================================================
// Reading documents
// =============================================================================

/// Output shaping parsed from the query string.
struct ReadOptions {
    attachments: bool,
    atts_since: Vec<String>,
    conflicts: bool,
    revs: bool,
    local_seq: bool,
}

impl ReadOptions {
    fn parse(request: &RouterRequest) -> Result<ReadOptions> {
        let atts_since = match request.query_json("atts_since")? {
            Some(Value::Array(revs)) => revs
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(rev)) => vec![rev],
            Some(_) => {
                return Err(EngineError::with_reason(
                    Status::BadParam,
                    "atts_since must be an array of rev IDs",
                ))
            }
            None => Vec::new(),
        };
        Ok(ReadOptions {
            attachments: request.query_bool("attachments", false)?,
            atts_since,
            conflicts: request.query_bool("conflicts", false)?,
            revs: request.query_bool("revs", false)?,
            local_seq: request.query_bool("local_seq", false)?,
        })
    }
}

pub(super) fn get_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let mut options = ReadOptions::parse(request)?;

    if let Some(open_revs) = request.query_str("open_revs") {
        return open_revs_response(db, doc_id, open_revs, &options, request);
    }

    // Multipart responses carry the attachment bytes as their own parts,
    // so the data must be materialized before encoding.
    if request.accepts_multipart() {
        options.attachments = true;
    }

    let rev_id = request.query_str("rev");
    let revision = db.get_document(doc_id, rev_id)?;
    let etag = revision.rev_id.clone();
    let body = shape_document(db, &revision, &options)?;

    if request.accepts_multipart() && has_attachments(&body) {
        let boundary = random_uuid();
        let data = multipart_document(&body, &boundary)?;
        return Ok(RouterResponse {
            status: Status::Ok,
            headers: Vec::new(),
            body: super::ResponseBody::Binary {
                data,
                content_type: format!("multipart/related; boundary=\"{}\"", boundary),
            },
        }
        .conditional(request, &etag));
    }

    Ok(RouterResponse::json(Status::Ok, body).conditional(request, &etag))
}

/// `open_revs=all` returns every leaf; an explicit list returns one entry
/// per requested revision, `{ok: doc}` or `{missing: revID}`.
fn open_revs_response(
    db: &Arc<dyn Database>,
    doc_id: &str,
    open_revs: &str,
    options: &ReadOptions,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let mut entries: Vec<Value> = Vec::new();
    if open_revs == "all" {
        let leaves = db.get_all_revisions(doc_id, true);
        if leaves.is_empty() {
            return Err(EngineError::new(Status::NotFound));
        }
        for revision in leaves.iter() {
            entries.push(json!({"ok": shape_document(db, revision, options)?}));
        }
    } else {
        let revs: Vec<String> = match request.query_json("open_revs")? {
            Some(Value::Array(revs)) => revs
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => {
                return Err(EngineError::with_reason(
                    Status::BadParam,
                    "open_revs must be \"all\" or an array of rev IDs",
                ))
            }
        };
        for rev_id in revs {
            match db.get_document(doc_id, Some(&rev_id)) {
                Ok(revision) => {
                    entries.push(json!({"ok": shape_document(db, &revision, options)?}))
                }
                Err(_) => entries.push(json!({"missing": rev_id})),
            }
        }
    }
    Ok(RouterResponse::json(Status::Ok, json!(entries)))
}

/// Materialize a revision for the wire: identity, histories, conflicts,
/// attachment shaping.
fn shape_document(
    db: &Arc<dyn Database>,
    revision: &Revision,
    options: &ReadOptions,
) -> Result<Value> {
    let mut body = revision.body_for_wire();

    if options.revs {
        let history = db.revision_history(&revision.doc_id, &revision.rev_id);
        if let Some(revisions) = revisions_object(&history) {
            body["_revisions"] = revisions;
        }
    }
    if options.conflicts {
        let conflicts = db.conflicting_rev_ids(&revision.doc_id);
        if !conflicts.is_empty() {
            body["_conflicts"] = json!(conflicts);
        }
    }
    if options.local_seq {
        if let Some(sequence) = revision.sequence {
            body["_local_seq"] = json!(sequence);
        }
    }

    let since_generation = newest_common_ancestor_generation(db, revision, &options.atts_since);
    shape_attachments(&mut body, options.attachments, since_generation);
    Ok(body)
}

fn revisions_object(history: &[String]) -> Option<Value> {
    let (start, _) = parse_rev_id(history.first()?)?;
    let ids: Vec<&str> = history
        .iter()
        .filter_map(|rev_id| parse_rev_id(rev_id).map(|(_, suffix)| suffix))
        .collect();
    Some(json!({"start": start, "ids": ids}))
}

/// The generation of the newest `atts_since` revision that is actually an
/// ancestor of this revision. Attachments at or below it become stubs.
fn newest_common_ancestor_generation(
    db: &Arc<dyn Database>,
    revision: &Revision,
    atts_since: &[String],
) -> Option<u64> {
    if atts_since.is_empty() {
        return None;
    }
    let history = db.revision_history(&revision.doc_id, &revision.rev_id);
    atts_since
        .iter()
        .filter(|candidate| history.iter().any(|ancestor| ancestor == *candidate))
        .filter_map(|candidate| parse_rev_id(candidate).map(|(generation, _)| generation))
        .max()
}

fn has_attachments(body: &Value) -> bool {
    body.get("_attachments")
        .and_then(Value::as_object)
        .map(|atts| !atts.is_empty())
        .unwrap_or(false)
}

/// Inline, stub, or elide each attachment.
fn shape_attachments(body: &mut Value, inline: bool, since_generation: Option<u64>) {
    let Some(atts) = body
        .get_mut("_attachments")
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    for (_, att) in atts.iter_mut() {
        let Some(att) = att.as_object_mut() else { continue };
        let revpos = att.get("revpos").and_then(Value::as_u64).unwrap_or(0);
        let known_to_client = since_generation.map(|g| revpos <= g).unwrap_or(false);
        if inline && !known_to_client {
            att.remove("stub");
            att.remove("follows");
        } else {
            att.remove("data");
            att.remove("follows");
            att.insert("stub".into(), json!(true));
        }
    }
}

// =============================================================================
// Multipart
// =============================================================================

/// Encode a document as `multipart/related`: a JSON root part with
/// `follows: true` markers, then one binary part per attachment.
fn multipart_document(body: &Value, boundary: &str) -> Result<Bytes> {
    let mut root = body.clone();
    let mut parts: Vec<(String, String, Vec<u8>)> = Vec::new();

    if let Some(atts) = root
        .get_mut("_attachments")
        .and_then(Value::as_object_mut)
    {
        for (name, att) in atts.iter_mut() {
            let Some(att) = att.as_object_mut() else { continue };
            if att.get("stub").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let Some(data) = att.get("data").and_then(Value::as_str) else {
                continue;
            };
            let bytes = BASE64.decode(data).map_err(|_| {
                EngineError::with_reason(Status::BadAttachment, "corrupt attachment data")
            })?;
            let content_type = att
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string();
            att.remove("data");
            att.insert("follows".into(), json!(true));
            parts.push((name.clone(), content_type, bytes));
        }
    }

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    out.extend_from_slice(b"Content-Type: application/json\r\n\r\n");
    out.extend_from_slice(root.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, content_type, bytes) in parts {
        out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        out.extend_from_slice(
            format!("Content-Disposition: attachment; filename=\"{}\"\r\n\r\n", name).as_bytes(),
        );
        out.extend_from_slice(&bytes);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    Ok(Bytes::from(out))
}

/// Decode a `multipart/related` PUT body back into a document with inline
/// attachment data. Binary parts are matched to `follows: true`
/// attachments in declaration order.
fn parse_multipart_document(body: &[u8], content_type: &str) -> Result<Value> {
    let boundary = content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .next()
        .ok_or_else(|| {
            EngineError::with_reason(Status::UnsupportedType, "multipart boundary missing")
        })?;

    let delimiter = format!("--{}", boundary);
    let text_sections: Vec<&[u8]> = split_parts(body, delimiter.as_bytes());
    if text_sections.is_empty() {
        return Err(EngineError::with_reason(Status::BadJson, "empty multipart body"));
    }

    let mut doc: Option<Value> = None;
    let mut binary_parts: Vec<Vec<u8>> = Vec::new();
    for section in text_sections {
        let Some(split_at) = find_header_end(section) else { continue };
        let payload = &section[split_at..];
        let payload = trim_crlf(payload);
        if doc.is_none() {
            doc = Some(serde_json::from_slice(payload).map_err(|e| {
                EngineError::with_reason(Status::BadJson, e.to_string())
            })?);
        } else {
            binary_parts.push(payload.to_vec());
        }
    }

    let mut doc = doc.ok_or_else(|| {
        EngineError::with_reason(Status::BadJson, "multipart body has no JSON part")
    })?;

    let mut part_iter = binary_parts.into_iter();
    if let Some(atts) = doc.get_mut("_attachments").and_then(Value::as_object_mut) {
        for (_, att) in atts.iter_mut() {
            let Some(att) = att.as_object_mut() else { continue };
            if !att.get("follows").and_then(Value::as_bool).unwrap_or(false) {
                continue;
            }
            let bytes = part_iter.next().ok_or_else(|| {
                EngineError::with_reason(Status::BadAttachment, "missing attachment part")
            })?;
            att.remove("follows");
            att.insert("length".into(), json!(bytes.len()));
            att.insert("digest".into(), json!(attachment_digest(&bytes)));
            att.insert("data".into(), json!(BASE64.encode(&bytes)));
        }
    }
    Ok(doc)
}

fn split_parts<'a>(body: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut cursor = 0;
    let positions: Vec<usize> = (0..body.len().saturating_sub(delimiter.len()))
        .filter(|&i| &body[i..i + delimiter.len()] == delimiter)
        .collect();
    for (index, &position) in positions.iter().enumerate() {
        if index > 0 {
            sections.push(&body[cursor..position]);
        }
        cursor = position + delimiter.len();
    }
    sections
}

fn find_header_end(section: &[u8]) -> Option<usize> {
    section
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| section.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

fn trim_crlf(payload: &[u8]) -> &[u8] {
    let mut end = payload.len();
    while end > 0 && (payload[end - 1] == b'\n' || payload[end - 1] == b'\r') {
        end -= 1;
    }
    &payload[..end]
}

pub(super) fn attachment_digest(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    format!("sha1-{}", BASE64.encode(hasher.finalize()))
}

// =============================================================================
// Writing documents
// =============================================================================

fn request_body_document(request: &RouterRequest) -> Result<Value> {
    match request.content_type() {
        Some(content_type) if content_type.starts_with("multipart/") => {
            parse_multipart_document(&request.body, content_type)
        }
        _ => {
            let body = request.body_json()?;
            match body {
                Value::Null => Ok(json!({})),
                Value::Object(_) => Ok(body),
                _ => Err(EngineError::with_reason(
                    Status::BadJson,
                    "document body must be a JSON object",
                )),
            }
        }
    }
}

/// Resolve `stub: true` attachment references against the revision being
/// replaced, and fill metadata for freshly inlined data.
fn resolve_attachments(
    db: &Arc<dyn Database>,
    doc_id: &str,
    prev_rev_id: Option<&str>,
    body: &mut Value,
    generation: u64,
) -> Result<()> {
    let Some(atts) = body.get_mut("_attachments").and_then(Value::as_object_mut) else {
        return Ok(());
    };
    let parent_atts: Map<String, Value> = prev_rev_id
        .and_then(|rev| db.get_document(doc_id, Some(rev)).ok())
        .and_then(|rev| {
            rev.body
                .as_ref()
                .and_then(|b| b.get("_attachments"))
                .and_then(Value::as_object)
                .cloned()
        })
        .unwrap_or_default();

    for (name, att) in atts.iter_mut() {
        let Some(att_map) = att.as_object_mut() else {
            return Err(EngineError::new(Status::BadAttachment));
        };
        if att_map.get("stub").and_then(Value::as_bool).unwrap_or(false) {
            let parent = parent_atts.get(name).ok_or_else(|| {
                EngineError::with_reason(
                    Status::BadAttachment,
                    format!("stub references unknown attachment '{}'", name),
                )
            })?;
            *att = parent.clone();
        } else if let Some(data) = att_map.get("data").and_then(Value::as_str) {
            let bytes = BASE64.decode(data).map_err(|_| {
                EngineError::with_reason(
                    Status::BadAttachment,
                    format!("attachment '{}' is not valid base64", name),
                )
            })?;
            att_map.insert("length".into(), json!(bytes.len()));
            att_map.insert("digest".into(), json!(attachment_digest(&bytes)));
            att_map.entry("revpos".to_string()).or_insert(json!(generation));
        } else {
            return Err(EngineError::with_reason(
                Status::BadAttachment,
                format!("attachment '{}' has neither stub nor data", name),
            ));
        }
    }
    Ok(())
}

fn update_response(revision: &Revision, db_name: &str) -> RouterResponse {
    let status = if revision.deleted {
        Status::Ok
    } else {
        Status::Created
    };
    RouterResponse::json(
        status,
        json!({
            "ok": true,
            "id": revision.doc_id,
            "rev": revision.rev_id,
        }),
    )
    .with_header(
        "location",
        format!("/{}/{}", db_name, crate::remote::urlencode_doc_id(&revision.doc_id)),
    )
    .with_header("etag", format!("\"{}\"", revision.rev_id))
}

/// `POST /db`: create with a server-assigned ID unless the body names one.
pub(super) fn post_doc(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<RouterResponse> {
    let mut body = request_body_document(request)?;
    let doc_id = body
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(random_uuid);
    validate_doc_id(Some(&doc_id))?;
    resolve_attachments(db, &doc_id, None, &mut body, 1)?;
    let revision = db.put(Some(&doc_id), body, None, false)?;
    Ok(update_response(&revision, db.name()))
}

pub(super) fn put_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    validate_doc_id(Some(doc_id))?;
    let mut body = request_body_document(request)?;
    if let Some(body_id) = body.get("_id").and_then(Value::as_str) {
        if body_id != doc_id {
            return Err(EngineError::with_reason(
                Status::BadId,
                "body _id does not match URL",
            ));
        }
    }

    if !request.query_bool("new_edits", true)? {
        // Replication path: graft the revision verbatim.
        let rev_id = body
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::with_reason(Status::BadId, "_rev required when new_edits=false")
            })?;
        let deleted = body
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let history = history_from_revisions(&body, &rev_id);
        let revision = Revision {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.clone(),
            deleted,
            sequence: None,
            body: Some(body),
        };
        db.force_insert(&revision, &history, None)?;
        return Ok(update_response(&revision, db.name()));
    }

    // If-Match is an accepted fallback source of the previous revision.
    let prev_rev = request
        .query_str("rev")
        .map(str::to_string)
        .or_else(|| body.get("_rev").and_then(Value::as_str).map(str::to_string))
        .or_else(|| request.if_match());

    let deleting = body
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let generation = prev_rev
        .as_deref()
        .and_then(parse_rev_id)
        .map(|(generation, _)| generation + 1)
        .unwrap_or(1);
    resolve_attachments(db, doc_id, prev_rev.as_deref(), &mut body, generation)?;
    let revision = db.put(Some(doc_id), body, prev_rev.as_deref(), deleting)?;
    Ok(update_response(&revision, db.name()))
}

pub(super) fn delete_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let prev_rev = request
        .query_str("rev")
        .map(str::to_string)
        .or_else(|| request.if_match())
        .ok_or_else(|| EngineError::new(Status::Conflict))?;
    let revision = db.put(Some(doc_id), json!({}), Some(&prev_rev), true)?;
    Ok(update_response(&revision, db.name()))
}

// =============================================================================
// Attachments
// =============================================================================

pub(super) fn get_attachment(
    db: &Arc<dyn Database>,
    doc_id: &str,
    name: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let revision = db.get_document(doc_id, request.query_str("rev"))?;
    let att = revision
        .body
        .as_ref()
        .and_then(|b| b.get("_attachments"))
        .and_then(|atts| atts.get(name))
        .and_then(Value::as_object)
        .ok_or_else(|| EngineError::new(Status::NotFound))?;

    let data = att
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::new(Status::NotFound))?;
    let bytes = BASE64
        .decode(data)
        .map_err(|_| EngineError::new(Status::BadAttachment))?;
    let content_type = att
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();
    let etag = att
        .get("digest")
        .and_then(Value::as_str)
        .unwrap_or(&revision.rev_id)
        .to_string();

    Ok(RouterResponse {
        status: Status::Ok,
        headers: Vec::new(),
        body: super::ResponseBody::Binary {
            data: Bytes::from(bytes),
            content_type,
        },
    }
    .conditional(request, &etag))
}

/// PUT a raw attachment body; creates a new document revision referencing
/// it. Content-Type comes straight off the request.
pub(super) fn put_attachment(
    db: &Arc<dyn Database>,
    doc_id: &str,
    name: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    update_attachment(db, doc_id, name, request, Some(&request.body))
}

pub(super) fn delete_attachment(
    db: &Arc<dyn Database>,
    doc_id: &str,
    name: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    update_attachment(db, doc_id, name, request, None)
}

fn update_attachment(
    db: &Arc<dyn Database>,
    doc_id: &str,
    name: &str,
    request: &RouterRequest,
    data: Option<&Bytes>,
) -> Result<RouterResponse> {
    validate_doc_id(Some(doc_id))?;
    let prev_rev = request
        .query_str("rev")
        .map(str::to_string)
        .or_else(|| request.if_match());

    let mut body = match prev_rev.as_deref() {
        Some(rev) => db
            .get_document(doc_id, Some(rev))?
            .body
            .unwrap_or_else(|| json!({})),
        None => {
            // Only valid when the document does not exist yet.
            if db.get_document(doc_id, None).is_ok() {
                return Err(EngineError::new(Status::Conflict));
            }
            json!({})
        }
    };

    let atts = body
        .as_object_mut()
        .ok_or_else(|| EngineError::new(Status::BadAttachment))?
        .entry("_attachments".to_string())
        .or_insert_with(|| json!({}));
    let atts = atts
        .as_object_mut()
        .ok_or_else(|| EngineError::new(Status::BadAttachment))?;

    let generation = prev_rev
        .as_deref()
        .and_then(parse_rev_id)
        .map(|(generation, _)| generation + 1)
        .unwrap_or(1);

    match data {
        Some(bytes) => {
            let content_type = request
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string();
            atts.insert(
                name.to_string(),
                json!({
                    "content_type": content_type,
                    "data": BASE64.encode(bytes),
                    "digest": attachment_digest(bytes),
                    "length": bytes.len(),
                    "revpos": generation,
                }),
            );
        }
        None => {
            if atts.remove(name).is_none() {
                return Err(EngineError::new(Status::NotFound));
            }
        }
    }

    let revision = db.put(Some(doc_id), body, prev_rev.as_deref(), false)?;
    Ok(update_response(&revision, db.name()))
}

// =============================================================================
// Local documents
// =============================================================================

pub(super) fn get_local_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let (rev, mut body) = db
        .get_local_document(doc_id)
        .ok_or_else(|| EngineError::new(Status::NotFound))?;
    if let Some(map) = body.as_object_mut() {
        map.insert("_id".into(), json!(format!("_local/{}", doc_id)));
        map.insert("_rev".into(), json!(rev));
    }
    Ok(RouterResponse::json(Status::Ok, body).conditional(request, &rev))
}

pub(super) fn put_local_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let body = request.body_json()?;
    if !body.is_object() {
        return Err(EngineError::with_reason(
            Status::BadJson,
            "document body must be a JSON object",
        ));
    }
    let prev_rev = request
        .query_str("rev")
        .map(str::to_string)
        .or_else(|| body.get("_rev").and_then(Value::as_str).map(str::to_string))
        .or_else(|| request.if_match());
    let rev = db
        .put_local_document(doc_id, Some(body), prev_rev.as_deref())?
        .unwrap_or_default();
    Ok(RouterResponse::json(
        Status::Created,
        json!({"ok": true, "id": format!("_local/{}", doc_id), "rev": rev}),
    )
    .with_header("etag", format!("\"{}\"", rev)))
}

pub(super) fn delete_local_doc(
    db: &Arc<dyn Database>,
    doc_id: &str,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let prev_rev = request
        .query_str("rev")
        .map(str::to_string)
        .or_else(|| request.if_match())
        .ok_or_else(|| EngineError::new(Status::Conflict))?;
    db.put_local_document(doc_id, None, Some(&prev_rev))?;
    Ok(RouterResponse::json(Status::Ok, json!({"ok": true})))
}
