// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote peer transport.
//!
//! The replicator talks to the other side of a replication through the
//! [`Peer`] trait: checkpoint negotiation, `_revs_diff`, `_bulk_docs`,
//! `_changes` feeds, and per-document fetches. Two implementations:
//!
//! - [`HttpPeer`]: a CouchDB-compatible HTTP endpoint via `reqwest`. Every
//!   discrete request is registered in a [`RequestPool`] so `stop()` can
//!   cancel the lot without waiting for timeouts.
//! - [`LocalPeer`]: another database in this process. Used for
//!   local-to-local replication; it skips reachability entirely.
//!
//! # Request Pool
//!
//! `stop_all()` snapshots and clears the registry before aborting each
//! member, so completion callbacks that deregister themselves cannot
//! re-enter the iteration. Aborted requests surface as `Cancelled`, which
//! the replicator swallows.

use crate::auth::Authorizer;
use crate::changes::ChangeEvent;
use crate::error::{EngineError, Result, Status};
use crate::revision::{Revision, RevisionList};
use crate::store::{ChangesOptions, Database, FilterFn};
use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};
use url::Url;

/// Which `_changes` feed mode to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    Normal,
    Longpoll,
    Continuous,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Normal => "normal",
            Feed::Longpoll => "longpoll",
            Feed::Continuous => "continuous",
        }
    }
}

/// Parameters for a `_changes` request against a peer.
#[derive(Debug, Clone)]
pub struct ChangesFeedRequest {
    pub since: u64,
    pub limit: usize,
    pub feed: Feed,
    pub filter: Option<String>,
    pub filter_params: Option<Value>,
}

/// One row of a peer's `_changes` response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub seq: u64,
    pub id: String,
    /// Leaf revision IDs (`style=all_docs` reports all of them).
    pub revs: Vec<String>,
    pub deleted: bool,
}

impl ChangeRow {
    /// Parse a wire row `{seq, id, changes: [{rev}], deleted?}`.
    pub fn from_value(value: &Value) -> Option<ChangeRow> {
        let seq = parse_sequence(value.get("seq")?)?;
        let id = value.get("id")?.as_str()?.to_string();
        let revs: Vec<String> = value
            .get("changes")?
            .as_array()?
            .iter()
            .filter_map(|c| c.get("rev").and_then(Value::as_str).map(str::to_string))
            .collect();
        if revs.is_empty() {
            return None;
        }
        Some(ChangeRow {
            seq,
            id,
            revs,
            deleted: value.get("deleted").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// A page of changes from a normal or longpoll feed.
#[derive(Debug, Clone, Default)]
pub struct ChangesPage {
    pub rows: Vec<ChangeRow>,
    pub last_seq: u64,
}

/// Sequences arrive as numbers or numeric strings depending on the peer.
pub fn parse_sequence(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.split('-').next()?.parse().ok(),
        _ => None,
    }
}

/// The remote side of a replication.
#[async_trait]
pub trait Peer: Send + Sync + 'static {
    /// Canonical URL used for checkpoint identity and settings matching.
    fn url(&self) -> &str;

    /// Local peers skip reachability and go online immediately.
    fn is_local(&self) -> bool;

    /// Host and port to probe for reachability.
    fn host_and_port(&self) -> Option<(String, u16)>;

    /// Abort every in-flight request.
    fn stop_outstanding(&self);

    /// Number of requests currently in flight.
    fn outstanding(&self) -> usize;

    /// `GET /_session` (with a relative-path fallback for gateways).
    async fn check_session(&self) -> Result<Value>;

    /// POST a login body to a site-relative path.
    async fn login(&self, path: &str, params: &Value) -> Result<()>;

    /// Fetch `_local/<id>`; a missing checkpoint is `Ok(None)` and must not
    /// be logged as an error.
    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Value>>;

    /// PUT `_local/<id>`; returns the new `_rev`.
    async fn put_checkpoint(&self, checkpoint_id: &str, body: Value) -> Result<String>;

    /// POST `_revs_diff` with `{doc_id: [rev_ids]}`.
    async fn revs_diff(&self, revs: Value) -> Result<Value>;

    /// POST `_bulk_docs` with `new_edits: false`; returns per-doc results.
    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<Value>>;

    /// PUT the database root; an existing database (412) is success.
    async fn create_db(&self) -> Result<()>;

    /// One normal/longpoll `_changes` round-trip.
    async fn changes_once(&self, request: &ChangesFeedRequest) -> Result<ChangesPage>;

    /// A continuous `_changes` stream of rows.
    async fn changes_stream(
        &self,
        request: &ChangesFeedRequest,
    ) -> Result<BoxStream<'static, Result<ChangeRow>>>;

    /// Fetch one revision with inline attachments and its history.
    async fn get_document_with_history(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> Result<(Value, Vec<String>)>;
}

// =============================================================================
// Request pool
// =============================================================================

/// Registry of in-flight HTTP requests, cancellable as a set.
#[derive(Default)]
pub struct RequestPool {
    handles: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl RequestPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a future under the pool. Registered on entry, deregistered on
    /// completion; `stop_all()` aborts it, surfacing `Cancelled`.
    pub async fn run<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let (handle, registration) = AbortHandle::new_pair();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(id, handle);

        let result = Abortable::new(fut, registration).await;
        self.handles.lock().unwrap().remove(&id);

        match result {
            Ok(inner) => inner,
            Err(_aborted) => Err(EngineError::new(Status::Cancelled)),
        }
    }

    /// Snapshot-and-clear, then abort each member. Completion callbacks
    /// deregistering themselves find an already-empty map.
    pub fn stop_all(&self) {
        let snapshot: Vec<AbortHandle> = {
            let mut handles = self.handles.lock().unwrap();
            handles.drain().map(|(_, h)| h).collect()
        };
        if !snapshot.is_empty() {
            debug!(count = snapshot.len(), "Cancelling in-flight remote requests");
        }
        for handle in snapshot {
            handle.abort();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

// =============================================================================
// HTTP peer
// =============================================================================

/// CouchDB-compatible peer over HTTP(S).
pub struct HttpPeer {
    /// Database root, trailing-slash normalized, credentials stripped.
    base_url: Url,
    display_url: String,
    client: reqwest::Client,
    pool: Arc<RequestPool>,
    authorizer: Mutex<Option<Authorizer>>,
    extra_headers: Vec<(String, String)>,
}

impl HttpPeer {
    /// Build a peer for the database at `url`. URL userinfo becomes a Basic
    /// authorizer when no explicit one is supplied.
    pub fn new(
        url: Url,
        authorizer: Option<Authorizer>,
        extra_headers: HashMap<String, String>,
    ) -> Result<Self> {
        let authorizer = authorizer.or_else(|| Authorizer::from_url(&url));

        let mut base_url = url.clone();
        let _ = base_url.set_username("");
        let _ = base_url.set_password(None);
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let display_url = base_url.as_str().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::with_reason(Status::Network, e.to_string()))?;

        Ok(Self {
            base_url,
            display_url,
            client,
            pool: Arc::new(RequestPool::new()),
            authorizer: Mutex::new(authorizer),
            extra_headers: extra_headers.into_iter().collect(),
        })
    }

    /// The current authorizer (tests peek at absorbed cookies).
    pub fn authorizer(&self) -> Option<Authorizer> {
        self.authorizer.lock().unwrap().clone()
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| EngineError::with_reason(Status::BadRequest, e.to_string()))
    }

    /// Server root (scheme://host:port/), for `/_session`.
    fn server_root(&self) -> Result<Url> {
        let mut root = self.base_url.clone();
        root.set_path("/");
        root.set_query(None);
        Ok(root)
    }

    fn build(&self, method: reqwest::Method, url: Url, body: Option<&Value>) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(auth) = self.authorizer.lock().unwrap().as_ref() {
            if let Some((name, value)) = auth.authorization_header() {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
    }

    /// Send a JSON request through the pool. Returns `(status, body)`;
    /// non-success statuses come back as `Err` carrying the mapped kind.
    /// `quiet_404` suppresses the warning log for expected misses.
    async fn send(
        &self,
        method: reqwest::Method,
        url: Url,
        body: Option<&Value>,
        quiet_404: bool,
    ) -> Result<(u16, Value)> {
        let builder = self.build(method.clone(), url.clone(), body);
        let remote_display = self.display_url.clone();

        self.pool
            .run(async move {
                trace!(method = %method, url = %url, "remote request");
                let response = builder.send().await?;
                let code = response.status().as_u16();

                // Adopt any updated session cookie unless the request was
                // rejected outright.
                if code != 401 {
                    if let Some(set_cookie) = response
                        .headers()
                        .get("set-cookie")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                    {
                        if let Some(auth) = self.authorizer.lock().unwrap().as_mut() {
                            auth.absorb_cookie(&set_cookie);
                        }
                    }
                }

                let bytes = response.bytes().await?;
                let body: Value = if bytes.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
                };

                let status = Status::from_http(code);
                if status.is_success() {
                    Ok((code, body))
                } else {
                    if !(code == 404 && quiet_404) {
                        warn!(remote = %remote_display, code, "remote request failed");
                    }
                    let reason = body
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Err(EngineError {
                        status,
                        reason,
                    })
                }
            })
            .await
    }
}

#[async_trait]
impl Peer for HttpPeer {
    fn url(&self) -> &str {
        &self.display_url
    }

    fn is_local(&self) -> bool {
        false
    }

    fn host_and_port(&self) -> Option<(String, u16)> {
        let host = self.base_url.host_str()?.to_string();
        let port = self
            .base_url
            .port_or_known_default()
            .unwrap_or(5984);
        Some((host, port))
    }

    fn stop_outstanding(&self) {
        self.pool.stop_all();
    }

    fn outstanding(&self) -> usize {
        self.pool.in_flight()
    }

    async fn check_session(&self) -> Result<Value> {
        // Server-root `/_session` first; a gateway that namespaces per-db
        // answers at the db-relative path instead.
        let root = self.server_root()?.join("_session").map_err(|e| {
            EngineError::with_reason(Status::BadRequest, e.to_string())
        })?;
        match self.send(reqwest::Method::GET, root, None, true).await {
            Ok((_, body)) => Ok(body),
            Err(err) if err.status == Status::NotFound => {
                let relative = self.resolve("_session")?;
                let (_, body) = self.send(reqwest::Method::GET, relative, None, false).await?;
                Ok(body)
            }
            Err(err) => Err(err),
        }
    }

    async fn login(&self, path: &str, params: &Value) -> Result<()> {
        let url = self.server_root()?.join(path).map_err(|e| {
            EngineError::with_reason(Status::BadRequest, e.to_string())
        })?;
        self.send(reqwest::Method::POST, url, Some(params), false)
            .await?;
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Value>> {
        let url = self.resolve(&format!("_local/{}", checkpoint_id))?;
        match self.send(reqwest::Method::GET, url, None, true).await {
            Ok((_, body)) => Ok(Some(body)),
            Err(err) if err.status == Status::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put_checkpoint(&self, checkpoint_id: &str, body: Value) -> Result<String> {
        let url = self.resolve(&format!("_local/{}", checkpoint_id))?;
        let (_, response) = self
            .send(reqwest::Method::PUT, url, Some(&body), false)
            .await?;
        response
            .get("rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::with_reason(Status::Network, "checkpoint PUT returned no rev")
            })
    }

    async fn revs_diff(&self, revs: Value) -> Result<Value> {
        let url = self.resolve("_revs_diff")?;
        let (_, body) = self
            .send(reqwest::Method::POST, url, Some(&revs), false)
            .await?;
        Ok(body)
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let url = self.resolve("_bulk_docs")?;
        let payload = json!({"docs": docs, "new_edits": false});
        let (_, body) = self
            .send(reqwest::Method::POST, url, Some(&payload), false)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    async fn create_db(&self) -> Result<()> {
        let url = self.base_url.clone();
        match self.send(reqwest::Method::PUT, url, None, false).await {
            Ok(_) => Ok(()),
            Err(err) if err.status == Status::Duplicate => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn changes_once(&self, request: &ChangesFeedRequest) -> Result<ChangesPage> {
        let url = self.changes_url(request, match request.feed {
            Feed::Longpoll => Feed::Longpoll,
            _ => Feed::Normal,
        })?;
        let (_, body) = self.send(reqwest::Method::GET, url, None, false).await?;

        let rows: Vec<ChangeRow> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().filter_map(ChangeRow::from_value).collect())
            .unwrap_or_default();
        let last_seq = body
            .get("last_seq")
            .and_then(parse_sequence)
            .unwrap_or(request.since);
        Ok(ChangesPage { rows, last_seq })
    }

    async fn changes_stream(
        &self,
        request: &ChangesFeedRequest,
    ) -> Result<BoxStream<'static, Result<ChangeRow>>> {
        let url = self.changes_url(request, Feed::Continuous)?;
        let builder = self.build(reqwest::Method::GET, url, None);
        let response = builder.send().await?;
        let code = response.status().as_u16();
        if !Status::from_http(code).is_success() {
            return Err(EngineError::new(Status::from_http(code)));
        }

        // Newline-delimited JSON: one decode per line; blank heartbeat
        // lines are skipped.
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EngineError::from))
            .scan(Vec::<u8>::new(), |buffer, chunk| {
                let out: Vec<Result<ChangeRow>> = match chunk {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        let mut rows = Vec::new();
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line);
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if let Ok(value) = serde_json::from_str::<Value>(line) {
                                if value.get("last_seq").is_some() {
                                    continue;
                                }
                                if let Some(row) = ChangeRow::from_value(&value) {
                                    rows.push(Ok(row));
                                }
                            }
                        }
                        rows
                    }
                    Err(e) => vec![Err(e)],
                };
                std::future::ready(Some(futures::stream::iter(out)))
            })
            .flatten();
        Ok(stream.boxed())
    }

    async fn get_document_with_history(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> Result<(Value, Vec<String>)> {
        let mut url = self.resolve(&urlencode_doc_id(doc_id))?;
        url.query_pairs_mut()
            .append_pair("rev", rev_id)
            .append_pair("revs", "true")
            .append_pair("attachments", "true");
        let (_, body) = self.send(reqwest::Method::GET, url, None, false).await?;
        let history = history_from_revisions(&body, rev_id);
        Ok((body, history))
    }
}

impl HttpPeer {
    fn changes_url(&self, request: &ChangesFeedRequest, feed: Feed) -> Result<Url> {
        let mut url = self.resolve("_changes")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("feed", feed.as_str())
                .append_pair("since", &request.since.to_string())
                .append_pair("style", "all_docs")
                .append_pair("heartbeat", "300000");
            if request.limit > 0 && feed != Feed::Continuous {
                query.append_pair("limit", &request.limit.to_string());
            }
            if let Some(filter) = &request.filter {
                query.append_pair("filter", filter);
                if let Some(Value::Object(params)) = &request.filter_params {
                    for (key, value) in params {
                        let text = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        query.append_pair(key, &text);
                    }
                }
            }
        }
        Ok(url)
    }
}

/// Extract a newest-first history list from a `_revisions` object.
pub fn history_from_revisions(body: &Value, tip_rev_id: &str) -> Vec<String> {
    let Some(revisions) = body.get("_revisions") else {
        return vec![tip_rev_id.to_string()];
    };
    let start = revisions.get("start").and_then(Value::as_u64).unwrap_or(0);
    let ids = revisions
        .get("ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if start == 0 || ids.is_empty() {
        return vec![tip_rev_id.to_string()];
    }
    ids.iter()
        .enumerate()
        .filter_map(|(i, suffix)| {
            let generation = start.checked_sub(i as u64)?;
            Some(format!("{}-{}", generation, suffix))
        })
        .collect()
}

/// Percent-encode a doc ID for a URL path, preserving the `_design/` and
/// `_local/` prefixes' slash.
pub fn urlencode_doc_id(doc_id: &str) -> String {
    fn encode_segment(seg: &str) -> String {
        let mut out = String::new();
        for byte in seg.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'$'
                | b'(' | b')' | b'+' => out.push(byte as char),
                other => out.push_str(&format!("%{:02X}", other)),
            }
        }
        out
    }
    if let Some(rest) = doc_id.strip_prefix("_design/") {
        format!("_design/{}", encode_segment(rest))
    } else if let Some(rest) = doc_id.strip_prefix("_local/") {
        format!("_local/{}", encode_segment(rest))
    } else {
        encode_segment(doc_id)
    }
}

// =============================================================================
// Local peer
// =============================================================================

/// Another database in this process acting as the remote side.
pub struct LocalPeer {
    db: Arc<dyn Database>,
    url: String,
}

impl LocalPeer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let url = format!("local:///{}", db.name());
        Self { db, url }
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn url(&self) -> &str {
        &self.url
    }

    fn is_local(&self) -> bool {
        true
    }

    fn host_and_port(&self) -> Option<(String, u16)> {
        None
    }

    fn stop_outstanding(&self) {}

    fn outstanding(&self) -> usize {
        0
    }

    async fn check_session(&self) -> Result<Value> {
        Ok(json!({"ok": true, "userCtx": {"name": Value::Null, "roles": []}}))
    }

    async fn login(&self, _path: &str, _params: &Value) -> Result<()> {
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Value>> {
        Ok(self.db.get_local_document(checkpoint_id).map(|(rev, mut body)| {
            if let Some(map) = body.as_object_mut() {
                map.insert("_rev".into(), json!(rev));
            }
            body
        }))
    }

    async fn put_checkpoint(&self, checkpoint_id: &str, body: Value) -> Result<String> {
        let prev_rev = body
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string);
        let rev = self
            .db
            .put_local_document(checkpoint_id, Some(body), prev_rev.as_deref())?;
        rev.ok_or_else(|| EngineError::new(Status::ServerError))
    }

    async fn revs_diff(&self, revs: Value) -> Result<Value> {
        let Value::Object(input) = revs else {
            return Err(EngineError::new(Status::BadRequest));
        };
        Ok(crate::router::compute_revs_diff(self.db.as_ref(), &input))
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        self.db.begin_transaction();
        for doc in docs {
            let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or_default();
            let rev_id = doc.get("_rev").and_then(Value::as_str).unwrap_or_default();
            let deleted = doc
                .get("_deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let history = history_from_revisions(&doc, rev_id);
            let rev = Revision {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
                deleted,
                sequence: None,
                body: Some(doc.clone()),
            };
            if let Err(err) = self.db.force_insert(&rev, &history, Some(&self.url)) {
                results.push(json!({
                    "id": doc_id,
                    "error": err.status.error_string(),
                    "reason": err.reason(),
                }));
            }
        }
        self.db.end_transaction(true);
        Ok(results)
    }

    async fn create_db(&self) -> Result<()> {
        // The handle exists, so the database does.
        Ok(())
    }

    async fn changes_once(&self, request: &ChangesFeedRequest) -> Result<ChangesPage> {
        let filter = match &request.filter {
            Some(name) => Some(self.db.compile_filter(name)?),
            None => None,
        };
        let params = request.filter_params.clone().unwrap_or(Value::Null);
        let mut options = ChangesOptions::default();
        options.set_conflict_mode(true);
        let list = self
            .db
            .changes_since(request.since, &options, filter.as_ref(), &params)?;
        let mut page = page_from_list(list, request.since);
        // The limit counts rows (documents), not revisions, so it is
        // applied after grouping; callers treat a short page as caught-up.
        if request.limit > 0 && page.rows.len() > request.limit {
            page.rows.truncate(request.limit);
            page.last_seq = page.rows.last().map(|row| row.seq).unwrap_or(request.since);
        }
        Ok(page)
    }

    async fn changes_stream(
        &self,
        request: &ChangesFeedRequest,
    ) -> Result<BoxStream<'static, Result<ChangeRow>>> {
        let filter: Option<FilterFn> = match &request.filter {
            Some(name) => Some(self.db.compile_filter(name)?),
            None => None,
        };
        let params = request.filter_params.clone().unwrap_or(Value::Null);

        // Subscribe before the backfill so no commit can slip between.
        let receiver = self.db.changes_broker().subscribe();
        let mut options = ChangesOptions::default();
        options.set_conflict_mode(true);
        let backfill = self
            .db
            .changes_since(request.since, &options, filter.as_ref(), &params)?;
        let backfill_rows = page_from_list(backfill, request.since).rows;
        let mut seen_seq = backfill_rows.iter().map(|r| r.seq).max().unwrap_or(request.since);

        let filter_clone = filter.clone();
        let live = futures::stream::unfold(
            (receiver, filter_clone, params),
            |(mut receiver, filter, params)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            if let Some(filter) = &filter {
                                if !filter(&event.revision, &params) {
                                    continue;
                                }
                            }
                            let row = row_from_event(&event);
                            return Some((Ok(row), (receiver, filter, params)));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "local changes stream lagged");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        let stream = futures::stream::iter(backfill_rows.into_iter().map(Ok))
            .chain(live.filter(move |row| {
                // Drop live events already covered by the backfill.
                let keep = match row {
                    Ok(row) => {
                        if row.seq <= seen_seq {
                            false
                        } else {
                            seen_seq = row.seq;
                            true
                        }
                    }
                    Err(_) => true,
                };
                std::future::ready(keep)
            }));
        Ok(stream.boxed())
    }

    async fn get_document_with_history(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> Result<(Value, Vec<String>)> {
        let rev = self.db.get_document(doc_id, Some(rev_id))?;
        let history = self.db.revision_history(doc_id, rev_id);
        Ok((rev.body_for_wire(), history))
    }
}

fn row_from_event(event: &ChangeEvent) -> ChangeRow {
    ChangeRow {
        seq: event.revision.sequence_or_zero(),
        id: event.revision.doc_id.clone(),
        revs: vec![event.revision.rev_id.clone()],
        deleted: event.revision.deleted,
    }
}

/// Collapse a conflict-mode revision list into per-document change rows.
fn page_from_list(list: RevisionList, since: u64) -> ChangesPage {
    let mut rows = Vec::new();
    for (doc_id, group) in list.grouped_by_doc_id() {
        let seq = group
            .iter()
            .map(|r| r.sequence_or_zero())
            .max()
            .unwrap_or(0);
        let deleted = group
            .iter()
            .max_by_key(|r| r.sequence_or_zero())
            .map(|r| r.deleted)
            .unwrap_or(false);
        rows.push(ChangeRow {
            seq,
            id: doc_id,
            revs: group.iter().map(|r| r.rev_id.clone()).collect(),
            deleted,
        });
    }
    rows.sort_by_key(|r| r.seq);
    let last_seq = rows.iter().map(|r| r.seq).max().unwrap_or(since);
    ChangesPage { rows, last_seq }
}
