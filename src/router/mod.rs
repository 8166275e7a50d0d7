// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! REST request dispatch.
//!
//! The router core is transport-neutral: it consumes a parsed
//! [`RouterRequest`] and produces a [`RouterResponse`]. Paths resolve to a
//! typed [`Route`] variant (a match, not reflection), then `(route,
//! method)` selects a handler. [`http_router`] binds the whole thing to an
//! `axum::Router` for serving.
//!
//! # Path Grammar
//!
//! ```text
//! /                                 root
//! /_all_dbs /_uuids /_replicate /_session /_persona_assertion /_active_tasks
//! /<db>                             database
//! /<db>/_all_docs|_bulk_docs|_revs_diff|_compact|_ensure_full_commit
//!      |_purge|_changes|_temp_view
//! /<db>/_design/<ddoc>              design document
//! /<db>/_design/<ddoc>/_view/<view> view query
//! /<db>/_local/<id>                 local document
//! /<db>/<doc>                       document
//! /<db>/<doc>/<attachment>          attachment
//! ```
//!
//! Unknown paths are 404; a known path with an unsupported method is 405.
//! Document IDs beginning with `_` are reserved except under `_design/`
//! and `_local/`.

mod changes_feed;
mod database;
mod document;
mod server;
mod views;

pub(crate) use database::compute_revs_diff;

use crate::engine::{is_valid_database_name, Engine};
use crate::error::{EngineError, Result, Status};
use crate::metrics;
use crate::store::{Database, QueryOptions};
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A parsed request, independent of the HTTP stack.
pub struct RouterRequest {
    pub method: Method,
    /// URL-decoded path segments.
    pub segments: Vec<String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RouterRequest {
    pub fn new(method: Method, path: &str, query: &str) -> Self {
        Self {
            method,
            segments: decode_path(path),
            query: parse_query(query),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn query_str(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn query_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.query_str(name) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(EngineError::with_reason(
                Status::BadParam,
                format!("invalid boolean for '{}': {}", name, other),
            )),
        }
    }

    pub fn query_u64(&self, name: &str) -> Result<Option<u64>> {
        match self.query_str(name) {
            None => Ok(None),
            Some(text) => text.parse().map(Some).map_err(|_| {
                EngineError::with_reason(
                    Status::BadParam,
                    format!("invalid number for '{}': {}", name, text),
                )
            }),
        }
    }

    /// A query value that is itself JSON (`startkey`, `keys`, ...). Bare
    /// words fall back to strings, matching lenient CouchDB clients.
    pub fn query_json(&self, name: &str) -> Result<Option<Value>> {
        match self.query_str(name) {
            None => Ok(None),
            Some(text) => match serde_json::from_str(text) {
                Ok(value) => Ok(Some(value)),
                Err(_) => Ok(Some(Value::String(text.to_string()))),
            },
        }
    }

    pub fn body_json(&self) -> Result<Value> {
        if self.body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.body)
            .map_err(|e| EngineError::with_reason(Status::BadJson, e.to_string()))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn if_none_match(&self) -> Option<String> {
        self.header("if-none-match").map(unquote_etag)
    }

    pub fn if_match(&self) -> Option<String> {
        self.header("if-match").map(unquote_etag)
    }

    pub fn accepts_multipart(&self) -> bool {
        self.header("accept")
            .map(|accept| accept.contains("multipart/"))
            .unwrap_or(false)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

fn unquote_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

/// Response body shapes the handlers produce.
pub enum ResponseBody {
    Empty,
    Json(Value),
    Binary { data: Bytes, content_type: String },
    Stream {
        stream: BoxStream<'static, Bytes>,
        content_type: String,
    },
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ResponseBody::Binary { content_type, .. } => f
                .debug_struct("Binary")
                .field("content_type", content_type)
                .finish(),
            ResponseBody::Stream { content_type, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .finish(),
        }
    }
}

pub struct RouterResponse {
    pub status: Status,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl std::fmt::Debug for RouterResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl RouterResponse {
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Empty,
        }
    }

    pub fn json(status: Status, value: Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Json(value),
        }
    }

    pub fn stream(stream: BoxStream<'static, Bytes>, content_type: &str) -> Self {
        Self {
            status: Status::Ok,
            headers: Vec::new(),
            body: ResponseBody::Stream {
                stream,
                content_type: content_type.to_string(),
            },
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// The JSON error envelope for a failed request.
    pub fn error(err: EngineError) -> Self {
        Self::json(
            err.status,
            json!({
                "error": err.status.error_string(),
                "reason": err.reason(),
            }),
        )
    }

    /// Attach an ETag, or collapse to 304 when the client already has it.
    pub fn conditional(self, request: &RouterRequest, etag: &str) -> Self {
        if request.if_none_match().as_deref() == Some(etag) {
            return RouterResponse::empty(Status::NotModified)
                .with_header("etag", format!("\"{}\"", etag));
        }
        self.with_header("etag", format!("\"{}\"", etag))
    }
}

/// A resolved request path.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Root,
    AllDbs,
    Uuids,
    Replicate,
    Session,
    PersonaAssertion,
    ActiveTasks,
    Database { db: String },
    AllDocs { db: String },
    BulkDocs { db: String },
    RevsDiff { db: String },
    Compact { db: String },
    EnsureFullCommit { db: String },
    Purge { db: String },
    Changes { db: String },
    TempView { db: String },
    View { db: String, ddoc: String, view: String },
    LocalDoc { db: String, doc_id: String },
    Document { db: String, doc_id: String },
    Attachment { db: String, doc_id: String, name: String },
}

/// Resolve decoded path segments to a route.
pub fn parse_route(segments: &[String]) -> Result<Route> {
    let not_found = || EngineError::new(Status::NotFound);
    let bad_id = |id: &str| {
        EngineError::with_reason(Status::BadId, format!("invalid document ID '{}'", id))
    };

    match segments {
        [] => Ok(Route::Root),
        [first] if first.starts_with('_') => match first.as_str() {
            "_all_dbs" => Ok(Route::AllDbs),
            "_uuids" => Ok(Route::Uuids),
            "_replicate" => Ok(Route::Replicate),
            "_session" => Ok(Route::Session),
            "_persona_assertion" => Ok(Route::PersonaAssertion),
            "_active_tasks" => Ok(Route::ActiveTasks),
            _ => Err(not_found()),
        },
        [db, rest @ ..] => {
            if !is_valid_database_name(db) {
                return Err(not_found());
            }
            let db = db.clone();
            match rest {
                [] => Ok(Route::Database { db }),
                [special] if special.starts_with('_') => match special.as_str() {
                    "_all_docs" => Ok(Route::AllDocs { db }),
                    "_bulk_docs" => Ok(Route::BulkDocs { db }),
                    "_revs_diff" => Ok(Route::RevsDiff { db }),
                    "_compact" => Ok(Route::Compact { db }),
                    "_ensure_full_commit" => Ok(Route::EnsureFullCommit { db }),
                    "_purge" => Ok(Route::Purge { db }),
                    "_changes" => Ok(Route::Changes { db }),
                    "_temp_view" => Ok(Route::TempView { db }),
                    other => Err(bad_id(other)),
                },
                [a, ddoc] if a == "_design" => Ok(Route::Document {
                    db,
                    doc_id: format!("_design/{}", ddoc),
                }),
                [a, ddoc, b, view] if a == "_design" && b == "_view" => Ok(Route::View {
                    db,
                    ddoc: ddoc.clone(),
                    view: view.clone(),
                }),
                [a, id] if a == "_local" => Ok(Route::LocalDoc {
                    db,
                    doc_id: id.clone(),
                }),
                [doc_id] => {
                    if doc_id.starts_with('_') {
                        return Err(bad_id(doc_id));
                    }
                    Ok(Route::Document {
                        db,
                        doc_id: doc_id.clone(),
                    })
                }
                [doc_id, name] => {
                    if doc_id.starts_with('_') {
                        return Err(bad_id(doc_id));
                    }
                    Ok(Route::Attachment {
                        db,
                        doc_id: doc_id.clone(),
                        name: name.clone(),
                    })
                }
                _ => Err(not_found()),
            }
        }
    }
}

/// Dispatch one request.
pub async fn dispatch(engine: &Arc<Engine>, request: RouterRequest) -> RouterResponse {
    let route = match parse_route(&request.segments) {
        Ok(route) => route,
        Err(err) => return RouterResponse::error(err),
    };
    debug!(method = %request.method, route = ?route, "dispatch");

    let result = route_to_handler(engine, &route, &request).await;
    let response = match result {
        Ok(response) => response,
        Err(err) => RouterResponse::error(err),
    };
    metrics::record_request(endpoint_label(&route), response.status.http_code());
    response
}

fn endpoint_label(route: &Route) -> &'static str {
    match route {
        Route::Root => "/",
        Route::AllDbs => "_all_dbs",
        Route::Uuids => "_uuids",
        Route::Replicate => "_replicate",
        Route::Session => "_session",
        Route::PersonaAssertion => "_persona_assertion",
        Route::ActiveTasks => "_active_tasks",
        Route::Database { .. } => "db",
        Route::AllDocs { .. } => "_all_docs",
        Route::BulkDocs { .. } => "_bulk_docs",
        Route::RevsDiff { .. } => "_revs_diff",
        Route::Compact { .. } => "_compact",
        Route::EnsureFullCommit { .. } => "_ensure_full_commit",
        Route::Purge { .. } => "_purge",
        Route::Changes { .. } => "_changes",
        Route::TempView { .. } => "_temp_view",
        Route::View { .. } => "_view",
        Route::LocalDoc { .. } => "_local",
        Route::Document { .. } => "doc",
        Route::Attachment { .. } => "attachment",
    }
}

async fn route_to_handler(
    engine: &Arc<Engine>,
    route: &Route,
    request: &RouterRequest,
) -> Result<RouterResponse> {
    let method = request.method.as_str();
    let db_of = |name: &str| -> Result<Arc<dyn Database>> {
        engine.database(name).ok_or_else(|| {
            EngineError::with_reason(Status::NotFound, format!("no database named '{}'", name))
        })
    };
    let not_allowed = || Err(EngineError::new(Status::MethodNotAllowed));

    match route {
        Route::Root => match method {
            "GET" => server::root(),
            _ => not_allowed(),
        },
        Route::AllDbs => match method {
            "GET" => server::all_dbs(engine),
            _ => not_allowed(),
        },
        Route::Uuids => match method {
            "GET" => server::uuids(request),
            _ => not_allowed(),
        },
        Route::Replicate => match method {
            "POST" => server::replicate(engine, request),
            _ => not_allowed(),
        },
        Route::Session => match method {
            "GET" => server::get_session(),
            "POST" => server::post_session(request),
            "DELETE" => Ok(RouterResponse::json(Status::Ok, json!({"ok": true}))),
            _ => not_allowed(),
        },
        Route::PersonaAssertion => match method {
            "POST" => server::persona_assertion(request),
            _ => not_allowed(),
        },
        Route::ActiveTasks => match method {
            "GET" => server::active_tasks(engine, request),
            _ => not_allowed(),
        },
        Route::Database { db } => match method {
            "GET" => database::db_info(&db_of(db)?, request),
            "PUT" => database::create_db(engine, db),
            "DELETE" => database::delete_db(engine, db, request),
            "POST" => document::post_doc(&db_of(db)?, request),
            _ => not_allowed(),
        },
        Route::AllDocs { db } => match method {
            "GET" => database::all_docs(&db_of(db)?, request, None),
            "POST" => {
                let body = request.body_json()?;
                database::all_docs(&db_of(db)?, request, Some(body))
            }
            _ => not_allowed(),
        },
        Route::BulkDocs { db } => match method {
            "POST" => database::bulk_docs(&db_of(db)?, request),
            _ => not_allowed(),
        },
        Route::RevsDiff { db } => match method {
            "POST" => database::revs_diff(&db_of(db)?, request),
            _ => not_allowed(),
        },
        Route::Compact { db } => match method {
            "POST" => database::compact(&db_of(db)?),
            _ => not_allowed(),
        },
        Route::EnsureFullCommit { db } => match method {
            "POST" => database::ensure_full_commit(engine, &db_of(db)?),
            _ => not_allowed(),
        },
        Route::Purge { db } => match method {
            "POST" => database::purge(&db_of(db)?, request),
            _ => not_allowed(),
        },
        Route::Changes { db } => match method {
            "GET" | "POST" => changes_feed::changes(&db_of(db)?, request).await,
            _ => not_allowed(),
        },
        Route::TempView { db } => match method {
            "POST" => views::temp_view(&db_of(db)?, request),
            _ => not_allowed(),
        },
        Route::View { db, ddoc, view } => match method {
            "GET" => views::query_view(&db_of(db)?, ddoc, view, request, None),
            "POST" => {
                let body = request.body_json()?;
                views::query_view(&db_of(db)?, ddoc, view, request, Some(body))
            }
            _ => not_allowed(),
        },
        Route::LocalDoc { db, doc_id } => match method {
            "GET" => document::get_local_doc(&db_of(db)?, doc_id, request),
            "PUT" => document::put_local_doc(&db_of(db)?, doc_id, request),
            "DELETE" => document::delete_local_doc(&db_of(db)?, doc_id, request),
            _ => not_allowed(),
        },
        Route::Document { db, doc_id } => match method {
            "GET" => document::get_doc(&db_of(db)?, doc_id, request),
            "PUT" => document::put_doc(&db_of(db)?, doc_id, request),
            "DELETE" => document::delete_doc(&db_of(db)?, doc_id, request),
            _ => not_allowed(),
        },
        Route::Attachment { db, doc_id, name } => match method {
            "GET" => document::get_attachment(&db_of(db)?, doc_id, name, request),
            "PUT" => document::put_attachment(&db_of(db)?, doc_id, name, request),
            "DELETE" => document::delete_attachment(&db_of(db)?, doc_id, name, request),
            _ => not_allowed(),
        },
    }
}

/// Parse the shared `_all_docs`/view query options.
pub(crate) fn parse_query_options(
    request: &RouterRequest,
    posted: Option<&Value>,
) -> Result<QueryOptions> {
    let mut options = QueryOptions {
        skip: request.query_u64("skip")?.unwrap_or(0) as usize,
        limit: request.query_u64("limit")?.map(|l| l as usize),
        start_key: request
            .query_json("startkey")?
            .or(request.query_json("start_key")?),
        end_key: request
            .query_json("endkey")?
            .or(request.query_json("end_key")?),
        descending: request.query_bool("descending", false)?,
        include_docs: request.query_bool("include_docs", false)?,
        update_seq: request.query_bool("update_seq", false)?,
        group: request.query_bool("group", false)?,
        group_level: request.query_u64("group_level")?.unwrap_or(0),
        stale: request.query_str("stale") == Some("ok"),
        reduce: match request.query_str("reduce") {
            None => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(other) => {
                return Err(EngineError::with_reason(
                    Status::BadParam,
                    format!("invalid boolean for 'reduce': {}", other),
                ))
            }
        },
        keys: None,
    };
    if let Some(key) = request.query_json("key")? {
        options.keys = Some(vec![key]);
    }
    if let Some(keys) = request.query_json("keys")? {
        options.keys = Some(
            keys.as_array()
                .ok_or_else(|| EngineError::with_reason(Status::BadParam, "keys must be an array"))?
                .clone(),
        );
    }
    if let Some(Value::Object(body)) = posted {
        if let Some(keys) = body.get("keys") {
            options.keys = Some(
                keys.as_array()
                    .ok_or_else(|| {
                        EngineError::with_reason(Status::BadJson, "keys must be an array")
                    })?
                    .clone(),
            );
        }
    }
    Ok(options)
}

fn decode_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8_lossy()
                .into_owned()
        })
        .collect()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// =============================================================================
// axum adapter
// =============================================================================

/// Bind the dispatch layer to an `axum::Router`.
pub fn http_router(engine: Arc<Engine>) -> axum::Router {
    axum::Router::new()
        .fallback(handle_any)
        .with_state(engine)
}

async fn handle_any(
    axum::extract::State(engine): axum::extract::State<Arc<Engine>>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, 64 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return into_axum(RouterResponse::error(EngineError::with_reason(
                Status::BadRequest,
                "unreadable body",
            )))
        }
    };

    let router_request = RouterRequest {
        method: parts.method,
        segments: decode_path(parts.uri.path()),
        query: parse_query(parts.uri.query().unwrap_or("")),
        headers: parts.headers,
        body: bytes,
    };
    into_axum(dispatch(&engine, router_request).await)
}

fn into_axum(response: RouterResponse) -> axum::response::Response {
    use axum::body::Body;
    let mut builder = axum::http::Response::builder().status(response.status.http_code());
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let result = match response.body {
        ResponseBody::Empty => builder.body(Body::empty()),
        ResponseBody::Json(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string())),
        ResponseBody::Binary { data, content_type } => builder
            .header("content-type", content_type)
            .body(Body::from(data)),
        ResponseBody::Stream {
            stream,
            content_type,
        } => builder
            .header("content-type", content_type)
            .body(Body::from_stream(
                stream.map(Ok::<Bytes, std::convert::Infallible>),
            )),
    };
    result.unwrap_or_else(|_| {
        axum::http::Response::builder()
            .status(500)
            .body(Body::empty())
            .expect("static response")
    })
}
