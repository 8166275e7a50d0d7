// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-level handlers: `/`, `_all_dbs`, `_uuids`, `_replicate`,
//! `_session`, `_persona_assertion`, `_active_tasks`.

use super::{RouterRequest, RouterResponse};
use crate::engine::{random_uuid, Engine};
use crate::error::{EngineError, Result, Status};
use crate::metrics;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

pub(super) fn root() -> Result<RouterResponse> {
    Ok(RouterResponse::json(
        Status::Ok,
        json!({
            "couchdb": "Welcome",
            "CouchbaseLite": "Welcome",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    ))
}

pub(super) fn all_dbs(engine: &Arc<Engine>) -> Result<RouterResponse> {
    Ok(RouterResponse::json(
        Status::Ok,
        json!(engine.database_names()),
    ))
}

/// `GET /_uuids?count=N`. `count` clamps to at most 1000; an explicit 0 is
/// honored with an empty list.
pub(super) fn uuids(request: &RouterRequest) -> Result<RouterResponse> {
    let count = request.query_u64("count")?.unwrap_or(1).min(1000) as usize;
    let uuids: Vec<String> = (0..count).map(|_| random_uuid()).collect();
    Ok(RouterResponse::json(Status::Ok, json!({"uuids": uuids})))
}

pub(super) fn replicate(engine: &Arc<Engine>, request: &RouterRequest) -> Result<RouterResponse> {
    let command = serde_json::from_slice(&request.body)
        .map_err(|e| EngineError::with_reason(Status::BadJson, e.to_string()))?;
    let response = engine.replicate(command)?;
    Ok(RouterResponse::json(Status::Ok, response))
}

/// Minimal CouchDB-shaped session document, enough for a peer replicator's
/// session check to conclude it is already authenticated.
pub(super) fn get_session() -> Result<RouterResponse> {
    Ok(RouterResponse::json(
        Status::Ok,
        json!({
            "ok": true,
            "userCtx": {"name": Value::Null, "roles": ["_admin"]},
        }),
    ))
}

pub(super) fn post_session(request: &RouterRequest) -> Result<RouterResponse> {
    let body = request.body_json()?;
    let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
    if name.is_empty() {
        return Err(EngineError::with_reason(Status::BadRequest, "name required"));
    }
    Ok(RouterResponse::json(
        Status::Ok,
        json!({"ok": true, "name": name, "roles": []}),
    )
    .with_header("set-cookie", format!("AuthSession={}; Path=/", random_uuid())))
}

/// Accept a Persona assertion. Verification belongs to the identity
/// provider integration; here the assertion's audience/email claims are
/// taken at face value, as a gateway in front of us would have verified
/// them already.
pub(super) fn persona_assertion(request: &RouterRequest) -> Result<RouterResponse> {
    let body = request.body_json()?;
    let assertion = body
        .get("assertion")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::with_reason(Status::BadRequest, "assertion required"))?;
    if assertion.is_empty() {
        return Err(EngineError::with_reason(Status::BadRequest, "assertion required"));
    }
    Ok(RouterResponse::json(
        Status::Ok,
        json!({"ok": true}),
    )
    .with_header("set-cookie", format!("PersonaSession={}; Path=/", random_uuid())))
}

/// `GET /_active_tasks`: snapshot, or a continuous NDJSON stream when
/// `feed=continuous`. The stream opens with one line per running task and
/// then follows progress and stop notifications until the client hangs up.
pub(super) fn active_tasks(engine: &Arc<Engine>, request: &RouterRequest) -> Result<RouterResponse> {
    let snapshot = engine.active_tasks();
    if request.query_str("feed") != Some("continuous") {
        return Ok(RouterResponse::json(Status::Ok, json!(snapshot)));
    }

    let receiver = engine.subscribe_tasks();
    let initial: Vec<Bytes> = snapshot.iter().map(ndjson_line).collect();
    metrics::record_changes_rows("active_tasks", initial.len());

    let live = futures::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let mut info = event.info.clone();
                    if event.stopped {
                        info["stopped"] = json!(true);
                    }
                    return Some((ndjson_line(&info), receiver));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let stream = futures::stream::iter(initial).chain(live).boxed();
    Ok(RouterResponse::stream(stream, "application/json"))
}

fn ndjson_line(value: &Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    #[test]
    fn test_root_welcome() {
        let response = root().unwrap();
        assert_eq!(response.status, Status::Ok);
        let super::super::ResponseBody::Json(body) = response.body else {
            panic!("expected JSON");
        };
        assert_eq!(body["couchdb"], "Welcome");
        assert_eq!(body["CouchbaseLite"], "Welcome");
        assert!(body["version"].as_str().is_some());
    }

    #[test]
    fn test_uuids_count_clamping() {
        let extract = |request: &RouterRequest| -> usize {
            let response = uuids(request).unwrap();
            let super::super::ResponseBody::Json(body) = response.body else {
                panic!("expected JSON");
            };
            body["uuids"].as_array().unwrap().len()
        };

        let default = RouterRequest::new(Method::GET, "/_uuids", "");
        assert_eq!(extract(&default), 1);

        let zero = RouterRequest::new(Method::GET, "/_uuids", "count=0");
        assert_eq!(extract(&zero), 0);

        let some = RouterRequest::new(Method::GET, "/_uuids", "count=5");
        assert_eq!(extract(&some), 5);

        let huge = RouterRequest::new(Method::GET, "/_uuids", "count=10000");
        assert_eq!(extract(&huge), 1000);
    }

    #[test]
    fn test_session_reports_admin_party() {
        let response = get_session().unwrap();
        let super::super::ResponseBody::Json(body) = response.body else {
            panic!("expected JSON");
        };
        assert!(body["userCtx"]["name"].is_null());
    }

    #[test]
    fn test_post_session_requires_name() {
        let mut request = RouterRequest::new(Method::POST, "/_session", "");
        request.body = Bytes::from(serde_json::to_vec(&json!({})).unwrap());
        assert_eq!(
            post_session(&request).unwrap_err().status,
            Status::BadRequest
        );

        request.body =
            Bytes::from(serde_json::to_vec(&json!({"name": "bob", "password": "x"})).unwrap());
        let response = post_session(&request).unwrap();
        assert!(response
            .headers
            .iter()
            .any(|(name, value)| name == "set-cookie" && value.starts_with("AuthSession=")));
    }

    #[test]
    fn test_persona_requires_assertion() {
        let mut request = RouterRequest::new(Method::POST, "/_persona_assertion", "");
        request.body = Bytes::from(serde_json::to_vec(&json!({})).unwrap());
        assert_eq!(
            persona_assertion(&request).unwrap_err().status,
            Status::BadRequest
        );
    }
}
