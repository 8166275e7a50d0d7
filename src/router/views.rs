// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! View queries: `_design/<ddoc>/_view/<view>` and `_temp_view`.
//!
//! View functions are compiled and run by the store's scripting runtime;
//! the handlers here only parse options and shape the response. A compile
//! failure reads as 400, an unknown view as 404. Temporary views are
//! compiled per request and torn down with it.

use super::{parse_query_options, RouterRequest, RouterResponse};
use crate::error::{EngineError, Result, Status};
use crate::store::{Database, QueryResult};
use serde_json::{json, Value};
use std::sync::Arc;

fn query_response(result: QueryResult) -> RouterResponse {
    let mut body = json!({
        "rows": result.rows,
        "total_rows": result.total_rows,
        "offset": result.offset,
    });
    if let Some(update_seq) = result.update_seq {
        body["update_seq"] = json!(update_seq);
    }
    RouterResponse::json(Status::Ok, body)
}

pub(super) fn query_view(
    db: &Arc<dyn Database>,
    ddoc: &str,
    view: &str,
    request: &RouterRequest,
    posted: Option<Value>,
) -> Result<RouterResponse> {
    let options = parse_query_options(request, posted.as_ref())?;
    let etag = db.last_sequence_number().to_string();
    let result = db.query_view(ddoc, view, &options)?;
    Ok(query_response(result).conditional(request, &etag))
}

pub(super) fn temp_view(db: &Arc<dyn Database>, request: &RouterRequest) -> Result<RouterResponse> {
    let definition = request.body_json()?;
    if !definition.is_object() || definition.get("map").is_none() {
        return Err(EngineError::with_reason(
            Status::BadRequest,
            "temp view requires a map function",
        ));
    }
    let options = parse_query_options(request, None)?;
    let result = db.query_temp_view(&definition, &options)?;
    Ok(query_response(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CompiledView, MemoryDatabase};
    use axum::http::Method;

    fn view_db() -> (Arc<MemoryDatabase>, Arc<dyn Database>) {
        let memory = Arc::new(MemoryDatabase::new("db"));
        memory.register_view(
            "app/by_n",
            CompiledView {
                map: Arc::new(|doc| {
                    doc.get("n")
                        .map(|n| vec![(n.clone(), Value::Null)])
                        .unwrap_or_default()
                }),
                reduce: None,
            },
        );
        let db: Arc<dyn Database> = Arc::clone(&memory) as Arc<dyn Database>;
        (memory, db)
    }

    #[test]
    fn test_view_query_sorted_rows() {
        let (_, db) = view_db();
        db.put(Some("a"), json!({"n": 3}), None, false).unwrap();
        db.put(Some("b"), json!({"n": 1}), None, false).unwrap();

        let request = RouterRequest::new(Method::GET, "/db/_design/app/_view/by_n", "");
        let response = query_view(&db, "app", "by_n", &request, None).unwrap();
        let super::super::ResponseBody::Json(body) = response.body else {
            panic!("expected JSON")
        };
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["key"], 1);
        assert_eq!(rows[1]["key"], 3);
        assert_eq!(body["total_rows"], 2);
    }

    #[test]
    fn test_view_keys_via_post() {
        let (_, db) = view_db();
        db.put(Some("a"), json!({"n": 3}), None, false).unwrap();
        db.put(Some("b"), json!({"n": 1}), None, false).unwrap();

        let request = RouterRequest::new(Method::POST, "/db/_design/app/_view/by_n", "");
        let response =
            query_view(&db, "app", "by_n", &request, Some(json!({"keys": [3]}))).unwrap();
        let super::super::ResponseBody::Json(body) = response.body else {
            panic!("expected JSON")
        };
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "a");
    }

    #[test]
    fn test_unknown_view_is_404() {
        let (_, db) = view_db();
        let request = RouterRequest::new(Method::GET, "/db/_design/app/_view/nope", "");
        let err = query_view(&db, "app", "nope", &request, None).unwrap_err();
        assert_eq!(err.status, Status::NotFound);
    }

    #[test]
    fn test_temp_view_requires_map() {
        let (_, db) = view_db();
        let mut request = RouterRequest::new(Method::POST, "/db/_temp_view", "");
        request.body = bytes::Bytes::from(serde_json::to_vec(&json!({})).unwrap());
        let err = temp_view(&db, &request).unwrap_err();
        assert_eq!(err.status, Status::BadRequest);
    }

    #[test]
    fn test_temp_view_compiles_and_runs() {
        let (memory, db) = view_db();
        memory.set_view_compiler(Arc::new(|_def| {
            Ok(CompiledView {
                map: Arc::new(|doc| vec![(doc["_id"].clone(), Value::Null)]),
                reduce: None,
            })
        }));
        db.put(Some("a"), json!({}), None, false).unwrap();

        let mut request = RouterRequest::new(Method::POST, "/db/_temp_view", "");
        request.body = bytes::Bytes::from(
            serde_json::to_vec(&json!({"map": "function(doc) { emit(doc._id, null); }"}))
                .unwrap(),
        );
        let response = temp_view(&db, &request).unwrap();
        let super::super::ResponseBody::Json(body) = response.body else {
            panic!("expected JSON")
        };
        assert_eq!(body["rows"].as_array().unwrap().len(), 1);
    }
}
