//! Endpoint-level integration tests for the REST façade.
//!
//! These exercise the full axum router using tower::ServiceExt::oneshot()
//! without binding a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use davenport::{http_router, Engine};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn app(engine: &Arc<Engine>) -> axum::Router {
    http_router(Arc::clone(engine))
}

async fn body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn put_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_root_welcome() {
    let engine = Engine::for_testing();
    let resp = app(&engine).oneshot(get("/")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["couchdb"], "Welcome");
    assert_eq!(body["CouchbaseLite"], "Welcome");
    assert!(body["version"].as_str().is_some());
}

#[tokio::test]
async fn test_db_lifecycle() {
    let engine = Engine::for_testing();

    let resp = app(&engine).oneshot(put_empty("/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(
        resp.headers().get("location").unwrap().to_str().unwrap(),
        "/db"
    );

    // Creating it again is 412.
    let resp = app(&engine).oneshot(put_empty("/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["error"], "file_exists");

    let resp = app(&engine).oneshot(get("/_all_dbs")).await.unwrap();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body, json!(["db"]));

    let resp = app(&engine).oneshot(get("/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["db_name"], "db");
    assert_eq!(body["doc_count"], 0);
    assert_eq!(body["update_seq"], 0);
    assert!(body["db_uuid"].as_str().is_some());

    // DELETE with ?rev= is the document-delete typo guard.
    let resp = app(&engine).oneshot(delete("/db?rev=1-x")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app(&engine).oneshot(delete("/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app(&engine).oneshot(delete("/db")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_paths_and_methods() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine).oneshot(get("/_bogus")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app(&engine)
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/db/_changes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // Reserved doc ID.
    let resp = app(&engine).oneshot(get("/db/_reserved")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["error"], "illegal_docid");
}

#[tokio::test]
async fn test_uuids_boundaries() {
    let engine = Engine::for_testing();

    let resp = app(&engine).oneshot(get("/_uuids")).await.unwrap();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["uuids"].as_array().unwrap().len(), 1);

    let resp = app(&engine).oneshot(get("/_uuids?count=0")).await.unwrap();
    let body = body_json(resp.into_body()).await;
    assert!(body["uuids"].as_array().unwrap().is_empty());

    let resp = app(&engine)
        .oneshot(get("/_uuids?count=10000"))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["uuids"].as_array().unwrap().len(), 1000);
}

#[tokio::test]
async fn test_document_crud_over_http() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine)
        .oneshot(put("/db/doc1", json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = resp
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body = body_json(resp.into_body()).await;
    let rev = body["rev"].as_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{}\"", rev));
    assert!(rev.starts_with("1-"));

    // Conditional GET.
    let resp = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/db/doc1")
                .header("if-none-match", etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

    // Update against the old rev conflicts.
    let resp = app(&engine)
        .oneshot(put("/db/doc1", json!({"x": 2, "_rev": "1-bogus"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Update, delete.
    let resp = app(&engine)
        .oneshot(put(&format!("/db/doc1?rev={}", rev), json!({"x": 2})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp.into_body()).await;
    let rev2 = body["rev"].as_str().unwrap().to_string();
    assert!(rev2.starts_with("2-"));

    let resp = app(&engine)
        .oneshot(delete(&format!("/db/doc1?rev={}", rev2)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app(&engine).oneshot(get("/db/doc1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["reason"], "deleted");
}

#[tokio::test]
async fn test_post_doc_assigns_id() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine)
        .oneshot(post("/db", json!({"payload": true})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["id"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn test_bulk_docs_scenario() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine)
        .oneshot(post(
            "/db/_bulk_docs",
            json!({"docs": [{"_id": "a", "x": 1}, {"_id": "b", "x": 2}]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp.into_body()).await;
    let results = body.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["id"], "a");
    assert_eq!(results[0]["ok"], true);
    assert!(results[0]["rev"].as_str().unwrap().starts_with("1-"));
    assert_eq!(results[1]["id"], "b");

    // Follow-on: the changes feed lists both in commit order.
    let resp = app(&engine)
        .oneshot(get("/db/_changes?since=0"))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    let changes = body["results"].as_array().unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0]["seq"], 1);
    assert_eq!(changes[0]["id"], "a");
    assert!(changes[0]["changes"][0]["rev"]
        .as_str()
        .unwrap()
        .starts_with("1-"));
    assert_eq!(changes[1]["seq"], 2);
    assert_eq!(changes[1]["id"], "b");
    assert_eq!(body["last_seq"], 2);
}

#[tokio::test]
async fn test_revs_diff_scenario() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    // Insert 1-x for doc "a".
    let resp = app(&engine)
        .oneshot(post(
            "/db/_bulk_docs",
            json!({"new_edits": false, "docs": [{"_id": "a", "_rev": "1-x", "v": 1}]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app(&engine)
        .oneshot(post("/db/_revs_diff", json!({"a": ["1-x", "2-y"]})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["a"]["missing"], json!(["2-y"]));
    assert_eq!(body["a"]["possible_ancestors"], json!(["1-x"]));
}

#[tokio::test]
async fn test_all_docs() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();
    for id in ["c", "a", "b"] {
        app(&engine)
            .oneshot(put(&format!("/db/{}", id), json!({})))
            .await
            .unwrap();
    }

    let resp = app(&engine).oneshot(get("/db/_all_docs")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let etag = resp.headers().get("etag").cloned();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["total_rows"], 3);
    let ids: Vec<&str> = body["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    // limit=0 keeps total_rows intact.
    let resp = app(&engine)
        .oneshot(get("/db/_all_docs?limit=0"))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    assert!(body["rows"].as_array().unwrap().is_empty());
    assert_eq!(body["total_rows"], 3);

    // ETag is stable while the database does not change.
    let etag = etag.unwrap();
    let resp = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/db/_all_docs")
                .header("if-none-match", etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);

    // POST with keys reports missing entries.
    let resp = app(&engine)
        .oneshot(post("/db/_all_docs", json!({"keys": ["a", "ghost"]})))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    let rows = body["rows"].as_array().unwrap();
    assert_eq!(rows[0]["id"], "a");
    assert_eq!(rows[1]["value"]["error"], "not_found");
}

#[tokio::test]
async fn test_purge_and_compact() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();
    let resp = app(&engine)
        .oneshot(put("/db/doc1", json!({})))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    let rev = body["rev"].as_str().unwrap().to_string();

    let resp = app(&engine)
        .oneshot(post("/db/_compact", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let resp = app(&engine)
        .oneshot(post("/db/_purge", json!({"doc1": [rev.clone()]})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["purged"]["doc1"], json!([rev]));

    let resp = app(&engine).oneshot(get("/db/doc1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_local_docs_bypass_revision_tree() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine)
        .oneshot(put("/db/_local/checkpoint", json!({"lastSequence": "9"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["rev"], "0-1");

    let resp = app(&engine)
        .oneshot(get("/db/_local/checkpoint"))
        .await
        .unwrap();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["_id"], "_local/checkpoint");
    assert_eq!(body["lastSequence"], "9");

    // Local docs never appear in _changes.
    let resp = app(&engine).oneshot(get("/db/_changes")).await.unwrap();
    let body = body_json(resp.into_body()).await;
    assert!(body["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_replicate_cancel_without_match_is_404() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();
    let resp = app(&engine)
        .oneshot(post(
            "/_replicate",
            json!({"source": "db", "target": "http://peer/db", "cancel": true}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_active_tasks_snapshot_empty() {
    let engine = Engine::for_testing();
    let resp = app(&engine).oneshot(get("/_active_tasks")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_endpoints() {
    let engine = Engine::for_testing();
    let resp = app(&engine).oneshot(get("/_session")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert!(body["userCtx"]["name"].is_null());

    let resp = app(&engine)
        .oneshot(post("/_session", json!({"name": "bob", "password": "pw"})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("set-cookie").is_some());
}

#[tokio::test]
async fn test_attachment_over_http() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let payload: &[u8] = b"attachment body bytes";
    let resp = app(&engine)
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/db/doc1/file.txt")
                .header("content-type", "text/plain")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = app(&engine).oneshot(get("/db/doc1/file.txt")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/plain"
    );
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], payload);

    // Multipart GET round-trips the same bytes.
    let resp = app(&engine)
        .oneshot(
            Request::builder()
                .uri("/db/doc1?attachments=true")
                .header("accept", "multipart/related")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("multipart/related"));
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let haystack = bytes.as_ref();
    assert!(haystack
        .windows(payload.len())
        .any(|window| window == payload));
}

#[tokio::test]
async fn test_bulk_docs_all_or_nothing_is_atomic() {
    let engine = Engine::for_testing();
    engine.create_database("db").unwrap();

    let resp = app(&engine)
        .oneshot(post(
            "/db/_bulk_docs",
            json!({
                "all_or_nothing": true,
                "docs": [
                    {"_id": "good"},
                    {"_id": "bad", "_rev": "1-void"},
                ]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = app(&engine).oneshot(get("/db")).await.unwrap();
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["doc_count"], 0);
}

#[tokio::test]
async fn test_error_envelope_shape() {
    let engine = Engine::for_testing();
    let resp = app(&engine).oneshot(get("/missing")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = body_json(resp.into_body()).await;
    assert_eq!(body["error"], "not_found");
    assert!(body["reason"].as_str().is_some());
}
