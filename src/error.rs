// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Everything user-visible funnels through a single [`Status`] kind with a
//! deterministic HTTP mapping, plus an optional reason string carried by
//! [`EngineError`]. Handlers return a `Status`; the router maps non-2xx
//! statuses to a JSON envelope `{"error": ..., "reason": ...}` at the
//! response boundary.
//!
//! # Status Categories
//!
//! | Status | HTTP | Description |
//! |--------|------|-------------|
//! | `BadRequest`/`BadJson`/`BadParam`/`BadId`/`BadAttachment` | 400 | Malformed input |
//! | `Unauthorized` | 401 | Missing or rejected credentials |
//! | `Forbidden` | 403 | Rejected by a validation function |
//! | `NotFound`/`Deleted` | 404 | Absent or tombstoned resource |
//! | `MethodNotAllowed` | 405 | Known path, unsupported verb |
//! | `Conflict` | 409 | Revision conflict on update |
//! | `Duplicate` | 412 | Resource already exists (e.g. PUT /db twice) |
//! | `UnsupportedType` | 415 | Unusable Content-Type |
//! | `ServerError` | 500 | Internal failure |
//! | `Cancelled` | 500 | Request aborted; swallowed during `stop()` |
//! | `Network` | 502 | Remote peer unreachable or misbehaving |
//!
//! # Transient Errors
//!
//! Use [`EngineError::is_transient()`] to decide whether the replicator
//! should count a failure toward its retry cycle. `Cancelled` is neither
//! transient nor fatal: it is the expected shape of an aborted in-flight
//! request and is dropped silently.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Protocol status kinds, covering both success and failure outcomes.
///
/// Handlers produce these directly; the HTTP boundary renders them with
/// [`Status::http_code()`] and [`Status::error_string()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 200.
    Ok,
    /// 201, with a `Location` header where applicable.
    Created,
    /// 202, returned by deferred work such as `_compact`.
    Accepted,
    /// 304, conditional GET matched the current ETag.
    NotModified,
    /// Generic malformed request.
    BadRequest,
    /// Body failed to parse as JSON.
    BadJson,
    /// A query parameter had an unusable value.
    BadParam,
    /// Invalid database or document identifier.
    BadId,
    /// Attachment data missing or undecodable.
    BadAttachment,
    /// Credentials missing or rejected.
    Unauthorized,
    /// Operation rejected by policy.
    Forbidden,
    /// Resource does not exist.
    NotFound,
    /// Resource exists but its current revision is a deletion.
    Deleted,
    /// Known path, unsupported method.
    MethodNotAllowed,
    /// Revision conflict on update.
    Conflict,
    /// Resource already exists.
    Duplicate,
    /// Unsupported media type.
    UnsupportedType,
    /// Internal failure.
    ServerError,
    /// In-flight work aborted by `stop()` or connection close.
    Cancelled,
    /// Remote peer unreachable, timed out, or returned garbage.
    Network,
}

impl Status {
    /// Deterministic HTTP status code for this kind.
    pub fn http_code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::Accepted => 202,
            Status::NotModified => 304,
            Status::BadRequest
            | Status::BadJson
            | Status::BadParam
            | Status::BadId
            | Status::BadAttachment => 400,
            Status::Unauthorized => 401,
            Status::Forbidden => 403,
            Status::NotFound | Status::Deleted => 404,
            Status::MethodNotAllowed => 405,
            Status::Conflict => 409,
            Status::Duplicate => 412,
            Status::UnsupportedType => 415,
            Status::ServerError | Status::Cancelled => 500,
            Status::Network => 502,
        }
    }

    /// The `error` field of the JSON error envelope, CouchDB-flavored.
    pub fn error_string(&self) -> &'static str {
        match self {
            Status::Ok | Status::Created | Status::Accepted | Status::NotModified => "ok",
            Status::BadRequest => "bad_request",
            Status::BadJson => "bad_request",
            Status::BadParam => "query_parse_error",
            Status::BadId => "illegal_docid",
            Status::BadAttachment => "bad_attachment",
            Status::Unauthorized => "unauthorized",
            Status::Forbidden => "forbidden",
            Status::NotFound => "not_found",
            Status::Deleted => "not_found",
            Status::MethodNotAllowed => "method_not_allowed",
            Status::Conflict => "conflict",
            Status::Duplicate => "file_exists",
            Status::UnsupportedType => "bad_content_type",
            Status::ServerError => "internal_server_error",
            Status::Cancelled => "cancelled",
            Status::Network => "network_error",
        }
    }

    /// Default `reason` text when the error carries none of its own.
    pub fn default_reason(&self) -> &'static str {
        match self {
            Status::Deleted => "deleted",
            Status::NotFound => "missing",
            Status::Duplicate => "The database could not be created, the file already exists.",
            _ => self.error_string(),
        }
    }

    /// Whether this status is a success (2xx or 304).
    pub fn is_success(&self) -> bool {
        let code = self.http_code();
        (200..400).contains(&code)
    }

    /// Map an HTTP status code received from a remote peer back to a kind.
    pub fn from_http(code: u16) -> Status {
        match code {
            200 => Status::Ok,
            201 => Status::Created,
            202 => Status::Accepted,
            304 => Status::NotModified,
            400 => Status::BadRequest,
            401 => Status::Unauthorized,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            405 => Status::MethodNotAllowed,
            409 => Status::Conflict,
            412 => Status::Duplicate,
            415 => Status::UnsupportedType,
            500..=599 => Status::ServerError,
            _ => Status::Network,
        }
    }
}

/// An error with a status kind and an optional human-readable reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status:?} ({}): {}", self.status.http_code(), self.reason())]
pub struct EngineError {
    /// The status kind; maps deterministically to an HTTP code.
    pub status: Status,
    /// Optional context (e.g. which parameter was bad).
    pub reason: Option<String>,
}

impl EngineError {
    /// Create an error with no extra reason.
    pub fn new(status: Status) -> Self {
        Self { status, reason: None }
    }

    /// Create an error with a reason string.
    pub fn with_reason(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
        }
    }

    /// The reason, falling back to the status default.
    pub fn reason(&self) -> &str {
        match &self.reason {
            Some(r) => r.as_str(),
            None => self.status.default_reason(),
        }
    }

    /// Whether a retry cycle could plausibly clear this error.
    pub fn is_transient(&self) -> bool {
        matches!(self.status, Status::Network | Status::ServerError)
    }

    /// Whether this is a cancellation (expected during `stop()`, never
    /// reported as a replication failure).
    pub fn is_cancelled(&self) -> bool {
        self.status == Status::Cancelled
    }
}

impl From<Status> for EngineError {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::with_reason(Status::BadJson, e.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(code) = e.status() {
            Self::with_reason(Status::from_http(code.as_u16()), e.to_string())
        } else {
            Self::with_reason(Status::Network, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping_is_deterministic() {
        assert_eq!(Status::Ok.http_code(), 200);
        assert_eq!(Status::Created.http_code(), 201);
        assert_eq!(Status::Accepted.http_code(), 202);
        assert_eq!(Status::NotModified.http_code(), 304);
        assert_eq!(Status::BadJson.http_code(), 400);
        assert_eq!(Status::BadId.http_code(), 400);
        assert_eq!(Status::Unauthorized.http_code(), 401);
        assert_eq!(Status::NotFound.http_code(), 404);
        assert_eq!(Status::Deleted.http_code(), 404);
        assert_eq!(Status::MethodNotAllowed.http_code(), 405);
        assert_eq!(Status::Conflict.http_code(), 409);
        assert_eq!(Status::Duplicate.http_code(), 412);
        assert_eq!(Status::UnsupportedType.http_code(), 415);
        assert_eq!(Status::ServerError.http_code(), 500);
        assert_eq!(Status::Network.http_code(), 502);
    }

    #[test]
    fn test_deleted_reports_not_found_envelope() {
        // A tombstoned doc reads as 404/"not_found" with reason "deleted".
        let err = EngineError::new(Status::Deleted);
        assert_eq!(err.status.http_code(), 404);
        assert_eq!(err.status.error_string(), "not_found");
        assert_eq!(err.reason(), "deleted");
    }

    #[test]
    fn test_is_transient() {
        assert!(EngineError::new(Status::Network).is_transient());
        assert!(EngineError::new(Status::ServerError).is_transient());
        assert!(!EngineError::new(Status::Conflict).is_transient());
        assert!(!EngineError::new(Status::Cancelled).is_transient());
        assert!(!EngineError::new(Status::NotFound).is_transient());
    }

    #[test]
    fn test_cancelled_is_not_a_failure() {
        let err = EngineError::new(Status::Cancelled);
        assert!(err.is_cancelled());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_reason_falls_back_to_default() {
        let err = EngineError::new(Status::NotFound);
        assert_eq!(err.reason(), "missing");

        let err = EngineError::with_reason(Status::NotFound, "no such database");
        assert_eq!(err.reason(), "no such database");
    }

    #[test]
    fn test_from_http_round_trip() {
        for status in [
            Status::Ok,
            Status::Created,
            Status::NotModified,
            Status::Unauthorized,
            Status::NotFound,
            Status::Conflict,
            Status::Duplicate,
        ] {
            assert_eq!(Status::from_http(status.http_code()), status);
        }
    }

    #[test]
    fn test_from_http_unknown_code_is_network() {
        assert_eq!(Status::from_http(0), Status::Network);
        assert_eq!(Status::from_http(302), Status::Network);
    }

    #[test]
    fn test_bad_json_from_serde() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: EngineError = parse_err.into();
        assert_eq!(err.status, Status::BadJson);
    }

    #[test]
    fn test_success_predicate() {
        assert!(Status::Ok.is_success());
        assert!(Status::Created.is_success());
        assert!(Status::NotModified.is_success());
        assert!(!Status::NotFound.is_success());
        assert!(!Status::ServerError.is_success());
    }
}
