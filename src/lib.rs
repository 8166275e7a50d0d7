// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Davenport
//!
//! An embedded document-sync engine: a CouchDB-compatible REST façade over
//! a pluggable local document store, plus a bidirectional replicator that
//! keeps that store in sync with remote peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              davenport                               │
//! │                                                                      │
//! │  HTTP ──▶ router (dispatch + handlers) ──▶ Database trait ──▶ store  │
//! │                │                              ▲        │             │
//! │                ├── _changes feeds ◀── ChangeBroker ◀───┘             │
//! │                └── _replicate ──▶ Engine ──▶ Replicator              │
//! │                                               │  batcher ▸ inbox    │
//! │                                               │  checkpoints ▸ retry │
//! │                                               ▼                      │
//! │                                   Peer (HTTP or in-process)          │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The storage engine is an external collaborator behind the
//! [`store::Database`] trait; [`memory::MemoryDatabase`] is the bundled
//! in-memory reference implementation. Filter and view functions belong to
//! an embedded scripting runtime, surfaced through the same trait.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use davenport::{Engine, http_router};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::in_memory();
//!     engine.create_database("notes").unwrap();
//!
//!     let app = http_router(engine);
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:5984")
//!         .await
//!         .unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

pub mod auth;
pub mod batcher;
pub mod changes;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod reachability;
pub mod remote;
pub mod replicator;
pub mod revision;
pub mod router;
pub mod store;

// Re-exports for convenience
pub use config::{EngineConfig, ReplicatorOptions};
pub use engine::Engine;
pub use error::{EngineError, Result, Status};
pub use memory::{MemoryDatabase, MemoryDatabaseFactory};
pub use replicator::{ReplicatorHandle, ReplicatorStatus};
pub use revision::{Revision, RevisionList};
pub use router::{dispatch, http_router, RouterRequest, RouterResponse};
pub use store::{ChangesOptions, Database, QueryOptions};
