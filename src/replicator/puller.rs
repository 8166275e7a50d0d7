// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull direction: remote changes in to the local store.
//!
//! A feed task reads the remote `_changes` feed — paged `normal` requests
//! for a one-shot pull, a continuous NDJSON stream otherwise — and hands
//! rows to the driver, which expands them into per-revision inbox items.
//! Each inbox batch:
//!
//! 1. Filter out revisions the local store already has
//!    (`find_missing_revisions`).
//! 2. Fetch each genuinely new revision singly, with inline attachments
//!    and its full `_revisions` history.
//! 3. `force_insert` it, tagged with the peer URL so a pusher running the
//!    other way does not echo it straight back.

use super::{Command, InboxOutcome};
use crate::config::ReplicatorOptions;
use crate::error::{EngineError, Status};
use crate::metrics;
use crate::remote::{ChangesFeedRequest, Feed, Peer};
use crate::revision::{Revision, RevisionList};
use crate::store::Database;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) fn feed_request(
    since: u64,
    continuous: bool,
    limit: usize,
    options: &ReplicatorOptions,
) -> ChangesFeedRequest {
    ChangesFeedRequest {
        since,
        limit,
        feed: if continuous {
            Feed::Continuous
        } else {
            Feed::Normal
        },
        filter: options.filter.clone(),
        filter_params: options.query_params.clone(),
    }
}

/// Spawn the feed task. One-shot: page through `normal` responses until a
/// short page, then report `CaughtUp`. Continuous: decode the NDJSON
/// stream row by row until the connection drops.
pub(crate) fn spawn_feed(
    peer: Arc<dyn Peer>,
    request: ChangesFeedRequest,
    continuous: bool,
    tx: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if continuous {
            run_continuous_feed(peer, request, tx).await;
        } else {
            run_normal_feed(peer, request, tx).await;
        }
    })
}

async fn run_normal_feed(
    peer: Arc<dyn Peer>,
    mut request: ChangesFeedRequest,
    tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        match peer.changes_once(&request).await {
            Ok(page) => {
                let caught_up = request.limit == 0 || page.rows.len() < request.limit;
                debug!(
                    rows = page.rows.len(),
                    last_seq = page.last_seq,
                    caught_up,
                    "Pulled changes page"
                );
                if !page.rows.is_empty() && tx.send(Command::RemoteRows(page.rows)).is_err() {
                    return;
                }
                if caught_up {
                    let _ = tx.send(Command::CaughtUp);
                    return;
                }
                request.since = page.last_seq;
            }
            Err(err) => {
                let _ = tx.send(Command::FeedFailed(err));
                return;
            }
        }
    }
}

async fn run_continuous_feed(
    peer: Arc<dyn Peer>,
    request: ChangesFeedRequest,
    tx: mpsc::UnboundedSender<Command>,
) {
    let mut stream = match peer.changes_stream(&request).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = tx.send(Command::FeedFailed(err));
            return;
        }
    };
    while let Some(item) = stream.next().await {
        match item {
            Ok(row) => {
                if tx.send(Command::RemoteRows(vec![row])).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Command::FeedFailed(err));
                return;
            }
        }
    }
    // A continuous feed should only end when we are being torn down; if the
    // remote closed it, surface that so the retry cycle reconnects.
    let _ = tx.send(Command::FeedFailed(EngineError::with_reason(
        Status::Network,
        "continuous changes feed closed",
    )));
}

/// Apply one batch of remote revisions. Revisions already known locally
/// complete immediately; the rest are fetched and grafted in.
pub(crate) async fn process_inbox(
    db: Arc<dyn Database>,
    peer: Arc<dyn Peer>,
    batch: Vec<Revision>,
) -> InboxOutcome {
    let mut outcome = InboxOutcome::default();
    let mut per_seq: HashMap<u64, SeqState> = HashMap::new();
    for revision in &batch {
        per_seq.entry(revision.sequence_or_zero()).or_default().total += 1;
    }

    let mut missing = RevisionList::from(batch.clone());
    db.find_missing_revisions(&mut missing);

    // Already present locally: acknowledged without a fetch.
    for revision in &batch {
        if !missing.contains(revision) {
            per_seq
                .entry(revision.sequence_or_zero())
                .or_default()
                .done += 1;
            outcome.processed += 1;
        }
    }

    let mut pulled = 0usize;
    let mut cancelled = false;
    for revision in missing.iter() {
        let state = per_seq.entry(revision.sequence_or_zero()).or_default();
        if cancelled {
            state.failed += 1;
            continue;
        }
        match peer
            .get_document_with_history(&revision.doc_id, &revision.rev_id)
            .await
        {
            Ok((body, history)) => {
                let deleted = revision.deleted
                    || body
                        .get("_deleted")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                let incoming = Revision {
                    doc_id: revision.doc_id.clone(),
                    rev_id: revision.rev_id.clone(),
                    deleted,
                    sequence: None,
                    body: Some(body),
                };
                match db.force_insert(&incoming, &history, Some(peer.url())) {
                    Ok(()) => {
                        state.done += 1;
                        outcome.processed += 1;
                        pulled += 1;
                    }
                    Err(err) => {
                        warn!(
                            doc_id = %revision.doc_id,
                            rev_id = %revision.rev_id,
                            error = %err,
                            "Could not insert pulled revision"
                        );
                        state.failed += 1;
                        outcome.failed += 1;
                    }
                }
            }
            Err(err) if err.is_cancelled() => {
                state.failed += 1;
                cancelled = true;
            }
            Err(err) => {
                warn!(
                    doc_id = %revision.doc_id,
                    rev_id = %revision.rev_id,
                    error = %err,
                    "Could not fetch revision"
                );
                state.failed += 1;
                outcome.failed += 1;
                if outcome.error.is_none() {
                    outcome.error = Some(err);
                }
            }
        }
    }
    metrics::record_revs_pulled(peer.url(), pulled);

    for (seq, state) in per_seq {
        if state.failed > 0 || state.done < state.total {
            outcome.failed_sequences.push(seq);
        } else {
            outcome.completed_sequences.push(seq);
        }
    }
    outcome.completed_sequences.sort_unstable();
    outcome.failed_sequences.sort_unstable();
    outcome
}

#[derive(Default)]
struct SeqState {
    total: u32,
    done: u32,
    failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use crate::remote::LocalPeer;
    use serde_json::json;

    fn stub(doc: &str, rev: &str, seq: u64) -> Revision {
        Revision::new(doc, rev).at_sequence(seq)
    }

    #[tokio::test]
    async fn test_process_inbox_pulls_missing() {
        let remote = Arc::new(MemoryDatabase::new("remote"));
        remote.put(Some("a"), json!({"n": 1}), None, false).unwrap();
        let rev_a = remote.get_document("a", None).unwrap();

        let local = Arc::new(MemoryDatabase::new("local"));
        let peer = Arc::new(LocalPeer::new(Arc::clone(&remote) as Arc<dyn Database>));

        let outcome = process_inbox(
            Arc::clone(&local) as Arc<dyn Database>,
            peer,
            vec![stub("a", &rev_a.rev_id, 1)],
        )
        .await;
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.completed_sequences, vec![1]);

        let pulled = local.get_document("a", None).unwrap();
        assert_eq!(pulled.rev_id, rev_a.rev_id);
        assert_eq!(pulled.body.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn test_known_revisions_complete_without_fetch() {
        let remote = Arc::new(MemoryDatabase::new("remote"));
        remote.put(Some("a"), json!({}), None, false).unwrap();
        let rev_a = remote.get_document("a", None).unwrap();

        let local = Arc::new(MemoryDatabase::new("local"));
        local
            .force_insert(
                &Revision::with_body("a", rev_a.rev_id.clone(), json!({})),
                &[rev_a.rev_id.clone()],
                None,
            )
            .unwrap();
        let peer = Arc::new(LocalPeer::new(Arc::clone(&remote) as Arc<dyn Database>));

        let outcome = process_inbox(
            Arc::clone(&local) as Arc<dyn Database>,
            peer,
            vec![stub("a", &rev_a.rev_id, 1)],
        )
        .await;
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.completed_sequences, vec![1]);
    }

    #[tokio::test]
    async fn test_pull_tags_change_source_for_echo_suppression() {
        let remote = Arc::new(MemoryDatabase::new("remote"));
        remote.put(Some("a"), json!({}), None, false).unwrap();
        let rev_a = remote.get_document("a", None).unwrap();

        let local = Arc::new(MemoryDatabase::new("local"));
        let mut changes = local.changes_broker().subscribe();
        let peer = Arc::new(LocalPeer::new(Arc::clone(&remote) as Arc<dyn Database>));
        let peer_url = peer.url().to_string();

        process_inbox(
            Arc::clone(&local) as Arc<dyn Database>,
            peer,
            vec![stub("a", &rev_a.rev_id, 1)],
        )
        .await;

        let event = changes.try_recv().unwrap();
        assert_eq!(event.source.as_deref(), Some(peer_url.as_str()));
    }

    #[tokio::test]
    async fn test_missing_remote_revision_counts_failed() {
        let remote = Arc::new(MemoryDatabase::new("remote"));
        let local = Arc::new(MemoryDatabase::new("local"));
        let peer = Arc::new(LocalPeer::new(Arc::clone(&remote) as Arc<dyn Database>));

        let outcome = process_inbox(
            Arc::clone(&local) as Arc<dyn Database>,
            peer,
            vec![stub("ghost", "1-gone", 3)],
        )
        .await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.failed_sequences, vec![3]);
        assert!(outcome.completed_sequences.is_empty());
    }

    #[tokio::test]
    async fn test_normal_feed_pages_until_short_page() {
        let remote = Arc::new(MemoryDatabase::new("remote"));
        for i in 0..5 {
            remote
                .put(Some(&format!("doc{}", i)), json!({"i": i}), None, false)
                .unwrap();
        }
        let peer: Arc<dyn Peer> =
            Arc::new(LocalPeer::new(Arc::clone(&remote) as Arc<dyn Database>));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = ChangesFeedRequest {
            since: 0,
            limit: 2,
            feed: Feed::Normal,
            filter: None,
            filter_params: None,
        };
        spawn_feed(peer, request, false, tx).await.unwrap();

        let mut rows = 0;
        let mut caught_up = false;
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::RemoteRows(batch) => rows += batch.len(),
                Command::CaughtUp => caught_up = true,
                _ => panic!("unexpected command"),
            }
        }
        assert_eq!(rows, 5);
        assert!(caught_up);
    }
}
