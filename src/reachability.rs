// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host reachability watching.
//!
//! The replicator ties its online/offline state machine to whether the
//! remote host is reachable: `Reachable` drives `go_online`, a known
//! `Unreachable` drives `go_offline` (cancelling in-flight requests), and
//! `Unknown` changes nothing. Local-to-local replication skips the watcher
//! entirely and goes online immediately.
//!
//! The probe itself is pluggable. The default [`TcpProbe`] attempts a TCP
//! connect with a short timeout on an interval; tests script transitions
//! with a [`watch`] channel of their own.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Observed reachability of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    /// Not yet determined; no transition is derived from this.
    #[default]
    Unknown,
    /// Host answered a probe.
    Reachable,
    /// Host is known unreachable.
    Unreachable,
}

/// A single reachability check for `host:port`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// Default probe: TCP connect with a 3 second timeout.
pub struct TcpProbe;

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        let address = format!("{}:{}", host, port);
        matches!(
            tokio::time::timeout(
                Duration::from_secs(3),
                tokio::net::TcpStream::connect(&address),
            )
            .await,
            Ok(Ok(_))
        )
    }
}

/// Periodically probes a host and publishes transitions.
pub struct ReachabilityWatcher {
    rx: watch::Receiver<Reachability>,
    handle: JoinHandle<()>,
}

impl ReachabilityWatcher {
    /// Start watching `host:port`, probing every `interval`.
    pub fn start(
        host: String,
        port: u16,
        interval: Duration,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let (tx, rx) = watch::channel(Reachability::Unknown);

        let handle = tokio::spawn(async move {
            info!(host = %host, port, "Reachability watcher started");
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let state = if probe.probe(&host, port).await {
                    Reachability::Reachable
                } else {
                    Reachability::Unreachable
                };
                // send_if_modified: subscribers only wake on transitions.
                let changed = tx.send_if_modified(|current| {
                    if *current != state {
                        *current = state;
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    debug!(host = %host, ?state, "Reachability transition");
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        Self { rx, handle }
    }

    /// A watcher fed by an external channel (tests, platform integrations).
    pub fn from_channel(rx: watch::Receiver<Reachability>) -> Self {
        // Parked task so stop() has something to abort uniformly.
        let handle = tokio::spawn(std::future::pending());
        Self { rx, handle }
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.rx.clone()
    }

    /// Current state.
    pub fn current(&self) -> Reachability {
        *self.rx.borrow()
    }

    /// Stop probing.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for ReachabilityWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProbe {
        results: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ReachabilityProbe for ScriptedProbe {
        async fn probe(&self, _host: &str, _port: u16) -> bool {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                *results.first().unwrap_or(&false)
            }
        }
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let probe = Arc::new(ScriptedProbe {
            results: std::sync::Mutex::new(vec![true, true, false]),
        });
        let watcher = ReachabilityWatcher::start(
            "peer.test".into(),
            5984,
            Duration::from_millis(5),
            probe,
        );
        let mut rx = watcher.subscribe();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Reachability::Reachable);

        // Second `true` probe is not a transition; next change is the drop.
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Reachability::Unreachable);

        watcher.stop();
    }

    #[tokio::test]
    async fn test_initial_state_is_unknown() {
        let (_tx, rx) = watch::channel(Reachability::Unknown);
        let watcher = ReachabilityWatcher::from_channel(rx);
        assert_eq!(watcher.current(), Reachability::Unknown);
    }

    #[tokio::test]
    async fn test_scripted_channel_watcher() {
        let (tx, rx) = watch::channel(Reachability::Unknown);
        let watcher = ReachabilityWatcher::from_channel(rx);
        let mut sub = watcher.subscribe();

        tx.send(Reachability::Reachable).unwrap();
        sub.changed().await.unwrap();
        assert_eq!(*sub.borrow(), Reachability::Reachable);
    }
}
