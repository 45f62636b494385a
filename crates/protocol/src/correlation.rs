//! Request/reply correlation.
//!
//! Every outbound request takes the next id from a per-connection counter and
//! parks a oneshot sender in [`PendingRequests`]. Inbound replies and
//! id-carrying errors complete the matching entry; everything else is handed
//! to the application.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{ProtocolError, Result};
use crate::messages::{Envelope, MessageKind};

/// Outcome delivered to a waiting request.
pub type RequestOutcome = Result<Envelope>;

/// Where an inbound envelope went.
#[derive(Debug)]
pub enum Dispatch {
    /// Completed the pending request with this id.
    Resolved(u64),
    /// Reply or error for an id nobody is waiting on. Dropped.
    Unmatched(Option<u64>),
    /// Not a correlated message; for the application handler.
    Inbound(Envelope),
}

/// Table of requests awaiting a reply.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: DashMap<u64, oneshot::Sender<RequestOutcome>>,
}

impl PendingRequests {
    /// Creates an empty table whose first id is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves an id and registers a waiter for it.
    pub fn register(&self) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id, tx);
        (id, rx)
    }

    /// Completes the request with `id`. Returns false if nothing was waiting.
    pub fn resolve(&self, id: u64, outcome: RequestOutcome) -> bool {
        match self.waiting.remove(&id) {
            // The receiver may already be gone if the caller timed out.
            Some((_, tx)) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forgets a request without completing it.
    pub fn cancel(&self, id: u64) -> bool {
        self.waiting.remove(&id).is_some()
    }

    /// Completes every outstanding request with an error built by `error`.
    pub fn fail_all(&self, error: impl Fn() -> ProtocolError) -> usize {
        let ids: Vec<u64> = self.waiting.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(error())))
            .count()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Returns true if no request is outstanding.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Routes an inbound envelope.
    ///
    /// A `Reply`, or an `Error` with an id, completes the pending request of
    /// that id. Replies without an id are unmatched by definition.
    pub fn dispatch(&self, envelope: Envelope) -> Dispatch {
        let correlated = matches!(envelope.kind, MessageKind::Reply)
            || (envelope.kind == MessageKind::Error && envelope.id.is_some());
        if !correlated {
            return Dispatch::Inbound(envelope);
        }

        match envelope.correlation_id() {
            Some(id) => {
                if self.resolve(id, Ok(envelope)) {
                    Dispatch::Resolved(id)
                } else {
                    let error = ProtocolError::UnknownCorrelationId(id);
                    tracing::warn!(%error, "dropping reply");
                    Dispatch::Unmatched(Some(id))
                }
            }
            None => {
                tracing::warn!(endpoint = %envelope.endpoint, "dropping reply without id");
                Dispatch::Unmatched(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_sequential_from_zero() {
        let pending = PendingRequests::new();
        let ids: Vec<u64> = (0..5).map(|_| pending.next_id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let pending = std::sync::Arc::new(PendingRequests::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pending = pending.clone();
                std::thread::spawn(move || (0..100).map(|_| pending.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..400).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reply_resolves_pending() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();

        let reply = Envelope::reply(id, "echo", json!({"x": 1}));
        assert!(matches!(pending.dispatch(reply.clone()), Dispatch::Resolved(i) if i == id));
        assert_eq!(rx.await.unwrap().unwrap(), reply);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_with_id_resolves_pending() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register();

        let error = Envelope::error(Some(id), "echo", 500, None);
        assert!(matches!(pending.dispatch(error), Dispatch::Resolved(_)));
        let envelope = rx.await.unwrap().unwrap();
        assert_eq!(envelope.kind, MessageKind::Error);
        assert_eq!(envelope.code, Some(500));
    }

    #[test]
    fn test_unknown_id_is_dropped() {
        let pending = PendingRequests::new();
        let _waiting = pending.register();

        let stray = Envelope::reply(99, "echo", json!(null));
        assert!(matches!(pending.dispatch(stray), Dispatch::Unmatched(Some(99))));
        // The real request is still waiting
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_reply_without_id_is_dropped() {
        let pending = PendingRequests::new();
        let mut reply = Envelope::reply(0, "echo", json!(null));
        reply.id = None;
        assert!(matches!(pending.dispatch(reply), Dispatch::Unmatched(None)));
    }

    #[test]
    fn test_uncorrelated_kinds_are_inbound() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register();

        // A request that happens to reuse a pending id is still inbound
        let request = Envelope::request(id, "echo", json!(1));
        assert!(matches!(pending.dispatch(request), Dispatch::Inbound(_)));
        assert!(matches!(
            pending.dispatch(Envelope::push("news", json!(1))),
            Dispatch::Inbound(_)
        ));
        assert!(matches!(
            pending.dispatch(Envelope::error(None, "echo", 1, None)),
            Dispatch::Inbound(_)
        ));
        assert!(matches!(
            pending.dispatch(Envelope::util("ping", None)),
            Dispatch::Inbound(_)
        ));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let pending = PendingRequests::new();
        let (_, rx1) = pending.register();
        let (_, rx2) = pending.register();

        let failed = pending.fail_all(|| ProtocolError::ConnectionClosed("gone".into()));
        assert_eq!(failed, 2);
        assert!(pending.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(ProtocolError::ConnectionClosed(_))));
        assert!(matches!(rx2.await.unwrap(), Err(ProtocolError::ConnectionClosed(_))));
    }

    #[test]
    fn test_cancel() {
        let pending = PendingRequests::new();
        let (id, _rx) = pending.register();
        assert!(pending.cancel(id));
        assert!(!pending.cancel(id));
        assert!(!pending.resolve(id, Err(ProtocolError::Timeout("late".into()))));
    }
}
