use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{FailureKind, RequestInfo, RequestOptions, Response, RetryError};

/// Outcome delivered to the caller of a queued request.
pub type Settlement = std::result::Result<Response, RetryError>;

/// Opaque identifier of a queued request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A request waiting for its next retry.
///
/// Owns the sending half of the caller's [`PendingResponse`]; settling
/// consumes the entry, so it can only ever be settled once.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    url: String,
    options: RequestOptions,
    retry_count: u32,
    last_attempt_at: Instant,
    last_failure: FailureKind,
    settle_tx: oneshot::Sender<Settlement>,
}

impl PendingRequest {
    pub(crate) fn new(
        url: String,
        options: RequestOptions,
        failure: FailureKind,
        now: Instant,
    ) -> (Self, oneshot::Receiver<Settlement>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            url,
            options,
            retry_count: 0,
            last_attempt_at: now,
            last_failure: failure,
            settle_tx: tx,
        };
        (request, rx)
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn info(&self, id: RequestId) -> RequestInfo {
        RequestInfo {
            id,
            url: self.url.clone(),
            options: self.options.clone(),
            retry_count: self.retry_count,
        }
    }

    /// Delivers the outcome. A caller that stopped waiting is not an error.
    pub(crate) fn settle(self, outcome: Settlement) {
        let _ = self.settle_tx.send(outcome);
    }
}

/// Point-in-time copy of a queued entry, detached from the registry.
#[derive(Clone, Debug)]
pub(crate) struct PendingSnapshot {
    pub(crate) id: RequestId,
    pub(crate) url: String,
    pub(crate) options: RequestOptions,
    pub(crate) retry_count: u32,
    pub(crate) last_attempt_at: Instant,
    pub(crate) last_failure: FailureKind,
}

impl PendingSnapshot {
    pub(crate) fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.id,
            url: self.url.clone(),
            options: self.options.clone(),
            retry_count: self.retry_count,
        }
    }
}

/// In-memory store of requests awaiting retry.
#[derive(Debug, Default)]
pub(crate) struct PendingRequestRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingRequestRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // User callbacks never run under this lock, but a poisoned map is still
    // structurally valid, so keep serving it.
    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn enqueue(&self, request: PendingRequest) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, request);
        id
    }

    /// Removes an entry without settling it; the caller must settle it.
    pub(crate) fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        self.lock().remove(&id)
    }

    /// Removes and settles an entry. Returns `false` if it was already gone.
    pub(crate) fn settle(&self, id: RequestId, outcome: Settlement) -> bool {
        match self.remove(id) {
            Some(request) => {
                request.settle(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<PendingSnapshot> {
        self.lock()
            .iter()
            .map(|(id, request)| PendingSnapshot {
                id: *id,
                url: request.url.clone(),
                options: request.options.clone(),
                retry_count: request.retry_count,
                last_attempt_at: request.last_attempt_at,
                last_failure: request.last_failure.clone(),
            })
            .collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Records the start of a retry and returns the new retry count.
    pub(crate) fn begin_attempt(&self, id: RequestId, now: Instant) -> Option<u32> {
        let mut entries = self.lock();
        let request = entries.get_mut(&id)?;
        request.retry_count += 1;
        request.last_attempt_at = now;
        Some(request.retry_count)
    }

    pub(crate) fn record_failure(&self, id: RequestId, failure: FailureKind) {
        if let Some(request) = self.lock().get_mut(&id) {
            request.last_failure = failure;
        }
    }

    /// Settles every entry with [`RetryError::Cleared`] and empties the store.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, request)| request).collect();
        let count = drained.len();
        for request in drained {
            request.settle(Err(RetryError::Cleared));
        }
        count
    }
}

/// Handle to the eventual outcome of a queued request.
///
/// Resolves exactly once: with the response on success, or with a
/// [`RetryError`] once the request is exhausted, rejected or cleared.
#[derive(Debug)]
#[must_use = "a queued request only reports its outcome through this handle"]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Settlement>,
}

impl PendingResponse {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<Settlement>) -> Self {
        Self { id, rx }
    }

    /// Identifier of the queued request.
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Settlement;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the engine went away with the entry still queued.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RetryError::Cleared)))
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::{PendingRequest, PendingRequestRegistry, PendingResponse};
    use crate::{FailureKind, RequestOptions, Response, RetryError};

    fn queue(registry: &PendingRequestRegistry, url: &str) -> PendingResponse {
        let (request, rx) = PendingRequest::new(
            url.to_owned(),
            RequestOptions::get(),
            FailureKind::network("refused"),
            Instant::now(),
        );
        let id = registry.enqueue(request);
        PendingResponse::new(id, rx)
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = PendingRequestRegistry::new();
        let a = queue(&registry, "http://a");
        let b = queue(&registry, "http://b");
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.count(), 2);
    }

    #[tokio::test]
    async fn settle_removes_and_resolves_once() {
        let registry = PendingRequestRegistry::new();
        let handle = queue(&registry, "http://a");
        let id = handle.id();

        assert!(registry.settle(id, Ok(Response::new(200, "ok"))));
        assert!(!registry.settle(id, Err(RetryError::Cleared)));
        assert_eq!(registry.count(), 0);

        let response = handle.await.expect("must resolve with the first outcome");
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn clear_settles_everything_with_cleared() {
        let registry = PendingRequestRegistry::new();
        let a = queue(&registry, "http://a");
        let b = queue(&registry, "http://b");

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(a.await, Err(RetryError::Cleared));
        assert_eq!(b.await, Err(RetryError::Cleared));
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_mutation() {
        let registry = PendingRequestRegistry::new();
        let a = queue(&registry, "http://a");
        let snapshot = registry.snapshot();
        let _b = queue(&registry, "http://b");
        registry.remove(a.id());

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, a.id());
        assert_eq!(snapshot[0].url, "http://a");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn begin_attempt_increments_count() {
        let registry = PendingRequestRegistry::new();
        let handle = queue(&registry, "http://a");
        let now = Instant::now();

        assert_eq!(registry.begin_attempt(handle.id(), now), Some(1));
        assert_eq!(registry.begin_attempt(handle.id(), now), Some(2));
        assert_eq!(registry.snapshot()[0].retry_count, 2);

        registry.remove(handle.id());
        assert_eq!(registry.begin_attempt(handle.id(), now), None);
    }

    #[tokio::test]
    async fn dropped_entry_resolves_as_cleared() {
        let registry = PendingRequestRegistry::new();
        let handle = queue(&registry, "http://a");
        drop(registry);
        assert_eq!(handle.await, Err(RetryError::Cleared));
    }
}
