use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use tokio::time::Instant;

use crate::registry::{PendingRequestRegistry, PendingSnapshot, RequestId};
use crate::{ConfigUpdate, FailureKind, Outcome, RetryConfig, RetryError, Transport};

/// What one sweep did, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) skipped: bool,
    pub(crate) attempted: usize,
    pub(crate) settled: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// What happened to one entry during a sweep.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    NotDue,
    Gone,
    Requeued,
    Settled,
}

/// Owns the pending registry and the policy, and performs sweeps.
pub(crate) struct RetryScheduler<T> {
    transport: T,
    registry: PendingRequestRegistry,
    policy: RwLock<RetryConfig>,
    sweeping: AtomicBool,
}

/// Releases the single-sweep flag on drop, including when a sweep is cancelled.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Transport> RetryScheduler<T> {
    pub(crate) fn new(transport: T, policy: RetryConfig) -> Self {
        Self {
            transport,
            registry: PendingRequestRegistry::new(),
            policy: RwLock::new(policy),
            sweeping: AtomicBool::new(false),
        }
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    pub(crate) fn registry(&self) -> &PendingRequestRegistry {
        &self.registry
    }

    /// Clone of the live policy. Callbacks are shared, not copied.
    pub(crate) fn policy(&self) -> RetryConfig {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn update_policy(&self, update: ConfigUpdate) {
        self.policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
    }

    /// Attempts every due entry once.
    ///
    /// Skipped when offline, when nothing is queued, or when another sweep is
    /// still running. Entries queued after the snapshot wait for the next sweep.
    pub(crate) async fn sweep(&self, online: bool) -> SweepReport {
        let policy = self.policy();
        if !online {
            crate::diag!(policy.enable_logging, TRACE, "offline, skipping sweep");
            return SweepReport::skipped();
        }
        if self.registry.is_empty() {
            return SweepReport::skipped();
        }
        let Some(_guard) = SweepGuard::acquire(&self.sweeping) else {
            crate::diag!(policy.enable_logging, DEBUG, "previous sweep still running, skipping");
            return SweepReport::skipped();
        };

        let entries = self.registry.snapshot();
        crate::diag!(policy.enable_logging, DEBUG, pending = entries.len(), "sweeping pending requests");

        let mut report = SweepReport::default();
        for entry in entries {
            match self.attempt(&policy, entry).await {
                Step::Settled => {
                    report.attempted += 1;
                    report.settled += 1;
                }
                Step::Requeued => report.attempted += 1,
                Step::NotDue | Step::Gone => {}
            }
        }
        crate::diag!(policy.enable_logging, DEBUG, attempted = report.attempted, settled = report.settled, "sweep finished");
        report
    }

    async fn attempt(&self, policy: &RetryConfig, entry: PendingSnapshot) -> Step {
        let now = Instant::now();
        if now.saturating_duration_since(entry.last_attempt_at) < policy.delay {
            return Step::NotDue;
        }

        // The ceiling may have been lowered since the last attempt.
        if entry.retry_count >= policy.max_retries {
            return if self.exhaust(policy, entry.id, entry.last_failure) {
                Step::Settled
            } else {
                Step::Gone
            };
        }

        let Some(attempt) = self.registry.begin_attempt(entry.id, now) else {
            return Step::Gone;
        };
        let mut info = entry.info();
        info.retry_count = attempt;
        crate::diag!(policy.enable_logging, DEBUG, id = %entry.id, url = %entry.url, attempt, "retrying request");
        policy.notify_retry(&entry.last_failure, attempt, &info);

        let outcome = self.transport.dispatch(&entry.url, &entry.options).await;
        let failure = match outcome {
            Outcome::Success(response) => {
                crate::diag!(policy.enable_logging, DEBUG, id = %entry.id, status = response.status, "retry succeeded");
                return self.settled(self.registry.settle(entry.id, Ok(response)));
            }
            Outcome::Failure(failure) => failure,
        };

        let retryable = policy.is_retryable(&failure.kind, failure.response.as_ref());
        match failure.response {
            // Give up and hand back whatever the server said.
            Some(response) if !retryable => {
                crate::diag!(policy.enable_logging, DEBUG, id = %entry.id, status = response.status, "non-retryable response, settling");
                self.settled(self.registry.settle(entry.id, Ok(response)))
            }
            _ if attempt >= policy.max_retries => self.settled(self.exhaust(policy, entry.id, failure.kind)),
            None if !retryable => {
                crate::diag!(policy.enable_logging, DEBUG, id = %entry.id, failure = %failure.kind, "non-retryable failure, settling");
                let outcome = Err(RetryError::Failed {
                    url: entry.url,
                    cause: failure.kind,
                });
                self.settled(self.registry.settle(entry.id, outcome))
            }
            _ => {
                crate::diag!(policy.enable_logging, DEBUG, id = %entry.id, failure = %failure.kind, attempt, "retry failed, keeping queued");
                self.registry.record_failure(entry.id, failure.kind);
                Step::Requeued
            }
        }
    }

    fn settled(&self, found: bool) -> Step {
        if found {
            Step::Settled
        } else {
            Step::Gone
        }
    }

    /// Abandons an entry: removes it, notifies the observer, fails the caller.
    fn exhaust(&self, policy: &RetryConfig, id: RequestId, cause: FailureKind) -> bool {
        let Some(request) = self.registry.remove(id) else {
            return false;
        };
        let info = request.info(id);
        crate::diag!(policy.enable_logging, WARN, %id, url = %request.url(), attempts = request.retry_count(), "max retries exceeded");
        policy.notify_exhausted(&cause, &info);
        let attempts = request.retry_count();
        let url = request.url().to_owned();
        request.settle(Err(RetryError::RetriesExhausted {
            url,
            attempts,
            cause,
        }));
        true
    }
}
