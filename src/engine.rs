use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::network::{NetworkMonitor, Transition};
use crate::registry::{PendingRequest, PendingResponse};
use crate::scheduler::RetryScheduler;
use crate::{
    ConfigUpdate, Connectivity, EngineError, EngineStatus, Failure, FailureKind, Outcome,
    RequestOptions, Response, RetryConfig, RetryError, Transport,
};

/// Retry and offline queue in front of a [`Transport`].
///
/// Cloning is cheap; clones share the same queue, policy and background loop.
///
/// # Example
///
/// ```no_run
/// use offline_retry::{Connectivity, HttpTransport, InterceptionEngine, RequestOptions};
///
/// # async fn run() -> anyhow::Result<()> {
/// let connectivity = Connectivity::new(true);
/// let engine = InterceptionEngine::new(HttpTransport::default(), connectivity.clone());
/// engine.start()?;
///
/// let response = engine.send("https://example.com/items", RequestOptions::get()).await?;
/// println!("{}", response.status);
///
/// engine.stop();
/// # Ok(())
/// # }
/// ```
pub struct InterceptionEngine<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for InterceptionEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    scheduler: RetryScheduler<T>,
    network: NetworkMonitor,
    reconfigured: Arc<Notify>,
    running: Mutex<Option<Running>>,
}

// The loop only holds a `Weak`, so dropping the last handle lands here and
// releases every queued caller with `Cleared` along with the registry.
impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl<T: Transport> fmt::Debug for InterceptionEngine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionEngine")
            .field("status", &self.status())
            .field("config", &self.config())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> InterceptionEngine<T> {
    /// Creates an inactive engine with the default policy.
    pub fn new(transport: T, connectivity: Connectivity) -> Self {
        Self::with_config(transport, connectivity, RetryConfig::default())
    }

    /// Creates an inactive engine with the given policy.
    pub fn with_config(transport: T, connectivity: Connectivity, config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler: RetryScheduler::new(transport, config),
                network: NetworkMonitor::new(connectivity),
                reconfigured: Arc::new(Notify::new()),
                running: Mutex::new(None),
            }),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the retry loop and connectivity observation.
    ///
    /// Calling `start` on an active engine does nothing. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running();
        if running.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let cancel = CancellationToken::new();
        let connectivity = self.inner.network.attach();
        let task = runtime.spawn(run_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.reconfigured),
            connectivity,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });

        crate::diag!(self.config().enable_logging, INFO, online = self.inner.network.is_online(), "retry engine started");
        Ok(())
    }

    /// Stops the loop and settles every pending request with [`RetryError::Cleared`].
    pub fn stop(&self) {
        let Some(running) = self.running().take() else {
            return;
        };
        running.cancel.cancel();
        // The loop exits at its next poll; aborting also drops an in-flight sweep.
        running.task.abort();
        self.clear_pending_requests();
        crate::diag!(self.config().enable_logging, INFO, "retry engine stopped");
    }

    pub fn is_active(&self) -> bool {
        self.running().is_some()
    }

    /// Merges `update` into the live policy. Applies from the next sweep on.
    pub fn update_config(&self, update: ConfigUpdate) {
        self.inner.scheduler.update_policy(update);
        self.inner.reconfigured.notify_one();
    }

    /// Current policy.
    pub fn config(&self) -> RetryConfig {
        self.inner.scheduler.policy()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            active: self.is_active(),
            online: self.is_online(),
            pending_count: self.pending_count(),
        }
    }

    // The monitor only follows the source while the loop is attached.
    fn is_online(&self) -> bool {
        if self.is_active() {
            self.inner.network.is_online()
        } else {
            self.inner.network.refresh()
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.scheduler.registry().count()
    }

    /// Settles every pending request with [`RetryError::Cleared`] without
    /// stopping the engine. Returns how many were cleared.
    pub fn clear_pending_requests(&self) -> usize {
        let cleared = self.inner.scheduler.registry().clear();
        crate::diag!(self.config().enable_logging, DEBUG, cleared, "cleared pending requests");
        cleared
    }

    /// The connectivity source this engine observes.
    pub fn connectivity(&self) -> &Connectivity {
        self.inner.network.source()
    }

    /// Queues a failed request for retry.
    ///
    /// Returns `None` when the policy does not consider the failure retryable;
    /// the caller should then treat the original failure as final.
    pub fn enqueue_failed_request(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
        failure: &Failure,
    ) -> Option<PendingResponse> {
        let policy = self.config();
        let url = url.into();
        if !policy.is_retryable(&failure.kind, failure.response.as_ref()) {
            crate::diag!(policy.enable_logging, DEBUG, %url, failure = %failure.kind, "failure not retryable, not queued");
            return None;
        }

        let (request, rx) =
            PendingRequest::new(url.clone(), options, failure.kind.clone(), Instant::now());
        let id = self.inner.scheduler.registry().enqueue(request);
        crate::diag!(policy.enable_logging, DEBUG, %id, %url, failure = %failure.kind, "queued request for retry");
        Some(PendingResponse::new(id, rx))
    }

    /// Dispatches a request, queueing it for retry if it fails.
    ///
    /// While the engine is active and offline the request is queued without a
    /// first attempt. While inactive it is dispatched once and never retried.
    pub async fn send(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
    ) -> crate::Result<Response> {
        let url = url.into();
        if !self.is_active() {
            let outcome = self.inner.scheduler.transport().dispatch(&url, &options).await;
            return finish(url, outcome);
        }

        let failure = if self.inner.network.is_online() {
            match self.inner.scheduler.transport().dispatch(&url, &options).await {
                Outcome::Success(response) => return Ok(response),
                Outcome::Failure(failure) => failure,
            }
        } else {
            Failure::without_response(FailureKind::network("offline"))
        };

        match self.enqueue_failed_request(url.clone(), options, &failure) {
            Some(pending) => pending.await,
            None => finish_failure(url, failure),
        }
    }

    /// Runs one sweep immediately, outside the regular schedule.
    ///
    /// Returns `false` if the sweep was skipped: offline, nothing queued, or
    /// another sweep still running.
    pub async fn sweep_now(&self) -> bool {
        !self.inner.scheduler.sweep(self.is_online()).await.skipped
    }
}

fn finish(url: String, outcome: Outcome) -> crate::Result<Response> {
    match outcome {
        Outcome::Success(response) => Ok(response),
        Outcome::Failure(failure) => finish_failure(url, failure),
    }
}

/// A final failure hands back its response when it has one.
fn finish_failure(url: String, failure: Failure) -> crate::Result<Response> {
    match failure.response {
        Some(response) => Ok(response),
        None => Err(RetryError::Failed {
            url,
            cause: failure.kind,
        }),
    }
}

fn sweep_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Why the loop woke up.
enum Wake {
    Tick,
    Reconfigured,
    Connectivity(bool),
    SourceClosed,
}

/// Drives periodic sweeps and reacts to connectivity changes until cancelled
/// or until the engine is dropped.
///
/// Sweeps run inline, so two sweeps from this loop never overlap.
async fn run_loop<T: Transport>(
    engine: Weak<Inner<T>>,
    reconfigured: Arc<Notify>,
    mut connectivity: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let Some(mut period) = engine
        .upgrade()
        .map(|inner| inner.scheduler.policy().sweep_period())
    else {
        return;
    };
    let mut ticker = sweep_ticker(period);
    let mut watching = true;

    loop {
        let wake = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => Wake::Tick,
            () = reconfigured.notified() => Wake::Reconfigured,
            changed = connectivity.changed(), if watching => match changed {
                Ok(()) => Wake::Connectivity(*connectivity.borrow_and_update()),
                Err(_) => Wake::SourceClosed,
            },
        };
        let Some(inner) = engine.upgrade() else {
            break;
        };

        let sweep = match wake {
            Wake::Tick => true,
            Wake::Reconfigured => false,
            Wake::SourceClosed => {
                // Every sender is gone; keep the last known state.
                watching = false;
                false
            }
            Wake::Connectivity(online) => match inner.network.record(online) {
                Some(Transition::Online) => {
                    crate::diag!(inner.scheduler.policy().enable_logging, INFO, "network online, retrying pending requests");
                    true
                }
                Some(Transition::Offline) => {
                    crate::diag!(inner.scheduler.policy().enable_logging, INFO, "network offline, pausing retries");
                    false
                }
                None => false,
            },
        };

        if sweep {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = inner.scheduler.sweep(inner.network.is_online()) => {}
            }
        }

        let configured = inner.scheduler.policy().sweep_period();
        if configured != period {
            period = configured;
            ticker = sweep_ticker(period);
        }
    }
}
