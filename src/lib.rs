//! `offline-retry` is a transparent retry queue for outbound HTTP requests.
//!
//! Failed requests that the [`RetryConfig`] considers retryable are parked in
//! an in-memory queue and re-dispatched by a background sweep, and requests
//! made while offline wait until [`Connectivity`] reports the network is back.
//! Callers await a [`PendingResponse`] that settles exactly once.
//!
//! The entry points are on [`InterceptionEngine`]:
//! - [`InterceptionEngine::send`]
//! - [`InterceptionEngine::enqueue_failed_request`]
//! - [`InterceptionEngine::start`] / [`InterceptionEngine::stop`]

mod config;
mod engine;
mod error;
mod log;
mod network;
mod registry;
mod scheduler;
mod transport;
mod types;

pub mod global;

pub(crate) use log::diag;

pub use config::{
    default_retry_condition, ConfigUpdate, OnMaxRetriesExceeded, OnRetry, RetryCondition,
    RetryConfig, DEFAULT_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL,
};
pub use engine::InterceptionEngine;
pub use error::{EngineError, ErrorClass, FailureKind, RetryError};
pub use network::Connectivity;
pub use registry::{PendingResponse, RequestId, Settlement};
pub use transport::{HttpTransport, Transport};
pub use types::{EngineStatus, Failure, Outcome, RequestInfo, RequestOptions, Response};

pub type Result<T> = std::result::Result<T, RetryError>;
