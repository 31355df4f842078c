use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{EngineError, ErrorClass, FailureKind, RequestInfo, Response};

/// Decides whether a failure deserves another attempt.
pub type RetryCondition = Arc<dyn Fn(&FailureKind, Option<&Response>) -> bool + Send + Sync>;
/// Invoked before each retry with the previous failure and the attempt number.
pub type OnRetry = Arc<dyn Fn(&FailureKind, u32, &RequestInfo) + Send + Sync>;
/// Invoked once when a request is abandoned after its last retry.
pub type OnMaxRetriesExceeded = Arc<dyn Fn(&FailureKind, &RequestInfo) + Send + Sync>;

pub const DEFAULT_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default eligibility predicate.
///
/// Retries network failures without a response and server-class statuses
/// (`>= 500`, 408, 429 and the sentinel 0). Other 4xx statuses are final.
pub fn default_retry_condition(failure: &FailureKind, response: Option<&Response>) -> bool {
    let class = match (response, failure) {
        (Some(response), _) => ErrorClass::from_status(response.status),
        (None, FailureKind::Network(_)) => ErrorClass::Transport,
        (None, FailureKind::HttpStatus(status)) => ErrorClass::from_status(*status),
        (None, FailureKind::Other(_)) => ErrorClass::Other,
    };
    class.is_retryable()
}

/// Retry policy applied by the engine.
#[derive(Clone)]
pub struct RetryConfig {
    /// Minimum time since the last attempt before a request is retried.
    pub delay: Duration,
    /// Period of the background sweep.
    pub retry_interval: Duration,
    /// Retries allowed per request before it is abandoned.
    pub max_retries: u32,
    pub retry_condition: RetryCondition,
    pub on_retry: Option<OnRetry>,
    pub on_max_retries_exceeded: Option<OnMaxRetriesExceeded>,
    /// Emits diagnostic events through `tracing`.
    pub enable_logging: bool,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("delay", &self.delay)
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_retries_exceeded", &self.on_max_retries_exceeded.is_some())
            .field("enable_logging", &self.enable_logging)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_condition: Arc::new(default_retry_condition),
            on_retry: None,
            on_max_retries_exceeded: None,
            enable_logging: false,
        }
    }
}

impl RetryConfig {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the sweep period. A zero period is clamped to one millisecond.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replaces the eligibility predicate.
    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&FailureKind, Option<&Response>) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureKind, u32, &RequestInfo) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_max_retries_exceeded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureKind, &RequestInfo) + Send + Sync + 'static,
    {
        self.on_max_retries_exceeded = Some(Arc::new(callback));
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Merges a partial update into this policy.
    pub fn apply(&mut self, update: ConfigUpdate) {
        let ConfigUpdate {
            delay,
            retry_interval,
            max_retries,
            enable_logging,
            retry_condition,
            on_retry,
            on_max_retries_exceeded,
        } = update;

        if let Some(delay) = delay {
            self.delay = delay;
        }
        if let Some(interval) = retry_interval {
            self.retry_interval = interval;
        }
        if let Some(max_retries) = max_retries {
            self.max_retries = max_retries;
        }
        if let Some(enabled) = enable_logging {
            self.enable_logging = enabled;
        }
        if let Some(condition) = retry_condition {
            self.retry_condition = condition;
        }
        if let Some(callback) = on_retry {
            self.on_retry = Some(callback);
        }
        if let Some(callback) = on_max_retries_exceeded {
            self.on_max_retries_exceeded = Some(callback);
        }
    }

    pub(crate) fn sweep_period(&self) -> Duration {
        self.retry_interval.max(Duration::from_millis(1))
    }

    /// Runs the predicate; a panicking predicate counts as "do not retry".
    pub(crate) fn is_retryable(&self, failure: &FailureKind, response: Option<&Response>) -> bool {
        let condition = &self.retry_condition;
        catch_unwind(AssertUnwindSafe(|| condition(failure, response))).unwrap_or_else(|_| {
            crate::diag!(always, WARN, %failure, "retry condition panicked, treating as final");
            false
        })
    }

    pub(crate) fn notify_retry(&self, failure: &FailureKind, attempt: u32, info: &RequestInfo) {
        if let Some(callback) = &self.on_retry {
            if catch_unwind(AssertUnwindSafe(|| callback(failure, attempt, info))).is_err() {
                crate::diag!(always, WARN, id = %info.id, "on_retry callback panicked");
            }
        }
    }

    pub(crate) fn notify_exhausted(&self, failure: &FailureKind, info: &RequestInfo) {
        if let Some(callback) = &self.on_max_retries_exceeded {
            if catch_unwind(AssertUnwindSafe(|| callback(failure, info))).is_err() {
                crate::diag!(always, WARN, id = %info.id, "on_max_retries_exceeded callback panicked");
            }
        }
    }
}

/// Partial policy update; unset fields keep their current value.
///
/// Plain fields can be read from JSON using the option names `delayTime`,
/// `retryInterval` (both in milliseconds), `maxRetries` and `enableLogging`.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigUpdate {
    #[serde(default, rename = "delayTime", deserialize_with = "millis")]
    pub delay: Option<Duration>,
    #[serde(default, deserialize_with = "millis")]
    pub retry_interval: Option<Duration>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub enable_logging: Option<bool>,
    #[serde(skip)]
    pub retry_condition: Option<RetryCondition>,
    #[serde(skip)]
    pub on_retry: Option<OnRetry>,
    #[serde(skip)]
    pub on_max_retries_exceeded: Option<OnMaxRetriesExceeded>,
}

impl fmt::Debug for ConfigUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigUpdate")
            .field("delay", &self.delay)
            .field("retry_interval", &self.retry_interval)
            .field("max_retries", &self.max_retries)
            .field("enable_logging", &self.enable_logging)
            .field("retry_condition", &self.retry_condition.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_max_retries_exceeded", &self.on_max_retries_exceeded.is_some())
            .finish()
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

impl ConfigUpdate {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = Some(enabled);
        self
    }

    pub fn retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&FailureKind, Option<&Response>) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureKind, u32, &RequestInfo) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    pub fn on_max_retries_exceeded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FailureKind, &RequestInfo) + Send + Sync + 'static,
    {
        self.on_max_retries_exceeded = Some(Arc::new(callback));
        self
    }

    /// Parses the plain options from a JSON object.
    ///
    /// # Example
    ///
    /// ```
    /// use offline_retry::ConfigUpdate;
    ///
    /// let update = ConfigUpdate::from_json(r#"{"maxRetries": 5, "delayTime": 250}"#).unwrap();
    /// assert_eq!(update.max_retries, Some(5));
    /// ```
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|err| EngineError::Config(err.to_string()))
    }

    /// Reads the plain options from environment variables.
    ///
    /// Reads, when set:
    /// - `OFFLINE_RETRY_DELAY_MS`
    /// - `OFFLINE_RETRY_INTERVAL_MS`
    /// - `OFFLINE_RETRY_MAX_RETRIES`
    /// - `OFFLINE_RETRY_ENABLE_LOGGING` (`true`/`false`/`1`/`0`)
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mut update = Self::default();
        if let Some(value) = read("OFFLINE_RETRY_DELAY_MS") {
            update.delay = Some(Duration::from_millis(parse_number(
                "OFFLINE_RETRY_DELAY_MS",
                &value,
            )?));
        }
        if let Some(value) = read("OFFLINE_RETRY_INTERVAL_MS") {
            update.retry_interval = Some(Duration::from_millis(parse_number(
                "OFFLINE_RETRY_INTERVAL_MS",
                &value,
            )?));
        }
        if let Some(value) = read("OFFLINE_RETRY_MAX_RETRIES") {
            update.max_retries = Some(parse_number("OFFLINE_RETRY_MAX_RETRIES", &value)?);
        }
        if let Some(value) = read("OFFLINE_RETRY_ENABLE_LOGGING") {
            update.enable_logging = Some(match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(EngineError::Config(format!(
                        "OFFLINE_RETRY_ENABLE_LOGGING must be a boolean, got '{other}'"
                    )))
                }
            });
        }
        Ok(update)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EngineError> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}
