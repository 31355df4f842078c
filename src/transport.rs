use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::{Failure, FailureKind, Outcome, RequestOptions, Response};

/// Capability to perform a request once.
///
/// Implementations classify the result: a 2xx response is a success, anything
/// else is a [`Failure`], with the response attached when one was received.
pub trait Transport: Send + Sync + 'static {
    fn dispatch(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> impl Future<Output = Outcome> + Send;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    timeout: Duration,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

    /// Wraps an existing client, keeping its connection pool.
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Sets the timeout used when a request does not carry its own.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Transport for HttpTransport {
    async fn dispatch(&self, url: &str, options: &RequestOptions) -> Outcome {
        let mut request = self
            .http
            .request(options.method.clone(), url)
            .headers(options.headers.clone())
            .timeout(options.timeout.unwrap_or(self.timeout));
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Outcome::Failure(Failure::without_response(classify(&err))),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(body) => body.to_vec(),
            Err(err) => return Outcome::Failure(Failure::without_response(classify(&err))),
        };

        let response = Response {
            status,
            headers,
            body,
        };
        if response.is_success() {
            Outcome::Success(response)
        } else {
            Outcome::Failure(Failure::from_response(response))
        }
    }
}

fn classify(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FailureKind::Network(err.to_string())
    } else {
        FailureKind::Other(err.to_string())
    }
}
