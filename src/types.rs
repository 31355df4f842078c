use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::Serialize;

use crate::{ErrorClass, FailureKind, RequestId};

/// Snapshot of everything needed to dispatch a request again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOptions {
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw request body.
    pub body: Option<Vec<u8>>,
    /// Per-request timeout overriding the transport default.
    pub timeout: Option<Duration>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    /// Creates options for the given method with no headers and no body.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Options for a `GET` request.
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    /// Options for a `POST` request.
    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    /// Adds a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets a raw body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Encodes `value` as the JSON body and sets `Content-Type`.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> serde_json::Result<Self> {
        self.body = Some(serde_json::to_vec(value)?);
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// Sets the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response handed back to callers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    /// Creates a response with no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A failed dispatch together with whatever response it produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub response: Option<Response>,
}

impl Failure {
    /// Failure with no response, e.g. a refused connection.
    pub fn without_response(kind: FailureKind) -> Self {
        Self {
            kind,
            response: None,
        }
    }

    /// Failure carrying a non-success response.
    pub fn from_response(response: Response) -> Self {
        Self {
            kind: FailureKind::HttpStatus(response.status),
            response: Some(response),
        }
    }

    /// Classifies the failure.
    pub fn class(&self) -> ErrorClass {
        match (&self.response, &self.kind) {
            (Some(response), _) => ErrorClass::from_status(response.status),
            (None, FailureKind::Network(_)) => ErrorClass::Transport,
            (None, FailureKind::HttpStatus(status)) => ErrorClass::from_status(*status),
            (None, FailureKind::Other(_)) => ErrorClass::Other,
        }
    }
}

/// Result of a single dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success(Response),
    Failure(Failure),
}

/// Request description passed to observer callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: RequestId,
    pub url: String,
    pub options: RequestOptions,
    /// Retries performed so far, including the one about to start.
    pub retry_count: u32,
}

/// Read-only snapshot returned by `InterceptionEngine::status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStatus {
    pub active: bool,
    pub online: bool,
    pub pending_count: usize,
}
