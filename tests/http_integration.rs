use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::any, Router};
use offline_retry::{
    Connectivity, ConfigUpdate, HttpTransport, InterceptionEngine, RequestOptions, RetryConfig,
    RetryError,
};

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    body: &'static str,
    delay: Duration,
}

impl MockResponse {
    fn new(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            body,
            delay: Duration::from_millis(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    hits: Arc<AtomicUsize>,
}

async fn handler(State(state): State<MockState>, _body: String) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "no mock response available")
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    (response.status, response.body)
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self) -> String {
        format!("{}/items", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new()
        .route("/items", any(handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        task,
    }
}

fn fast_config() -> RetryConfig {
    RetryConfig::default()
        .with_delay(Duration::from_millis(10))
        .with_retry_interval(Duration::from_millis(20))
}

fn engine(config: RetryConfig) -> InterceptionEngine<HttpTransport> {
    let transport = HttpTransport::default().with_timeout(Duration::from_secs(2));
    InterceptionEngine::with_config(transport, Connectivity::new(true), config)
}

#[tokio::test]
async fn retries_server_errors_until_success() {
    let server = spawn_server(vec![
        MockResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy"),
        MockResponse::new(StatusCode::SERVICE_UNAVAILABLE, "busy"),
        MockResponse::new(StatusCode::OK, "done"),
    ])
    .await;
    let engine = engine(fast_config());
    engine.start().expect("must start");

    let response = engine
        .send(server.url(), RequestOptions::post().body("payload"))
        .await
        .expect("request must succeed after retries");

    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "done");
    assert_eq!(server.hits(), 3);
    assert_eq!(engine.pending_count(), 0);
    engine.stop();
}

#[tokio::test]
async fn client_errors_are_handed_back_without_retry() {
    let server = spawn_server(vec![MockResponse::new(StatusCode::NOT_FOUND, "missing")]).await;
    let engine = engine(fast_config());
    engine.start().expect("must start");

    let response = engine
        .send(server.url(), RequestOptions::get())
        .await
        .expect("a 404 is a final response, not an engine error");

    assert_eq!(response.status, 404);
    assert_eq!(server.hits(), 1);
    assert_eq!(engine.pending_count(), 0);
    engine.stop();
}

#[tokio::test]
async fn exhausts_after_max_retries_and_reports_url() {
    let server = spawn_server(Vec::new()).await;
    let exhausted = Arc::new(Mutex::new(Vec::new()));
    let seen = exhausted.clone();
    let engine = engine(fast_config().on_max_retries_exceeded(move |_, info| {
        seen.lock()
            .expect("exhausted log must not be poisoned")
            .push(info.url.clone());
    }));
    engine.start().expect("must start");

    let err = engine
        .send(server.url(), RequestOptions::get())
        .await
        .expect_err("every attempt fails");

    match err {
        RetryError::RetriesExhausted { url, attempts, .. } => {
            assert_eq!(url, server.url());
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    // One initial dispatch plus three retries.
    assert_eq!(server.hits(), 4);
    assert_eq!(
        *exhausted.lock().expect("exhausted log must not be poisoned"),
        vec![server.url()]
    );
    engine.stop();
}

#[tokio::test]
async fn timeouts_are_retried() {
    let server = spawn_server(vec![
        MockResponse::new(StatusCode::OK, "slow").with_delay(Duration::from_millis(300)),
        MockResponse::new(StatusCode::OK, "fast"),
    ])
    .await;
    let engine = engine(fast_config());
    engine.start().expect("must start");

    let response = engine
        .send(
            server.url(),
            RequestOptions::get().timeout(Duration::from_millis(50)),
        )
        .await
        .expect("second attempt must succeed");

    assert_eq!(response.text(), "fast");
    assert_eq!(server.hits(), 2);
    engine.stop();
}

#[tokio::test]
async fn stop_settles_waiting_callers_with_cleared() {
    let server = spawn_server(Vec::new()).await;
    let engine = engine(
        fast_config()
            .with_delay(Duration::from_secs(60))
            .with_max_retries(10),
    );
    engine.start().expect("must start");

    let waiting = {
        let engine = engine.clone();
        let url = server.url();
        tokio::spawn(async move { engine.send(url, RequestOptions::get()).await })
    };

    while engine.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.stop();

    let outcome = waiting.await.expect("send task must not panic");
    assert_eq!(outcome, Err(RetryError::Cleared));
    assert_eq!(engine.pending_count(), 0);
    assert!(!engine.status().active);
}

#[tokio::test]
async fn update_config_applies_to_running_engine() {
    let server = spawn_server(vec![
        MockResponse::new(StatusCode::BAD_GATEWAY, "down"),
        MockResponse::new(StatusCode::OK, "up"),
    ])
    .await;
    let engine = engine(
        RetryConfig::default()
            .with_delay(Duration::from_secs(60))
            .with_retry_interval(Duration::from_secs(60)),
    );
    engine.start().expect("must start");

    let waiting = {
        let engine = engine.clone();
        let url = server.url();
        tokio::spawn(async move { engine.send(url, RequestOptions::get()).await })
    };
    while engine.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    engine.update_config(
        ConfigUpdate::from_json(r#"{"delayTime": 0, "retryInterval": 10}"#)
            .expect("json must parse"),
    );

    let response = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("retry must happen on the new interval")
        .expect("send task must not panic")
        .expect("second attempt must succeed");
    assert_eq!(response.status, 200);
    engine.stop();
}
