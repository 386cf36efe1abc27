//! In-process platform API and console doubles for tests.

use std::{
    cell::RefCell,
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use axum::{
    extract::{Multipart, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    prompt::{Prompt, PromptError},
    reporter::Reporter,
};

/// Canned API response.
pub(crate) struct Reply {
    /// HTTP status code.
    status: u16,

    /// JSON response body.
    body: Value,
}

impl Reply {
    /// Create a new canned response.
    pub(crate) fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Successful release snapshot in the provided state.
    pub(crate) fn release(state: &str) -> Self {
        Self::new(200, json!({ "release": { "state": state } }))
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).expect("invalid status code");
        (status, Json(self.body)).into_response()
    }
}

/// Recorded requests and scripted responses of the mock platform.
///
/// Once a reply queue is drained, the corresponding endpoint answers
/// with a successful default response.
#[derive(Default)]
pub(crate) struct MockState {
    /// Every received request as `METHOD /path`.
    pub requests: Vec<String>,

    /// Platform reported in project details.
    pub project_type: Option<String>,

    /// Uploaded source bundles.
    pub uploads: Vec<Vec<u8>>,

    /// Release creation request bodies.
    pub release_bodies: Vec<Value>,

    /// Replies to release creation requests.
    pub create_replies: VecDeque<Reply>,

    /// Replies to release snapshot requests.
    pub release_replies: VecDeque<Reply>,

    /// Replies to build log requests.
    pub build_log_replies: VecDeque<Reply>,

    /// `since` cursors of build log requests.
    pub since: Vec<String>,

    /// Replies to release cancellation requests.
    pub cancel_replies: VecDeque<Reply>,

    /// Custom domains of the project.
    pub domains: Vec<Value>,
}

impl MockState {
    /// Count received requests matching `METHOD /path`.
    pub(crate) fn count(&self, request: &str) -> usize {
        self.requests.iter().filter(|value| *value == request).count()
    }
}

/// Shared mock state.
type SharedState = Arc<Mutex<MockState>>;

/// Mock platform API listening on a random local port.
pub(crate) struct MockPlatform {
    /// Base URL of the mock API.
    pub url: String,

    /// Shared mock state.
    state: SharedState,
}

impl MockPlatform {
    /// Start a new mock platform API in the background.
    pub(crate) async fn start() -> Self {
        let state = SharedState::default();

        let router = Router::new()
            .route("/v1/projects/:app", get(project))
            .route("/v2/projects/:app/sources", post(upload))
            .route("/v2/projects/:app/releases", post(create_release))
            .route("/v1/releases/:id", get(release))
            .route("/v2/releases/:id/build-logs", get(build_logs))
            .route("/v2/releases/:id/cancel", post(cancel))
            .route("/v1/domains", get(domains))
            .layer(middleware::from_fn_with_state(state.clone(), record))
            .with_state(state.clone());

        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
            .serve(router.into_make_service());

        let url = format!("http://{}", server.local_addr());

        tokio::spawn(server);

        Self { url, state }
    }

    /// Lock the mock state.
    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state is poisoned")
    }
}

/// Record every received request.
async fn record<B>(State(state): State<SharedState>, request: Request<B>, next: Next<B>) -> Response {
    state
        .lock()
        .expect("mock state is poisoned")
        .requests
        .push(format!("{} {}", request.method(), request.uri().path()));

    next.run(request).await
}

/// `GET /v1/projects/:app`.
async fn project(State(state): State<SharedState>) -> Json<Value> {
    let state = state.lock().expect("mock state is poisoned");

    Json(json!({ "project": { "type": state.project_type } }))
}

/// `POST /v2/projects/:app/sources`.
async fn upload(State(state): State<SharedState>, mut multipart: Multipart) -> Json<Value> {
    let mut archive = Vec::new();

    while let Some(field) = multipart.next_field().await.expect("invalid multipart body") {
        if field.name() == Some("file") {
            archive = field.bytes().await.expect("unable to read upload").to_vec();
        }
    }

    let mut state = state.lock().expect("mock state is poisoned");
    state.uploads.push(archive);

    Json(json!({ "sourceID": format!("source-{}", state.uploads.len()) }))
}

/// `POST /v2/projects/:app/releases`.
async fn create_release(State(state): State<SharedState>, Json(body): Json<Value>) -> Reply {
    let mut state = state.lock().expect("mock state is poisoned");
    state.release_bodies.push(body);

    state
        .create_replies
        .pop_front()
        .unwrap_or_else(|| Reply::new(200, json!({ "releaseID": "release-1" })))
}

/// `GET /v1/releases/:id`.
async fn release(State(state): State<SharedState>) -> Reply {
    state
        .lock()
        .expect("mock state is poisoned")
        .release_replies
        .pop_front()
        .unwrap_or_else(|| Reply::release("READY"))
}

/// Build log request query.
#[derive(Deserialize)]
struct Since {
    /// Pagination cursor.
    since: String,
}

/// `GET /v2/releases/:id/build-logs`.
async fn build_logs(State(state): State<SharedState>, Query(query): Query<Since>) -> Reply {
    let mut state = state.lock().expect("mock state is poisoned");
    state.since.push(query.since);

    state.build_log_replies.pop_front().unwrap_or_else(|| {
        Reply::new(
            200,
            json!({ "release": { "state": "READY" }, "buildOutput": [] }),
        )
    })
}

/// `POST /v2/releases/:id/cancel`.
async fn cancel(State(state): State<SharedState>) -> Reply {
    state
        .lock()
        .expect("mock state is poisoned")
        .cancel_replies
        .pop_front()
        .unwrap_or_else(|| Reply::new(200, json!({})))
}

/// `GET /v1/domains`.
async fn domains(State(state): State<SharedState>) -> Json<Value> {
    let state = state.lock().expect("mock state is poisoned");

    Json(json!({ "domains": state.domains }))
}

/// Reporter that records every call.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    /// Reported phases.
    pub phases: RefCell<Vec<String>>,

    /// Reported transfer progress.
    pub progress: RefCell<Vec<(u64, u64)>>,

    /// Printed lines.
    pub lines: RefCell<Vec<String>>,

    /// Final message.
    pub finished: RefCell<Option<String>>,
}

impl RecordingReporter {
    /// Check if some printed line contains `text`.
    pub(crate) fn printed(&self, text: &str) -> bool {
        self.lines.borrow().iter().any(|line| line.contains(text))
    }
}

impl Reporter for RecordingReporter {
    fn phase(&self, message: &str) {
        self.phases.borrow_mut().push(message.to_string());
    }

    fn progress(&self, transferred: u64, total: u64) {
        self.progress.borrow_mut().push((transferred, total));
    }

    fn println(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }

    fn finish(&self, message: &str) {
        *self.finished.borrow_mut() = Some(message.to_string());
    }
}

/// Prompt that answers with a fixed value, or behaves as a missing TTY.
pub(crate) struct FixedPrompt(pub Option<&'static str>);

impl Prompt for FixedPrompt {
    fn input(&self, _question: &str) -> Result<String, PromptError> {
        self.0.map(String::from).ok_or(PromptError::NoTty)
    }
}
