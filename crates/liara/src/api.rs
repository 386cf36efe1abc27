//! # Platform API
//!
//! Thin wrapper over the platform REST API, covering only the endpoints
//! needed by the deployment flow.
//!
//! Every request except the source upload carries [`REQUEST_TIMEOUT`]. Large
//! uploads may take arbitrarily long, so they are never cut by a timeout.

use std::{fmt, time::Duration};

use derive_more::{Error, From};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    config::{BuildConfig, Disk, HealthCheck},
    git::GitInfo,
};

/// Timeout of ordinary API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server message that signals missing source contents.
const MISSING_FILES: &str = "missing_files";

/// Kind of a platform resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    /// App, addressed by its name.
    App,

    /// Release, addressed by its identifier.
    Release,
}

impl Resource {
    /// Resource addressed by the request path.
    ///
    /// Release endpoints carry the release identifier right after `releases`,
    /// everything else is scoped to an app.
    fn of(path: &str) -> Self {
        let segments: Vec<_> = path.split('/').filter(|segment| !segment.is_empty()).collect();

        if segments.windows(2).any(|pair| pair[0] == "releases") {
            Resource::Release
        } else {
            Resource::App
        }
    }
}

/// Platform API errors.
#[derive(Debug, From, Error)]
pub(crate) enum ApiError {
    /// API token was rejected.
    Unauthorized,

    /// Requested resource does not exist.
    #[from(ignore)]
    NotFound(#[error(not(source))] Resource),

    /// Request was rejected with a client error status.
    #[from(ignore)]
    Status {
        /// HTTP status code.
        status: StatusCode,

        /// Machine-readable error code, if provided.
        code: Option<String>,

        /// Human-readable error message, if provided.
        message: Option<String>,
    },

    /// Release creation referenced source contents the platform doesn't store.
    #[from(ignore)]
    MissingFiles(#[error(not(source))] Vec<String>),

    /// Server-side failure.
    #[from(ignore)]
    Server(#[error(not(source))] StatusCode),

    /// Network-level failure or an unexpected response body.
    Transport(reqwest::Error),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized => write!(
                f,
                "Authentication failed. Make sure your API token is valid and belongs to the selected region."
            ),
            ApiError::NotFound(Resource::App) => write!(
                f,
                "App not found. Make sure the app name is correct and the app exists in your account."
            ),
            ApiError::NotFound(Resource::Release) => write!(
                f,
                "Release not found. It may have been removed from the platform."
            ),
            ApiError::Status { code, message, status } => match code.as_deref() {
                Some("frozen_project") => write!(
                    f,
                    "The app is frozen. Unfreeze it in the console and try again."
                ),
                Some("plan_limit_reached" | "max_deploy_per_day") => write!(
                    f,
                    "You have reached the deployment limit of your plan. Please upgrade your plan or try again later."
                ),
                Some("deployment_not_allowed") => write!(
                    f,
                    "Deployments are not allowed for this app. Check the app settings in the console."
                ),
                Some("bundle_plan_limit") => write!(
                    f,
                    "The bundle plan of this app doesn't allow this deployment. Please upgrade the bundle plan."
                ),
                _ => match message {
                    Some(message) => write!(f, "Deployment request was rejected: {message}"),
                    None => write!(f, "Deployment request was rejected with status {status}."),
                },
            },
            ApiError::MissingFiles(checksums) => write!(
                f,
                "The platform is missing {} of the uploaded files.",
                checksums.len()
            ),
            ApiError::Server(status) => write!(
                f,
                "The platform responded with {status}. Please try again, or run with --debug for more details."
            ),
            ApiError::Transport(error) => write!(
                f,
                "Unable to reach the platform: {error}. Please check your network connection, or run with --debug for more details."
            ),
        }
    }
}

/// Error response body.
///
/// Error codes may be reported either at the top level or inside of the `data` object.
#[derive(Default, Deserialize)]
struct ErrorBody {
    /// Human-readable message.
    #[serde(default)]
    message: Option<String>,

    /// Machine-readable error code.
    #[serde(default)]
    code: Option<String>,

    /// Checksums of missing source contents.
    #[serde(default)]
    missing_files: Vec<String>,

    /// Additional error data.
    #[serde(default)]
    data: Option<ErrorData>,
}

/// Nested error data.
#[derive(Default, Deserialize)]
struct ErrorData {
    /// Machine-readable error code.
    #[serde(default)]
    code: Option<String>,

    /// Checksums of missing source contents.
    #[serde(default)]
    missing_files: Vec<String>,
}

/// Project details response.
#[derive(Deserialize)]
struct ProjectResponse {
    /// Requested project.
    project: Project,
}

/// Project details.
#[derive(Debug, Deserialize)]
pub(crate) struct Project {
    /// Platform the project was created with.
    #[serde(rename = "type", default)]
    pub platform: Option<String>,
}

/// Source upload response.
#[derive(Deserialize)]
struct SourceResponse {
    /// Stored source bundle identifier.
    #[serde(rename = "sourceID")]
    source_id: String,
}

/// Release creation response.
#[derive(Deserialize)]
struct CreateReleaseResponse {
    /// Created release identifier.
    #[serde(rename = "releaseID")]
    release_id: String,
}

/// Release snapshot response.
#[derive(Deserialize)]
struct ReleaseResponse {
    /// Current release snapshot.
    release: Release,
}

/// Release lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum ReleaseState {
    /// Waiting for a free builder.
    Queued,

    /// Image is being built.
    Building,

    /// Image is being pushed to the registry.
    Pushing,

    /// Image was pushed to the registry.
    Pushed,

    /// Containers are being started.
    Deploying,

    /// Containers started, but health checks fail.
    Unhealthy,

    /// Release is serving traffic.
    Ready,

    /// Release failed.
    Failed,

    /// Release was canceled.
    Canceled,

    /// Build took longer than allowed by the plan.
    Timedout,

    /// State unknown to this client version.
    #[serde(other)]
    Unknown,
}

/// Client-observed release snapshot.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Release {
    /// Current state.
    pub state: ReleaseState,

    /// Position in the build queue.
    #[serde(default)]
    pub queue: Option<u64>,

    /// Failure description.
    #[serde(default)]
    pub fail_reason: Option<String>,
}

/// Build output stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub(crate) enum LogStream {
    /// Regular output.
    Stdout,

    /// Build errors.
    Stderr,
}

/// A single build output line.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BuildLogLine {
    /// Stream the line was written to.
    pub stream: LogStream,

    /// Line contents.
    pub line: String,

    /// Line timestamp, used as a pagination cursor.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Build logs response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BuildLogs {
    /// Current release snapshot.
    pub release: Release,

    /// New build output lines, in order.
    #[serde(default)]
    pub build_output: Vec<BuildLogLine>,
}

/// Domains response.
#[derive(Deserialize)]
struct DomainsResponse {
    /// Custom domains of the project.
    #[serde(default)]
    domains: Vec<Domain>,
}

/// Custom domain attached to a project.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Domain {
    /// Domain name.
    pub name: String,

    /// TLS certificate status.
    #[serde(default)]
    pub certificates_status: Option<String>,
}

impl Domain {
    /// Public URL of the domain.
    pub(crate) fn url(&self) -> String {
        match self.certificates_status.as_deref() {
            Some("ACTIVE") => format!("https://{}", self.name),
            _ => format!("http://{}", self.name),
        }
    }
}

/// Release creation request body.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReleaseRequest {
    /// Port the app listens on.
    pub port: u16,

    /// Platform name.
    #[serde(rename = "type")]
    pub platform: String,

    /// Pre-built image reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Uploaded source bundle identifier.
    #[serde(rename = "sourceID", skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Build options.
    pub build: BuildConfig,

    /// Disks mounted into the container.
    pub disks: Vec<Disk>,

    /// Arguments passed to the app command.
    pub args: Vec<String>,

    /// Release message.
    pub message: Option<String>,

    /// Cron jobs.
    pub cron: Vec<String>,

    /// Platform-specific configuration.
    pub platform_config: Value,

    /// Version control details of the deployed source.
    pub git_info: GitInfo,

    /// Container health check with a normalized command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Platform API client.
pub(crate) struct ApiClient {
    /// HTTP client.
    client: Client,

    /// API server path, without a trailing slash.
    server_path: String,

    /// API token.
    token: String,
}

impl ApiClient {
    /// Create a new API client.
    pub(crate) fn new(server_path: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            server_path: server_path.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Get project details.
    pub(crate) async fn project(&self, app: &str) -> Result<Project, ApiError> {
        let response: ProjectResponse =
            send(self.timed(Method::GET, &format!("/v1/projects/{app}"))).await?;

        Ok(response.project)
    }

    /// Upload a source bundle of `len` bytes.
    ///
    /// Returns the identifier of the stored bundle.
    pub(crate) async fn upload_source(
        &self,
        app: &str,
        body: Body,
        len: u64,
    ) -> Result<String, ApiError> {
        let part = reqwest::multipart::Part::stream_with_length(body, len)
            .file_name("source.tar.gz")
            .mime_str("application/gzip")?;

        let request = self
            .request(Method::POST, &format!("/v2/projects/{app}/sources"))
            .multipart(reqwest::multipart::Form::new().part("file", part));

        let response: SourceResponse = send(request).await?;

        Ok(response.source_id)
    }

    /// Create a new release.
    ///
    /// Returns the identifier of the created release.
    pub(crate) async fn create_release(
        &self,
        app: &str,
        release: &ReleaseRequest,
    ) -> Result<String, ApiError> {
        let request = self
            .timed(Method::POST, &format!("/v2/projects/{app}/releases"))
            .json(release);

        let response: CreateReleaseResponse = send(request).await?;

        Ok(response.release_id)
    }

    /// Get the current release snapshot.
    pub(crate) async fn release(&self, id: &str) -> Result<Release, ApiError> {
        let response: ReleaseResponse =
            send(self.timed(Method::GET, &format!("/v1/releases/{id}"))).await?;

        Ok(response.release)
    }

    /// Get build output written after the `since` cursor.
    pub(crate) async fn build_logs(&self, id: &str, since: i64) -> Result<BuildLogs, ApiError> {
        let request = self
            .timed(Method::GET, &format!("/v2/releases/{id}/build-logs"))
            .query(&[("since", since)]);

        send(request).await
    }

    /// Request release cancellation.
    pub(crate) async fn cancel_release(&self, id: &str) -> Result<(), ApiError> {
        let request = self.timed(Method::POST, &format!("/v2/releases/{id}/cancel"));

        check(request.send().await?).await?;

        Ok(())
    }

    /// List custom domains of the project.
    pub(crate) async fn domains(&self, app: &str) -> Result<Vec<Domain>, ApiError> {
        let request = self
            .timed(Method::GET, "/v1/domains")
            .query(&[("project", app)]);

        let response: DomainsResponse = send(request).await?;

        Ok(response.domains)
    }

    /// Create an authenticated request without a timeout.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!(%method, path, "sending API request");

        self.client
            .request(method, format!("{}{path}", self.server_path))
            .bearer_auth(&self.token)
    }

    /// Create an authenticated request limited by [`REQUEST_TIMEOUT`].
    fn timed(&self, method: Method, path: &str) -> RequestBuilder {
        self.request(method, path).timeout(REQUEST_TIMEOUT)
    }
}

/// Send a request and deserialize a successful JSON response.
async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
    Ok(check(request.send().await?).await?.json().await?)
}

/// Map unsuccessful responses to [`ApiError`].
async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    debug!(%status, url = %response.url(), "API request failed");

    if status.is_server_error() {
        return Err(ApiError::Server(status));
    }

    match status {
        StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
        StatusCode::NOT_FOUND => {
            return Err(ApiError::NotFound(Resource::of(response.url().path())))
        }
        _ => {}
    }

    let body: ErrorBody = response.json().await.unwrap_or_default();
    let data = body.data.unwrap_or_default();

    if status == StatusCode::BAD_REQUEST && body.message.as_deref() == Some(MISSING_FILES) {
        let missing_files = if body.missing_files.is_empty() {
            data.missing_files
        } else {
            body.missing_files
        };

        return Err(ApiError::MissingFiles(missing_files));
    }

    Err(ApiError::Status {
        status,
        code: body.code.or(data.code),
        message: body.message,
    })
}
