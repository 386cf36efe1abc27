//! # Release tracking
//!
//! After a release is created, its progress is observed by polling the platform.
//!
//! Source deploys first wait in the build queue, and then follow the build output
//! using a `since` cursor. Build output carries no structured state transitions,
//! so the current phase is inferred from output lines by [`classify`]. Once no
//! new lines arrive, the release state itself decides whether the deployment
//! is still in progress.
//!
//! Image deploys have no build output, so only the release state is polled.
//!
//! Polling is resilient to transient failures: a tick that fails with a network
//! or server error is logged and retried on the next tick.

use std::{future::Future, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, ApiError, BuildLogLine, LogStream, Release, ReleaseState},
    error::DeployError,
    poller::Poller,
    reporter::Reporter,
};

/// Maximum amount of release cancellation attempts.
const CANCEL_ATTEMPTS: usize = 3;

/// Prefix of the builder line that marks a successfully built image.
const IMAGE_TAGGED: &str = "Successfully tagged";

/// Prefix of the builder line that marks a completely pushed image.
const IMAGE_PUSHED: &str = "Pushing... 100%";

/// Kind of the deployment being tracked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeployKind {
    /// Uploaded source bundle built by the platform.
    Source,

    /// Pre-built image.
    Image,
}

/// Delays between poll ticks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Intervals {
    /// Build output polling.
    pub build_logs: Duration,

    /// Release state polling.
    pub release: Duration,

    /// Build queue polling.
    pub queue: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            build_logs: Duration::from_secs(1),
            release: Duration::from_secs(2),
            queue: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
impl Intervals {
    /// Poll without any delays.
    pub(crate) fn immediate() -> Self {
        Self {
            build_logs: Duration::ZERO,
            release: Duration::ZERO,
            queue: Duration::ZERO,
        }
    }
}

/// Build phase inferred from the build output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BuildPhase {
    /// Image is being built.
    Building,

    /// Image is being pushed to the registry.
    Pushing,

    /// Image was pushed to the registry.
    Pushed,
}

impl BuildPhase {
    /// User-facing phase description.
    fn message(self) -> &'static str {
        match self {
            BuildPhase::Building => "Building...",
            BuildPhase::Pushing => "Pushing the image...",
            BuildPhase::Pushed => "Image pushed.",
        }
    }
}

/// Meaning of a single build output line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LogEvent {
    /// Regular build output.
    Output,

    /// Registry push progress.
    PushProgress,

    /// Build entered a new phase.
    Phase(BuildPhase),

    /// Build failed.
    Failure,
}

/// Classify a build output line given the current build phase.
pub(crate) fn classify(line: &BuildLogLine, phase: BuildPhase) -> LogEvent {
    if line.stream == LogStream::Stderr {
        return LogEvent::Failure;
    }

    if line.line.starts_with(IMAGE_TAGGED) {
        return LogEvent::Phase(BuildPhase::Pushing);
    }

    if line.line.starts_with(IMAGE_PUSHED) {
        return LogEvent::Phase(BuildPhase::Pushed);
    }

    match phase {
        BuildPhase::Building => LogEvent::Output,
        BuildPhase::Pushing | BuildPhase::Pushed => LogEvent::PushProgress,
    }
}

/// Outcome of a release that reached a terminal state.
pub(crate) fn terminal_outcome(release: &Release) -> Option<Result<(), DeployError>> {
    match release.state {
        ReleaseState::Ready => Some(Ok(())),
        ReleaseState::Unhealthy => Some(Err(DeployError::Unhealthy)),
        ReleaseState::Failed => Some(Err(DeployError::ReleaseFailed(describe_fail_reason(
            release.fail_reason.as_deref(),
        )))),
        ReleaseState::Canceled => Some(Err(DeployError::BuildCanceled)),
        ReleaseState::Timedout => Some(Err(DeployError::BuildTimeout)),
        _ => None,
    }
}

/// Turn a server-provided failure reason into a user-facing message.
pub(crate) fn describe_fail_reason(reason: Option<&str>) -> String {
    let Some(reason) = reason.map(str::trim).filter(|reason| !reason.is_empty()) else {
        return String::from("Deployment failed.");
    };

    let lowercase = reason.to_lowercase();

    let missing_disk = lowercase.contains("disk")
        && ["not found", "not_found", "does not exist"]
            .iter()
            .any(|pattern| lowercase.contains(pattern));

    if missing_disk {
        return String::from(
            "Deployment failed: a disk listed in the configuration doesn't exist. \
             Create the disk first, or fix the `disks` section of liara.json.",
        );
    }

    format!("Deployment failed: {reason}")
}

/// Build output cursor of a line, in milliseconds since the Unix epoch.
fn cursor(line: &BuildLogLine) -> i64 {
    (line.created_at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Check if the poll tick can be retried.
fn is_transient(error: &ApiError) -> bool {
    matches!(error, ApiError::Server(_) | ApiError::Transport(_))
}

/// Tracks a created release until it reaches a terminal state.
pub(crate) struct ReleaseOrchestrator<'a> {
    /// Platform API client.
    api: &'a ApiClient,

    /// Output sink.
    reporter: &'a dyn Reporter,

    /// Delays between poll ticks.
    intervals: Intervals,
}

impl<'a> ReleaseOrchestrator<'a> {
    /// Create a new orchestrator.
    pub(crate) fn new(api: &'a ApiClient, reporter: &'a dyn Reporter, intervals: Intervals) -> Self {
        Self {
            api,
            reporter,
            intervals,
        }
    }

    /// Follow the release until it reaches a terminal state.
    ///
    /// `interrupt` is called to obtain a future that resolves on user interruption.
    /// The first interruption requests release cancellation, and a second one
    /// stops waiting for the cancellation to complete.
    pub(crate) async fn watch<F, Fut>(
        &self,
        release_id: &str,
        kind: DeployKind,
        mut interrupt: F,
    ) -> Result<(), DeployError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        tokio::select! {
            outcome = self.follow(release_id, kind) => return outcome,
            () = interrupt() => {}
        }

        self.reporter.phase("Canceling the release...");

        tokio::select! {
            () = self.cancel(release_id) => {}
            () = interrupt() => warn!("interrupted again, not waiting for the cancellation"),
        }

        Err(DeployError::Interrupted)
    }

    /// Poll the release using the protocol matching the deployment kind.
    async fn follow(&self, release_id: &str, kind: DeployKind) -> Result<(), DeployError> {
        match kind {
            DeployKind::Source => {
                self.await_queue(release_id).await?;
                self.follow_build_logs(release_id).await
            }
            DeployKind::Image => self.await_release(release_id).await,
        }
    }

    /// Wait for the release to leave the build queue, reporting the queue position.
    async fn await_queue(&self, release_id: &str) -> Result<(), DeployError> {
        let mut poller = Poller::new(self.intervals.queue);
        let mut position = None;

        loop {
            poller.tick().await;

            let release = match self.api.release(release_id).await {
                Ok(release) => release,
                Err(error) if is_transient(&error) => {
                    debug!(%error, "unable to fetch release state");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            if release.state != ReleaseState::Queued {
                return Ok(());
            }

            if release.queue.is_some() && release.queue != position {
                position = release.queue;

                if let Some(position) = position {
                    self.reporter.phase(&format!("Queue position: {position}"));
                }
            }
        }
    }

    /// Follow the build output until the release reaches a terminal state.
    async fn follow_build_logs(&self, release_id: &str) -> Result<(), DeployError> {
        let mut poller = Poller::new(self.intervals.build_logs);
        let mut since = 0;
        let mut phase = BuildPhase::Building;
        let mut deploying = false;

        self.reporter.phase(phase.message());

        loop {
            poller.tick().await;

            let logs = match self.api.build_logs(release_id, since).await {
                Ok(logs) => logs,
                Err(error) if is_transient(&error) => {
                    debug!(%error, "unable to fetch build logs");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };

            for line in &logs.build_output {
                since = cursor(line);

                match classify(line, phase) {
                    LogEvent::Output => self.reporter.println(line.line.trim_end()),
                    LogEvent::PushProgress => {}
                    LogEvent::Phase(next) => {
                        info!(phase = ?next, "build phase changed");
                        phase = next;
                        self.reporter.phase(phase.message());
                    }
                    LogEvent::Failure => {
                        self.reporter.println(line.line.trim_end());
                        return Err(DeployError::BuildFailed);
                    }
                }
            }

            if !logs.build_output.is_empty() {
                continue;
            }

            if logs.release.state == ReleaseState::Deploying && !deploying {
                deploying = true;
                self.reporter.phase("Deploying...");
            }

            if let Some(outcome) = terminal_outcome(&logs.release) {
                return outcome;
            }
        }
    }

    /// Poll the release state of an image deploy until it reaches a terminal state.
    async fn await_release(&self, release_id: &str) -> Result<(), DeployError> {
        let mut poller = Poller::new(self.intervals.release);

        self.reporter.phase("Deploying...");

        loop {
            poller.tick().await;

            match self.api.release(release_id).await {
                Ok(release) => {
                    if let Some(outcome) = terminal_outcome(&release) {
                        return outcome;
                    }
                }
                Err(error) if is_transient(&error) => {
                    debug!(%error, "unable to fetch release state");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Request release cancellation, retrying failed attempts.
    async fn cancel(&self, release_id: &str) {
        for attempt in 1..=CANCEL_ATTEMPTS {
            match self.api.cancel_release(release_id).await {
                Ok(()) => {
                    self.reporter.println("The release was canceled.");
                    return;
                }
                Err(error) => warn!(%error, attempt, "unable to cancel the release"),
            }
        }

        self.reporter
            .println("Unable to cancel the release. It may still be deployed.");
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use serde_json::{json, Value};
    use time::OffsetDateTime;

    use super::{
        classify, describe_fail_reason, BuildPhase, DeployKind, Intervals, LogEvent,
        ReleaseOrchestrator,
    };
    use crate::{
        api::{ApiClient, BuildLogLine, LogStream},
        error::DeployError,
        testing::{MockPlatform, RecordingReporter, Reply},
    };

    const RELEASE_ID: &str = "release-1";

    fn line(stream: LogStream, line: &str) -> BuildLogLine {
        BuildLogLine {
            stream,
            line: line.to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn logs(state: &str, output: &[(&str, &str, &str)]) -> Reply {
        let output: Vec<Value> = output
            .iter()
            .map(|(stream, line, created_at)| {
                json!({ "stream": stream, "line": line, "createdAt": created_at })
            })
            .collect();

        Reply::new(
            200,
            json!({ "release": { "state": state }, "buildOutput": output }),
        )
    }

    async fn never() {
        std::future::pending::<()>().await
    }

    async fn watch(
        platform: &MockPlatform,
        reporter: &RecordingReporter,
        kind: DeployKind,
    ) -> Result<(), DeployError> {
        let api = ApiClient::new(&platform.url, "token");

        ReleaseOrchestrator::new(&api, reporter, Intervals::immediate())
            .watch(RELEASE_ID, kind, never)
            .await
    }

    #[test]
    fn line_classification() {
        let building = BuildPhase::Building;

        assert_eq!(
            classify(&line(LogStream::Stdout, "Step 1/5 : FROM node"), building),
            LogEvent::Output
        );
        assert_eq!(
            classify(&line(LogStream::Stdout, "Successfully tagged app:v1"), building),
            LogEvent::Phase(BuildPhase::Pushing)
        );
        assert_eq!(
            classify(&line(LogStream::Stdout, "Pushing... 45%"), BuildPhase::Pushing),
            LogEvent::PushProgress
        );
        assert_eq!(
            classify(&line(LogStream::Stdout, "Pushing... 100%"), BuildPhase::Pushing),
            LogEvent::Phase(BuildPhase::Pushed)
        );
        assert_eq!(
            classify(&line(LogStream::Stderr, "npm ERR! missing script"), building),
            LogEvent::Failure
        );
    }

    #[test]
    fn fail_reasons() {
        assert_eq!(describe_fail_reason(None), "Deployment failed.");
        assert_eq!(describe_fail_reason(Some(" ")), "Deployment failed.");
        assert!(describe_fail_reason(Some("Disk `data` not found"))
            .contains("disk listed in the configuration doesn't exist"));
        assert_eq!(
            describe_fail_reason(Some("out of memory")),
            "Deployment failed: out of memory"
        );
    }

    #[tokio::test]
    async fn source_deploy_ready() {
        let platform = MockPlatform::start().await;
        let reporter = RecordingReporter::default();

        platform.state().release_replies.extend([
            Reply::new(200, json!({ "release": { "state": "QUEUED", "queue": 2 } })),
            Reply::new(200, json!({ "release": { "state": "QUEUED", "queue": 2 } })),
            Reply::new(200, json!({ "release": { "state": "QUEUED", "queue": 1 } })),
            Reply::release("BUILDING"),
        ]);
        platform.state().build_log_replies.extend([
            logs(
                "BUILDING",
                &[
                    ("STDOUT", "Step 1/2 : FROM node", "2023-05-01T10:00:00.100Z"),
                    ("STDOUT", "Successfully tagged app:v1", "2023-05-01T10:00:01Z"),
                    ("STDOUT", "Pushing... 50%", "2023-05-01T10:00:02Z"),
                    ("STDOUT", "Pushing... 100%", "2023-05-01T10:00:03Z"),
                ],
            ),
            logs("DEPLOYING", &[]),
            logs("DEPLOYING", &[]),
            logs("READY", &[]),
        ]);

        watch(&platform, &reporter, DeployKind::Source).await.unwrap();

        let phases = reporter.phases.borrow();
        assert_eq!(
            phases.as_slice(),
            [
                "Queue position: 2",
                "Queue position: 1",
                "Building...",
                "Pushing the image...",
                "Image pushed.",
                "Deploying...",
            ]
        );
        assert_eq!(reporter.lines.borrow().as_slice(), ["Step 1/2 : FROM node"]);

        assert_eq!(
            platform.state().since,
            ["0", "1682935203000", "1682935203000", "1682935203000"]
        );
    }

    #[tokio::test]
    async fn stderr_fails_build() {
        let platform = MockPlatform::start().await;
        let reporter = RecordingReporter::default();

        platform.state().build_log_replies.extend([
            logs(
                "BUILDING",
                &[
                    ("STDOUT", "npm install", "2023-05-01T10:00:00Z"),
                    ("STDERR", "npm ERR! code ENOENT", "2023-05-01T10:00:01Z"),
                    ("STDOUT", "never shown", "2023-05-01T10:00:02Z"),
                ],
            ),
            logs("READY", &[]),
        ]);

        let outcome = watch(&platform, &reporter, DeployKind::Source).await;

        assert!(matches!(outcome, Err(DeployError::BuildFailed)));
        assert_eq!(
            reporter.lines.borrow().as_slice(),
            ["npm install", "npm ERR! code ENOENT"]
        );
        assert_eq!(platform.state().count("GET /v2/releases/release-1/build-logs"), 1);
    }

    #[tokio::test]
    async fn server_driven_terminal_states() {
        for (state, expected) in [("CANCELED", "Build canceled."), ("TIMEDOUT", "Build timed out")] {
            let platform = MockPlatform::start().await;
            let reporter = RecordingReporter::default();

            platform
                .state()
                .build_log_replies
                .push_back(logs(state, &[]));

            let error = watch(&platform, &reporter, DeployKind::Source)
                .await
                .unwrap_err();

            assert!(error.to_string().starts_with(expected));
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let platform = MockPlatform::start().await;
        let reporter = RecordingReporter::default();

        platform.state().build_log_replies.extend([
            Reply::new(500, json!({})),
            Reply::new(502, json!({})),
            logs("READY", &[]),
        ]);

        watch(&platform, &reporter, DeployKind::Source).await.unwrap();

        assert_eq!(platform.state().count("GET /v2/releases/release-1/build-logs"), 3);
    }

    #[tokio::test]
    async fn image_deploy_outcomes() {
        let platform = MockPlatform::start().await;
        let reporter = RecordingReporter::default();

        platform.state().release_replies.extend([
            Reply::release("DEPLOYING"),
            Reply::new(503, json!({})),
            Reply::release("UNHEALTHY"),
        ]);

        assert!(matches!(
            watch(&platform, &reporter, DeployKind::Image).await,
            Err(DeployError::Unhealthy)
        ));
        assert_eq!(platform.state().count("GET /v1/releases/release-1"), 3);
        assert_eq!(platform.state().count("GET /v2/releases/release-1/build-logs"), 0);

        platform.state().release_replies.push_back(Reply::new(
            200,
            json!({ "release": { "state": "FAILED", "failReason": "disk data not found" } }),
        ));

        match watch(&platform, &reporter, DeployKind::Image).await {
            Err(DeployError::ReleaseFailed(message)) => assert!(message.contains("disk")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interrupt_cancels_once() {
        let platform = MockPlatform::start().await;
        let api = ApiClient::new(&platform.url, "token");
        let reporter = RecordingReporter::default();

        platform
            .state()
            .release_replies
            .push_back(Reply::release("BUILDING"));

        let calls = Cell::new(0);
        let interrupt = || {
            calls.set(calls.get() + 1);
            let first = calls.get() == 1;

            async move {
                if !first {
                    never().await
                }
            }
        };

        let outcome = ReleaseOrchestrator::new(&api, &reporter, Intervals::immediate())
            .watch(RELEASE_ID, DeployKind::Source, interrupt)
            .await;

        assert!(matches!(outcome, Err(DeployError::Interrupted)));
        assert_eq!(calls.get(), 2);
        assert_eq!(platform.state().count("POST /v2/releases/release-1/cancel"), 1);
        assert!(reporter.printed("The release was canceled."));
    }

    #[tokio::test]
    async fn cancellation_attempts_are_bounded() {
        let platform = MockPlatform::start().await;
        let api = ApiClient::new(&platform.url, "token");
        let reporter = RecordingReporter::default();

        platform.state().cancel_replies.extend([
            Reply::new(500, json!({})),
            Reply::new(500, json!({})),
            Reply::new(500, json!({})),
            Reply::new(200, json!({})),
        ]);

        let calls = Cell::new(0);
        let interrupt = || {
            calls.set(calls.get() + 1);
            let first = calls.get() == 1;

            async move {
                if !first {
                    never().await
                }
            }
        };

        let outcome = ReleaseOrchestrator::new(&api, &reporter, Intervals::immediate())
            .watch(RELEASE_ID, DeployKind::Image, interrupt)
            .await;

        assert!(matches!(outcome, Err(DeployError::Interrupted)));
        assert_eq!(platform.state().count("POST /v2/releases/release-1/cancel"), 3);
        assert!(reporter.printed("Unable to cancel the release"));
    }

    #[tokio::test]
    async fn second_interrupt_stops_waiting() {
        let platform = MockPlatform::start().await;
        let api = ApiClient::new(&platform.url, "token");
        let reporter = RecordingReporter::default();

        let outcome = ReleaseOrchestrator::new(&api, &reporter, Intervals::immediate())
            .watch(RELEASE_ID, DeployKind::Image, || async {})
            .await;

        assert!(matches!(outcome, Err(DeployError::Interrupted)));
        assert!(platform.state().count("POST /v2/releases/release-1/cancel") <= 1);
    }
}
