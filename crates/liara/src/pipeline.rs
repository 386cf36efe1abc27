//! # Deployment pipeline
//!
//! A deployment goes through the following stages:
//!
//! 1. Configuration is validated and completed with detected or prompted values.
//! 2. Project files are collected and archived into a temporary source bundle.
//! 3. The bundle is uploaded, and the temporary file is removed right after.
//! 4. A release is created. If the platform reports missing source contents,
//!    only those contents are uploaded again and the release creation is retried once.
//! 5. The release is followed until it reaches a terminal state, unless detached.
//!
//! Image deploys skip stages 2 and 3.

use std::future::Future;

use byte_unit::n_mib_bytes;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, ApiError, Domain, ReleaseRequest},
    archiver::{build_archive, build_partial_archive},
    collector::{collect, ContentMap},
    config::{BuildConfig, DeploymentConfig, HealthCheck, HealthCheckCommand},
    error::DeployError,
    git,
    platform::{self, Platform},
    preflight,
    prompt::Prompt,
    release::{DeployKind, Intervals, ReleaseOrchestrator},
    reporter::{human_size, Reporter},
    upload::upload,
};

/// Maximum size of a compressed source bundle.
pub(crate) const MAX_SOURCE_SIZE: u64 = n_mib_bytes!(256) as u64;

/// Fully resolved deployment.
#[derive(Debug)]
pub(crate) struct Deployment {
    /// App name.
    pub app: String,

    /// Deployment platform.
    pub platform: Platform,

    /// Port the app listens on.
    pub port: u16,

    /// Merged deployment configuration.
    pub config: DeploymentConfig,
}

impl Deployment {
    /// Kind of the deployment.
    fn kind(&self) -> DeployKind {
        if self.config.image.is_some() {
            DeployKind::Image
        } else {
            DeployKind::Source
        }
    }
}

/// Uploaded source bundle.
struct Source {
    /// Stored bundle identifier.
    id: String,

    /// Project contents, used to upload missing files.
    contents: ContentMap,
}

/// Validate the configuration and resolve values that were not configured explicitly.
pub(crate) async fn prepare(
    api: &ApiClient,
    config: DeploymentConfig,
    prompt: &dyn Prompt,
) -> Result<Deployment, DeployError> {
    preflight::validate(&config)?;

    let app = match &config.app {
        Some(app) => app.clone(),
        None => prompt.input("Enter the app name:")?,
    };

    let platform = match (&config.image, config.platform) {
        (Some(_), _) => Platform::Docker,
        (None, Some(platform)) => platform,
        (None, None) => match platform::detect(&config.path) {
            Some(platform) => platform,
            None => project_platform(api, &app).await?,
        },
    };

    preflight::check_platform(&config, platform)?;

    let port = match config.port.or_else(|| platform.default_port()) {
        Some(port) => port,
        None => {
            let port = prompt.input("Enter the port your app listens on:")?;

            port.parse().map_err(|_| {
                DeployError::Validation(format!(
                    "Invalid port `{port}`, expected a number between 1 and 65535."
                ))
            })?
        }
    };

    Ok(Deployment {
        app,
        platform,
        port,
        config,
    })
}

/// Platform the project was created with.
async fn project_platform(api: &ApiClient, app: &str) -> Result<Platform, DeployError> {
    let project = api.project(app).await?;

    project
        .platform
        .as_deref()
        .and_then(Platform::from_name)
        .ok_or_else(|| {
            DeployError::Validation(String::from(
                "Unable to detect the platform of the project. Pass it with --platform.",
            ))
        })
}

/// Deploy the prepared project.
pub(crate) async fn deploy<F, Fut>(
    api: &ApiClient,
    reporter: &dyn Reporter,
    deployment: &Deployment,
    intervals: Intervals,
    mut interrupt: F,
) -> Result<(), DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let Deployment { app, config, .. } = deployment;

    print_summary(reporter, deployment);

    let source = match deployment.kind() {
        DeployKind::Source => {
            Some(interruptible(upload_project(api, reporter, deployment), interrupt()).await?)
        }
        DeployKind::Image => None,
    };

    let request = ReleaseRequest {
        port: deployment.port,
        platform: deployment.platform.to_string(),
        image: config.image.clone(),
        source_id: source.as_ref().map(|source| source.id.clone()),
        build: BuildConfig {
            dockerfile: config.dockerfile().map(String::from),
            ..config.build.clone()
        },
        disks: config.disks.clone(),
        args: config.args.clone(),
        message: config.message.clone(),
        cron: config.cron.clone(),
        platform_config: config.platform_config(deployment.platform),
        git_info: git::git_info(&config.path).await,
        health_check: config.health_check.as_ref().map(|health_check| HealthCheck {
            command: health_check
                .command
                .as_ref()
                .map(|command| HealthCheckCommand::Args(command.to_args())),
            ..health_check.clone()
        }),
    };

    reporter.phase("Creating a new release...");

    let release_id = match (api.create_release(app, &request).await, &source) {
        (Err(ApiError::MissingFiles(missing)), Some(source)) => {
            info!(count = missing.len(), "platform requested missing source contents");

            interruptible(
                upload_missing(api, reporter, app, &source.contents, &missing),
                interrupt(),
            )
            .await?;

            reporter.phase("Creating a new release...");
            api.create_release(app, &request).await?
        }
        (result, _) => result?,
    };

    info!(%release_id, "release created");

    if config.detach {
        reporter.finish("Deployment created successfully.");
        return Ok(());
    }

    ReleaseOrchestrator::new(api, reporter, intervals)
        .watch(&release_id, deployment.kind(), interrupt)
        .await?;

    print_urls(api, reporter, app).await;

    if !config.no_app_logs {
        reporter.println(&format!("Run `liara logs --app {app}` to see the app logs."));
    }

    reporter.finish("Deployment finished successfully.");

    Ok(())
}

/// Run a deployment stage until it completes or the user interrupts it.
///
/// An interrupted stage is dropped, which removes its temporary archive.
async fn interruptible<T>(
    stage: impl Future<Output = Result<T, DeployError>>,
    interrupt: impl Future<Output = ()>,
) -> Result<T, DeployError> {
    tokio::select! {
        result = stage => result,
        () = interrupt => {
            warn!("interrupted before the release was created");
            Err(DeployError::Interrupted)
        }
    }
}

/// Print the resolved deployment configuration.
fn print_summary(reporter: &dyn Reporter, deployment: &Deployment) {
    let config = &deployment.config;

    reporter.println(&format!("App: {}", deployment.app));

    match &config.image {
        Some(image) => reporter.println(&format!("Image: {image}")),
        None => reporter.println(&format!("Path: {}", config.path.display())),
    }

    reporter.println(&format!("Platform: {}", deployment.platform));
    reporter.println(&format!("Port: {}", deployment.port));

    if !config.disks.is_empty() {
        reporter.println("Disks:");

        for disk in &config.disks {
            reporter.println(&format!("  {} -> {}", disk.name, disk.mount_to));
        }
    }
}

/// Collect, archive and upload the project.
async fn upload_project(
    api: &ApiClient,
    reporter: &dyn Reporter,
    deployment: &Deployment,
) -> Result<Source, DeployError> {
    let path = &deployment.config.path;

    reporter.phase("Collecting project files...");

    let collection = collect(path, Some(deployment.platform)).await?;

    debug!(
        files = collection.files.len(),
        directories = collection.directories.len(),
        contents = collection.contents.len(),
        "project files collected"
    );

    reporter.phase("Creating an archive...");

    let archive = NamedTempFile::new()?;

    let result: Result<String, DeployError> = async {
        let size = build_archive(archive.path(), path, Some(deployment.platform))?;

        reporter.println(&format!("Compressed size: {}", human_size(size)));

        if size > MAX_SOURCE_SIZE {
            return Err(DeployError::SourceTooLarge(size));
        }

        upload(api, &deployment.app, archive.path(), reporter)
            .await
            .map_err(DeployError::from)
    }
    .await;

    remove_archive(archive);

    Ok(Source {
        id: result?,
        contents: collection.contents,
    })
}

/// Upload source contents the platform reported as missing.
async fn upload_missing(
    api: &ApiClient,
    reporter: &dyn Reporter,
    app: &str,
    contents: &ContentMap,
    missing: &[String],
) -> Result<(), DeployError> {
    reporter.phase("Uploading missing files...");

    let archive = NamedTempFile::new()?;

    let result: Result<String, DeployError> = async {
        build_partial_archive(archive.path(), contents, missing)?;

        upload(api, app, archive.path(), reporter)
            .await
            .map_err(DeployError::from)
    }
    .await;

    remove_archive(archive);

    result.map(|source_id| debug!(%source_id, "missing files uploaded"))
}

/// Remove a temporary archive, logging failures.
fn remove_archive(archive: NamedTempFile) {
    let path = archive.path().to_path_buf();

    if let Err(error) = archive.close() {
        warn!(%error, path = %path.display(), "unable to remove temporary archive");
    }
}

/// Print URLs the deployed app is reachable at.
async fn print_urls(api: &ApiClient, reporter: &dyn Reporter, app: &str) {
    let mut urls = vec![format!("https://{app}.liara.run")];

    match api.domains(app).await {
        Ok(domains) => urls.extend(domains.iter().map(Domain::url)),
        Err(error) => warn!(%error, "unable to fetch custom domains"),
    }

    reporter.println("The app is available at:");

    for url in urls {
        reporter.println(&format!("  {url}"));
    }
}
