use std::{io, path::PathBuf};

use derive_more::{Display, Error, From};

use crate::{
    api::ApiError,
    archiver::ArchiverError,
    collector::CollectError,
    config::{AuthenticationConfigError, ProjectConfigError},
    prompt::PromptError,
    reporter::human_size,
    upload::UploadError,
};

/// Exit code used when interactive input is required, but no TTY is available.
pub(crate) const NO_TTY_EXIT_CODE: u8 = 3;

/// Exit code used when the user canceled the deployment.
pub(crate) const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Deployment errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum DeployError {
    /// `liara.json` is not a valid JSON document.
    #[display(fmt = "liara.json has a syntax error: {}", _0)]
    ConfigSyntax(serde_json::Error),

    /// Invalid configuration or flag combination.
    #[from(ignore)]
    Validation(#[error(not(source))] String),

    /// Project directory is missing or empty.
    #[display(
        fmt = "Project directory {} is empty or doesn't exist. Use --path to select another directory.",
        "_0.display()"
    )]
    #[from(ignore)]
    EmptyProject(#[error(not(source))] PathBuf),

    /// Every project file is excluded by some ignore rule.
    #[display(
        fmt = "All files of the project are ignored. Check your .liaraignore, .dockerignore and .gitignore files."
    )]
    AllFilesIgnored,

    /// Compressed source bundle exceeds the upload limit.
    #[display(
        fmt = "Source bundle is {}, which exceeds the {} limit. Add unneeded files and directories to .liaraignore.",
        "human_size(*_0)",
        "human_size(crate::pipeline::MAX_SOURCE_SIZE)"
    )]
    #[from(ignore)]
    SourceTooLarge(#[error(not(source))] u64),

    /// Source bundle upload failed.
    #[display(fmt = "Unable to upload the source bundle. {}", _0)]
    Upload(UploadError),

    /// Builder reported an error.
    #[display(fmt = "Build failed. Fix the errors above and deploy again.")]
    BuildFailed,

    /// Release was canceled on the platform side.
    #[display(fmt = "Build canceled.")]
    BuildCanceled,

    /// Build took longer than the plan allows.
    #[display(
        fmt = "Build timed out. Please upgrade your plan for longer builds, or try again later."
    )]
    BuildTimeout,

    /// Release reached a failed state.
    #[from(ignore)]
    ReleaseFailed(#[error(not(source))] String),

    /// Release was deployed, but health checks fail.
    #[display(
        fmt = "The container was deployed, but it is unhealthy. Check the app logs and the healthCheck configuration."
    )]
    Unhealthy,

    /// Deployment was interrupted by the user.
    #[display(fmt = "Deployment canceled.")]
    Interrupted,

    /// Interactive input is required, but no TTY is available.
    #[display(
        fmt = "Interactive input is required, but no TTY is available. Pass the missing values with flags or liara.json."
    )]
    NoTty,

    /// Platform API error.
    Api(ApiError),

    /// IO-related error.
    Io(io::Error),
}

impl DeployError {
    /// Process exit code matching this error.
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            DeployError::NoTty => NO_TTY_EXIT_CODE,
            DeployError::Interrupted => INTERRUPTED_EXIT_CODE,
            _ => 1,
        }
    }
}

impl From<ProjectConfigError> for DeployError {
    fn from(error: ProjectConfigError) -> Self {
        match error {
            ProjectConfigError::Syntax(error) => DeployError::ConfigSyntax(error),
            ProjectConfigError::Io(error) => DeployError::Io(error),
            error => DeployError::Validation(error.to_string()),
        }
    }
}

impl From<AuthenticationConfigError> for DeployError {
    fn from(error: AuthenticationConfigError) -> Self {
        DeployError::Validation(error.to_string())
    }
}

impl From<PromptError> for DeployError {
    fn from(error: PromptError) -> Self {
        match error {
            PromptError::NoTty => DeployError::NoTty,
            PromptError::Io(error) => DeployError::Io(error),
        }
    }
}

impl From<CollectError> for DeployError {
    fn from(error: CollectError) -> Self {
        match error {
            CollectError::Io(error) => DeployError::Io(error),
            error => DeployError::Io(io::Error::new(io::ErrorKind::Other, error)),
        }
    }
}

impl From<ArchiverError> for DeployError {
    fn from(error: ArchiverError) -> Self {
        match error {
            ArchiverError::AllFilesIgnored => DeployError::AllFilesIgnored,
            ArchiverError::Io(error) => DeployError::Io(error),
            error => DeployError::Io(io::Error::new(io::ErrorKind::Other, error)),
        }
    }
}
