//! # Pre-flight checks
//!
//! Configuration problems are reported before any request reaches the platform,
//! so that malformed local input never leaves half-created releases behind.

use std::{fs, path::Path};

use serde_json::Value;

use crate::{config::DeploymentConfig, error::DeployError, platform::{self, Platform}};

/// Error message of a health check declared without a command.
pub(crate) const HEALTH_CHECK_COMMAND_REQUIRED: &str =
    "`command` field in healthCheck is required.";

/// Error message of a Node.js project without a `start` script.
pub(crate) const NODE_START_SCRIPT_REQUIRED: &str = "A NodeJS app must be runnable with 'npm start'. \
     Add a `start` command to the `scripts` section of package.json.";

/// Validate the deployment configuration.
pub(crate) fn validate(config: &DeploymentConfig) -> Result<(), DeployError> {
    if config.image.is_none() && is_empty_dir(&config.path) {
        return Err(DeployError::EmptyProject(config.path.clone()));
    }

    if let Some(health_check) = &config.health_check {
        let has_command = health_check
            .command
            .as_ref()
            .map_or(false, |command| !command.to_args().is_empty());

        if !has_command {
            return Err(DeployError::Validation(String::from(
                HEALTH_CHECK_COMMAND_REQUIRED,
            )));
        }
    }

    Ok(())
}

/// Run checks specific to the deployment platform.
pub(crate) fn check_platform(
    config: &DeploymentConfig,
    platform: Platform,
) -> Result<(), DeployError> {
    if config.image.is_some() {
        return Ok(());
    }

    match platform {
        Platform::Node => {
            let package = fs::read_to_string(platform::package_json(&config.path))
                .ok()
                .and_then(|contents| serde_json::from_str::<Value>(&contents).ok());

            let has_start_script = package
                .as_ref()
                .and_then(|package| package["scripts"]["start"].as_str())
                .map_or(false, |script| !script.trim().is_empty());

            if !has_start_script {
                return Err(DeployError::Validation(String::from(
                    NODE_START_SCRIPT_REQUIRED,
                )));
            }
        }
        Platform::Docker => {
            let dockerfile = config.dockerfile().unwrap_or("Dockerfile");

            if !config.path.join(dockerfile).is_file() {
                return Err(DeployError::Validation(format!(
                    "{dockerfile} not found. Add it to the project, or pass its path with --dockerfile."
                )));
            }
        }
        _ => {}
    }

    Ok(())
}

/// Check if the directory doesn't exist or has no entries.
fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
