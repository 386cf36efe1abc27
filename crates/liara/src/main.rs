//! # Liara deployment client
//!
//! Deploys a project directory, or a pre-built image, to the Liara platform.
//!
//! Project files are filtered with ignore files, packed into a source bundle and
//! uploaded, after which a release is created and followed until it either
//! serves traffic or fails.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

use std::process::ExitCode;

use clap::Parser;
use commands::{Cli, Commands};
use common::config::Logging;
use error::DeployError;
use figment::{providers::Env, Figment};

/// Platform API client.
mod api;

/// Source bundle archiving utilities.
mod archiver;

/// Project file collection.
mod collector;

/// CLI subcommands.
mod commands;

/// CLI-specific configuration (authentication, project).
mod config;

/// Deployment error taxonomy.
mod error;

/// Ignore file handling.
mod filter;

/// Version control details.
mod git;

/// Deployment flow.
mod pipeline;

/// Platform detection.
mod platform;

/// Fixed-delay polling.
mod poller;

/// Pre-flight configuration checks.
mod preflight;

/// Interactive input.
mod prompt;

/// Release state tracking.
mod release;

/// User-facing output.
mod reporter;

/// Source bundle upload.
mod upload;

/// Test doubles.
#[cfg(test)]
mod testing;

/// CLI entrypoint.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = if cli.debug {
        Logging::debug()
    } else {
        Figment::new()
            .merge(Env::prefixed("LIARA_LOG_"))
            .extract::<Logging>()
            .unwrap_or_default()
    };

    common::logging::init(&logging);

    let result: Result<(), anyhow::Error> = match cli.command {
        Commands::Deploy(args) => commands::deploy(args).await.map_err(Into::into),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            if cli.debug {
                eprintln!("Error: {error:?}");
            } else {
                eprintln!("Error: {error}");
            }

            let code = error
                .downcast_ref::<DeployError>()
                .map_or(1, DeployError::exit_code);

            ExitCode::from(code)
        }
    }
}
