/// `deploy` subcommand.
mod deploy;

pub(crate) use deploy::deploy;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    config::{BuildLocation, Disk},
    platform::Platform,
};

/// CLI configuration.
#[derive(Parser)]
#[command(about, version)]
pub(crate) struct Cli {
    /// Show debug logs and full error details.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Deploy the project or a pre-built image.
    Deploy(Deploy),
}

/// `deploy` subcommand configuration.
#[derive(Args)]
pub struct Deploy {
    /// Project directory, defaults to the current one.
    #[arg(long)]
    path: Option<PathBuf>,

    /// Deployment platform, detected automatically if omitted.
    #[arg(long)]
    platform: Option<Platform>,

    /// App name.
    #[arg(long)]
    app: Option<String>,

    /// Port the app listens on.
    #[arg(long)]
    port: Option<u16>,

    /// Pre-built image to deploy instead of the project sources.
    #[arg(long)]
    image: Option<String>,

    /// Don't wait for the release to finish.
    #[arg(long)]
    detach: bool,

    /// Don't suggest following app logs after a successful deployment.
    #[arg(long)]
    no_app_logs: bool,

    /// Space-separated arguments passed to the app command.
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Docker build argument in the `KEY=VALUE` format.
    #[arg(long = "build-arg")]
    build_args: Vec<String>,

    /// Release message.
    #[arg(short, long)]
    message: Option<String>,

    /// Disk mount in the `name:mountPath` format.
    #[arg(long)]
    disks: Vec<Disk>,

    /// Build without reusing cached layers.
    #[arg(long)]
    no_cache: bool,

    /// Path to a custom Dockerfile.
    #[arg(long)]
    dockerfile: Option<String>,

    /// Region where the project is built.
    #[arg(long)]
    build_location: Option<BuildLocation>,

    /// API token, overrides the stored one.
    #[arg(long)]
    api_token: Option<String>,

    /// Account region, overrides the stored one.
    #[arg(long)]
    region: Option<String>,
}
