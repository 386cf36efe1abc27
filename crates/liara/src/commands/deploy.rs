use std::env;

use tracing::warn;

use crate::{
    api::ApiClient,
    commands::Deploy,
    config::{AuthenticationConfig, BuildOverrides, DeploymentConfig, Overrides},
    error::DeployError,
    pipeline,
    prompt::ConsolePrompt,
    release::Intervals,
    reporter::ConsoleReporter,
};

/// Deployment flow entrypoint.
pub(crate) async fn deploy(
    Deploy {
        path,
        platform,
        app,
        port,
        image,
        detach,
        no_app_logs,
        args,
        build_args,
        message,
        disks,
        no_cache,
        dockerfile,
        build_location,
        api_token,
        region,
    }: Deploy,
) -> Result<(), DeployError> {
    let path = match path {
        Some(path) => path,
        None => env::current_dir()?,
    };

    let overrides = Overrides {
        app,
        platform,
        port,
        image,
        disks,
        args: args
            .map(|args| args.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        message,
        build: BuildOverrides {
            cache: no_cache.then_some(false),
            args: build_args,
            dockerfile,
            location: build_location,
        },
    };

    let mut config = DeploymentConfig::load(&path, &overrides)?;
    config.detach = detach;
    config.no_app_logs = no_app_logs;

    let auth_config = AuthenticationConfig::new(api_token, region, None)?;
    let api = ApiClient::new(auth_config.server_path(), auth_config.token());

    let deployment = pipeline::prepare(&api, config, &ConsolePrompt).await?;

    let reporter = ConsoleReporter::new();

    pipeline::deploy(
        &api,
        &reporter,
        &deployment,
        Intervals::default(),
        interrupted,
    )
    .await
}

/// Resolve once the user presses Ctrl+C.
///
/// If interrupts can't be observed, never resolves.
async fn interrupted() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "unable to listen for interrupts");
        std::future::pending::<()>().await;
    }
}
