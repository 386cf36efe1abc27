use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::ValueEnum;
use derive_more::{Display, Error, From};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::platform::Platform;

/// Name of the project configuration file.
pub(crate) const PROJECT_CONFIG_FILE: &str = "liara.json";

/// Authentication configuration errors.
#[derive(Debug, Display, From, Error)]
pub enum AuthenticationConfigError {
    /// Unable to load the configuration using [`figment`].
    Figment(figment::Error),

    /// API token was not provided anywhere.
    #[display(
        fmt = "API token is missing. Pass it with --api-token or set the LIARA_API_TOKEN environment variable."
    )]
    MissingToken,

    /// User's home directory cannot be determined.
    #[display(fmt = "unable to find home directory")]
    HomeDirNotFound,
}

/// Primary authentication config.
#[derive(Serialize, Deserialize)]
pub struct AuthenticationConfig {
    /// API token.
    api_token: String,

    /// Account region, used to pick the API server.
    #[serde(default)]
    region: Option<String>,

    /// Custom API server path, takes priority over the region.
    #[serde(default)]
    server_path: Option<String>,
}

/// API server path of the Iran region, used by default.
const IRAN_SERVER_PATH: &str = "https://api.iran.liara.ir";

/// API server path of the Germany region.
const GERMANY_SERVER_PATH: &str = "https://api.liara.ir";

impl AuthenticationConfig {
    /// Create new authentication config using the default configuration file,
    /// environment variables and command line flags, in that order of priority.
    ///
    /// See [`Env`] for more details on how to use environment variables configuration.
    pub fn new(
        api_token: Option<String>,
        region: Option<String>,
        server_path: Option<String>,
    ) -> Result<Self, AuthenticationConfigError> {
        let mut figment = Figment::new()
            .merge(Toml::file(Self::config_path()?))
            .merge(Env::prefixed("LIARA_").only(&["api_token", "region", "server_path"]));

        if let Some(api_token) = api_token {
            figment = figment.merge(("api_token", api_token));
        }

        if let Some(region) = region {
            figment = figment.merge(("region", region));
        }

        if let Some(server_path) = server_path {
            figment = figment.merge(("server_path", server_path));
        }

        figment.extract().map_err(|error: figment::Error| {
            if error.missing() {
                AuthenticationConfigError::MissingToken
            } else {
                error.into()
            }
        })
    }

    /// Get API token from the current configuration.
    pub fn token(&self) -> &str {
        &self.api_token
    }

    /// Get API server path from the current configuration.
    pub fn server_path(&self) -> &str {
        match (&self.server_path, self.region.as_deref()) {
            (Some(server_path), _) => server_path,
            (None, Some("germany")) => GERMANY_SERVER_PATH,
            (None, _) => IRAN_SERVER_PATH,
        }
    }

    /// Get authentication configuration storage path.
    ///
    /// Returns [`Err`] if home directory cannot be determined.
    fn config_path() -> Result<PathBuf, AuthenticationConfigError> {
        let mut home_dir = home::home_dir().ok_or(AuthenticationConfigError::HomeDirNotFound)?;
        home_dir.push(".liara/auth.toml");
        Ok(home_dir)
    }
}

/// Project configuration errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ProjectConfigError {
    /// IO-related error.
    Io(io::Error),

    /// `liara.json` is not a valid JSON document.
    #[display(fmt = "{} has a syntax error: {}", PROJECT_CONFIG_FILE, _0)]
    Syntax(serde_json::Error),

    /// `build.cache` has a value of a non-boolean type.
    #[display(fmt = "`build.cache` field in {} must be a boolean.", PROJECT_CONFIG_FILE)]
    CacheNotBoolean,

    /// Merged configuration has values of incorrect types.
    #[display(fmt = "invalid deployment configuration: {}", _0)]
    Figment(figment::Error),
}

/// Named disk mounted into the app container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Disk {
    /// Disk name.
    pub name: String,

    /// Mount path inside of the container.
    pub mount_to: String,
}

impl FromStr for Disk {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((name, mount_to)) if !name.is_empty() && !mount_to.is_empty() => Ok(Self {
                name: name.to_string(),
                mount_to: mount_to.to_string(),
            }),
            _ => Err(format!(
                "invalid disk `{value}`, expected the `name:mountPath` format"
            )),
        }
    }
}

/// Region where the source bundle is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum BuildLocation {
    /// Builders located in Iran.
    #[display(fmt = "iran")]
    Iran,

    /// Builders located in Germany.
    #[display(fmt = "germany")]
    Germany,
}

/// Health check command, written either as a single line or as separate arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum HealthCheckCommand {
    /// Space-separated command line.
    Line(String),

    /// Command split into arguments.
    Args(Vec<String>),
}

impl HealthCheckCommand {
    /// Normalize the command into separate arguments.
    pub(crate) fn to_args(&self) -> Vec<String> {
        match self {
            HealthCheckCommand::Line(line) => line
                .split(' ')
                .filter(|arg| !arg.is_empty())
                .map(String::from)
                .collect(),
            HealthCheckCommand::Args(args) => args.clone(),
        }
    }
}

/// Container health check configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealthCheck {
    /// Command executed inside of the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<HealthCheckCommand>,

    /// Delay between checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    /// Time after which a single check is considered failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Consecutive failures required to mark the container unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u64>,

    /// Grace period after the container start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<u64>,
}

/// Build options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BuildConfig {
    /// Reuse cached build layers.
    #[serde(default = "default_cache")]
    pub cache: bool,

    /// Docker build arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Custom Dockerfile path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Build region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<BuildLocation>,
}

/// Build cache is enabled unless disabled explicitly.
fn default_cache() -> bool {
    true
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache: default_cache(),
            args: Vec::new(),
            dockerfile: None,
            location: None,
        }
    }
}

/// Deployment configuration, merged from defaults, `liara.json` and command line flags.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeploymentConfig {
    /// Project directory.
    #[serde(skip)]
    pub path: PathBuf,

    /// App name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,

    /// Deployment platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Port the app listens on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Pre-built image reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Disks mounted into the container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    /// Arguments passed to the app command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Build options.
    #[serde(default)]
    pub build: BuildConfig,

    /// Custom Dockerfile path, used when `build.dockerfile` is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// Cron jobs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron: Vec<String>,

    /// Container health check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    /// Release message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Return right after the release is created.
    #[serde(skip)]
    pub detach: bool,

    /// Don't suggest following application logs after a successful deployment.
    #[serde(skip)]
    pub no_app_logs: bool,

    /// Raw `liara.json` contents, used to extract platform-specific sections.
    #[serde(skip)]
    pub project_file: Map<String, Value>,
}

/// Build options passed with command line flags.
#[derive(Default, Serialize)]
pub(crate) struct BuildOverrides {
    /// `--no-cache` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,

    /// `--build-arg` flags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// `--dockerfile` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    /// `--build-location` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<BuildLocation>,
}

/// Deployment options passed with command line flags.
///
/// Only the flags that were actually provided get serialized, so that
/// they don't override values from `liara.json` with empty ones.
#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Overrides {
    /// `--app` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,

    /// `--platform` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// `--port` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// `--image` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// `--disks` flags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    /// `--args` flag.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// `--message` flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Build-related flags.
    pub build: BuildOverrides,
}

impl DeploymentConfig {
    /// Load deployment configuration for the project located at `path`.
    pub(crate) fn load(path: &Path, overrides: &Overrides) -> Result<Self, ProjectConfigError> {
        let project_file = read_project_file(path)?;

        let mut config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Serialized::defaults(&project_file))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        config.path = path.to_path_buf();
        config.project_file = project_file;

        Ok(config)
    }

    /// Dockerfile path, preferring `build.dockerfile`.
    pub(crate) fn dockerfile(&self) -> Option<&str> {
        self.build
            .dockerfile
            .as_deref()
            .or(self.dockerfile.as_deref())
    }

    /// Platform-specific `liara.json` section, such as `"node": { ... }`.
    pub(crate) fn platform_config(&self, platform: Platform) -> Value {
        self.project_file
            .get(&platform.to_string())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

/// Read `liara.json` from the project directory, if present.
///
/// Type of the `build.cache` value is checked here, since otherwise
/// it would be reported as a generic configuration error.
fn read_project_file(path: &Path) -> Result<Map<String, Value>, ProjectConfigError> {
    let contents = match fs::read_to_string(path.join(PROJECT_CONFIG_FILE)) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(error) => return Err(error.into()),
    };

    let project_file: Map<String, Value> = serde_json::from_str(&contents)?;

    if let Some(cache) = project_file.get("build").and_then(|build| build.get("cache")) {
        if !cache.is_boolean() {
            return Err(ProjectConfigError::CacheNotBoolean);
        }
    }

    Ok(project_file)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::{
        AuthenticationConfig, BuildLocation, BuildOverrides, DeploymentConfig, Disk,
        HealthCheckCommand, Overrides, ProjectConfigError,
    };
    use crate::platform::Platform;

    fn project(config: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("liara.json"), config).unwrap();
        dir
    }

    #[test]
    fn server_path_selection() {
        let config = |region: Option<&str>, server_path: Option<&str>| AuthenticationConfig {
            api_token: String::from("token"),
            region: region.map(String::from),
            server_path: server_path.map(String::from),
        };

        assert_eq!(config(None, None).server_path(), "https://api.iran.liara.ir");
        assert_eq!(config(Some("iran"), None).server_path(), "https://api.iran.liara.ir");
        assert_eq!(config(Some("germany"), None).server_path(), "https://api.liara.ir");
        assert_eq!(
            config(Some("germany"), Some("http://localhost:8080")).server_path(),
            "http://localhost:8080"
        );
    }

    #[test]
    fn defaults_without_project_file() {
        let dir = TempDir::new().unwrap();

        let config = DeploymentConfig::load(dir.path(), &Overrides::default()).unwrap();

        assert_eq!(config.app, None);
        assert!(config.build.cache);
        assert!(config.disks.is_empty());
        assert_eq!(config.path, dir.path());
    }

    #[test]
    fn flags_override_project_file() {
        let dir = project(
            r#"{
                "app": "from-file",
                "platform": "node",
                "port": 3000,
                "disks": [{"name": "media", "mountTo": "/media"}],
                "build": {"cache": true, "location": "iran", "args": ["A=1"]},
                "node": {"version": "18"}
            }"#,
        );

        let overrides = Overrides {
            app: Some(String::from("from-flag")),
            build: BuildOverrides {
                cache: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = DeploymentConfig::load(dir.path(), &overrides).unwrap();

        assert_eq!(config.app.as_deref(), Some("from-flag"));
        assert_eq!(config.platform, Some(Platform::Node));
        assert_eq!(config.port, Some(3000));
        assert_eq!(config.disks, ["media:/media".parse::<Disk>().unwrap()]);
        assert!(!config.build.cache);
        assert_eq!(config.build.location, Some(BuildLocation::Iran));
        assert_eq!(config.build.args, ["A=1"]);
        assert_eq!(config.platform_config(Platform::Node)["version"], "18");
        assert_eq!(config.platform_config(Platform::Php), serde_json::json!({}));
    }

    #[test]
    fn syntax_error() {
        let dir = project(r#"{"app": "broken",}"#);

        assert!(matches!(
            DeploymentConfig::load(dir.path(), &Overrides::default()),
            Err(ProjectConfigError::Syntax(_))
        ));
    }

    #[test]
    fn cache_must_be_boolean() {
        let dir = project(r#"{"build": {"cache": "yes"}}"#);

        assert!(matches!(
            DeploymentConfig::load(dir.path(), &Overrides::default()),
            Err(ProjectConfigError::CacheNotBoolean)
        ));
    }

    #[test]
    fn dockerfile_fallback() {
        let dir = project(r#"{"dockerfile": "docker/Dockerfile.prod"}"#);
        let config = DeploymentConfig::load(dir.path(), &Overrides::default()).unwrap();
        assert_eq!(config.dockerfile(), Some("docker/Dockerfile.prod"));

        let overrides = Overrides {
            build: BuildOverrides {
                dockerfile: Some(String::from("Dockerfile.dev")),
                ..Default::default()
            },
            ..Default::default()
        };
        let config = DeploymentConfig::load(dir.path(), &overrides).unwrap();
        assert_eq!(config.dockerfile(), Some("Dockerfile.dev"));
    }

    #[test]
    fn disk_format() {
        assert_eq!(
            "data:/meili_data".parse::<Disk>(),
            Ok(Disk {
                name: String::from("data"),
                mount_to: String::from("/meili_data"),
            })
        );
        assert!("data".parse::<Disk>().is_err());
        assert!(":/data".parse::<Disk>().is_err());
    }

    #[test]
    fn health_check_command_forms() {
        assert_eq!(
            HealthCheckCommand::Line(String::from("curl  -f http://localhost")).to_args(),
            ["curl", "-f", "http://localhost"]
        );
        assert_eq!(
            HealthCheckCommand::Args(vec![String::from("pg_isready")]).to_args(),
            ["pg_isready"]
        );
    }
}
