//! # Platforms
//!
//! A platform decides how the remote builder treats the uploaded source bundle.
//! It can be passed explicitly, stored in `liara.json` or detected from the files
//! present in the project directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported deployment platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Platform {
    /// Node.js application started with `npm start`.
    #[display(fmt = "node")]
    Node,

    /// Next.js application.
    #[display(fmt = "nextjs")]
    Nextjs,

    /// Laravel application.
    #[display(fmt = "laravel")]
    Laravel,

    /// Plain PHP application.
    #[display(fmt = "php")]
    Php,

    /// Django application.
    #[display(fmt = "django")]
    Django,

    /// Flask application.
    #[display(fmt = "flask")]
    Flask,

    /// Generic Python application.
    #[display(fmt = "python")]
    Python,

    /// .NET application.
    #[display(fmt = "netcore")]
    Netcore,

    /// Go application.
    #[display(fmt = "go")]
    Go,

    /// React single page application.
    #[display(fmt = "react")]
    React,

    /// Angular single page application.
    #[display(fmt = "angular")]
    Angular,

    /// Vue single page application.
    #[display(fmt = "vue")]
    Vue,

    /// Static files served as-is.
    #[display(fmt = "static")]
    Static,

    /// Project built from its own Dockerfile.
    #[display(fmt = "docker")]
    Docker,
}

impl Platform {
    /// Parse a platform name as reported by the platform API.
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(name, true).ok()
    }

    /// Port the platform's runtime listens on unless configured otherwise.
    ///
    /// Docker images may listen anywhere, so there is no default for them.
    pub(crate) fn default_port(self) -> Option<u16> {
        match self {
            Platform::Node | Platform::Nextjs => Some(3000),
            Platform::Docker => None,
            _ => Some(80),
        }
    }

    /// Additional ignore patterns for directories the builder recreates on its own.
    pub(crate) fn ignore_patterns(self) -> &'static [&'static str] {
        match self {
            Platform::Django | Platform::Flask | Platform::Python => {
                &["venv", ".venv", "env", "__pycache__", "*.pyc"]
            }
            Platform::Laravel | Platform::Php => &["vendor"],
            Platform::Nextjs => &[".next"],
            Platform::Netcore => &["bin", "obj"],
            _ => &[],
        }
    }
}

/// Detect the platform from well-known files in the project root.
///
/// Language manifests take priority over a `Dockerfile`, which in turn takes
/// priority over a bare `index.html`.
pub(crate) fn detect(path: &Path) -> Option<Platform> {
    if let Some(package) = read_json(&path.join("package.json")) {
        let uses_next = ["dependencies", "devDependencies"]
            .iter()
            .any(|section| package[section].get("next").is_some());

        return Some(if uses_next {
            Platform::Nextjs
        } else {
            Platform::Node
        });
    }

    if let Some(composer) = read_json(&path.join("composer.json")) {
        return Some(if composer["require"].get("laravel/framework").is_some() {
            Platform::Laravel
        } else {
            Platform::Php
        });
    }

    if let Ok(requirements) = fs::read_to_string(path.join("requirements.txt")) {
        let requirements = requirements.to_lowercase();

        return Some(if requirements.contains("django") {
            Platform::Django
        } else if requirements.contains("flask") {
            Platform::Flask
        } else {
            Platform::Python
        });
    }

    if path.join("go.mod").is_file() {
        return Some(Platform::Go);
    }

    if has_extension(path, "csproj") {
        return Some(Platform::Netcore);
    }

    if path.join("Dockerfile").is_file() {
        return Some(Platform::Docker);
    }

    if path.join("index.html").is_file() {
        return Some(Platform::Static);
    }

    None
}

/// Path of the `package.json` file inside of a project.
pub(crate) fn package_json(path: &Path) -> PathBuf {
    path.join("package.json")
}

/// Read and parse a JSON file, ignoring any errors.
fn read_json(path: &Path) -> Option<Value> {
    serde_json::from_str(&fs::read_to_string(path).ok()?).ok()
}

/// Check if the directory contains any file with the provided extension.
fn has_extension(path: &Path, extension: &str) -> bool {
    fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .any(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some(extension))
        })
        .unwrap_or(false)
}
