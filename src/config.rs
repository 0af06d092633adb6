//! Session configuration and validation.
//!
//! Configuration files may be YAML or TOML; the format is chosen by file
//! extension. Validation catches mistakes before any sandbox is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Packages the test runner itself needs inside every sandbox.
pub const HARNESS_PACKAGES: &[&str] = &["pytest", "pytest-json-report"];

/// Which sandbox backend realizes the isolated environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Disposable container managed through a docker-compatible CLI.
    #[default]
    Container,
    /// Local directory with its own Python virtual environment.
    Local,
}

/// How to prepare the interpreter environment inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnvironmentSetup {
    /// Interpreter version, e.g. "3.10".
    #[serde(default)]
    pub python: Option<String>,

    /// Shell command run once after packages are installed, e.g. `pip install -e .`.
    #[serde(default)]
    pub install: Option<String>,

    /// Auxiliary packages installed before the install command.
    #[serde(default, alias = "pip_packages")]
    pub packages: Vec<String>,

    /// Extra arguments passed to pytest for both discovery and execution.
    #[serde(default)]
    pub test_args: Vec<String>,
}

impl EnvironmentSetup {
    /// Returns the interpreter executable to create environments with.
    ///
    /// A value containing a path separator is used as-is; a bare version
    /// becomes `python<version>`.
    pub fn interpreter(&self) -> String {
        match self.python.as_deref() {
            Some(p) if p.contains('/') => p.to_string(),
            Some(version) => format!("python{}", version),
            None => "python3".to_string(),
        }
    }

    /// Auxiliary packages followed by the harness packages, deduplicated.
    pub fn all_packages(&self) -> Vec<String> {
        let mut packages = self.packages.clone();
        for pkg in HARNESS_PACKAGES {
            if !packages.iter().any(|p| p == pkg) {
                packages.push((*pkg).to_string());
            }
        }
        packages
    }
}

/// Deadlines for each blocking stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_provision_secs")]
    pub provision_secs: u64,
    #[serde(default = "default_apply_secs")]
    pub apply_secs: u64,
    #[serde(default = "default_discover_secs")]
    pub discover_secs: u64,
    #[serde(default = "default_run_secs")]
    pub run_secs: u64,
    #[serde(default = "default_teardown_secs")]
    pub teardown_secs: u64,
}

fn default_provision_secs() -> u64 {
    1800
}

fn default_apply_secs() -> u64 {
    60
}

fn default_discover_secs() -> u64 {
    300
}

fn default_run_secs() -> u64 {
    1800
}

fn default_teardown_secs() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            provision_secs: default_provision_secs(),
            apply_secs: default_apply_secs(),
            discover_secs: default_discover_secs(),
            run_secs: default_run_secs(),
            teardown_secs: default_teardown_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn provision(&self) -> Duration {
        Duration::from_secs(self.provision_secs)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }

    pub fn discover(&self) -> Duration {
        Duration::from_secs(self.discover_secs)
    }

    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_secs)
    }

    pub fn teardown(&self) -> Duration {
        Duration::from_secs(self.teardown_secs)
    }
}

/// Full configuration for a validation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Sandbox backend.
    #[serde(default)]
    pub backend: BackendKind,

    /// Container image. Defaults to `python:<version>`.
    #[serde(default)]
    pub image: Option<String>,

    /// Container CLI binary (docker, podman).
    #[serde(default)]
    pub container_cli: Option<String>,

    /// Base directory for local sandboxes. Defaults to the system temp dir.
    #[serde(default)]
    pub sandbox_root: Option<PathBuf>,

    /// Fixed sandbox identity. When unset every session gets a fresh one.
    #[serde(default)]
    pub sandbox_name: Option<String>,

    /// Run the baseline suite twice and abort if the results differ.
    #[serde(default)]
    pub verify_baseline: bool,

    #[serde(default)]
    pub setup: EnvironmentSetup,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl SessionConfig {
    /// Loads a configuration file, picking the parser from the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e))),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e))),
            _ => Err(Error::Config(format!(
                "unsupported config format: {}",
                path.display()
            ))),
        }
    }

    /// Returns the container image to use.
    pub fn image(&self) -> String {
        match (&self.image, &self.setup.python) {
            (Some(image), _) => image.clone(),
            (None, Some(version)) if !version.contains('/') => format!("python:{}", version),
            _ => "python:3".to_string(),
        }
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationResult;
}

impl Validate for EnvironmentSetup {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Some(python) = &self.python {
            if python.trim().is_empty() {
                result.add_error("python version cannot be empty");
            }
        }

        if let Some(install) = &self.install {
            if install.trim().is_empty() {
                result.add_error("install command cannot be empty when set");
            }
        }

        for pkg in &self.packages {
            if pkg.trim().is_empty() {
                result.add_error("package names cannot be empty");
            } else if pkg.starts_with('-') {
                result.add_warning(format!("package '{}' looks like a pip flag", pkg));
            }
        }

        result
    }
}

impl Validate for TimeoutConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        for (name, secs) in [
            ("provision", self.provision_secs),
            ("apply", self.apply_secs),
            ("discover", self.discover_secs),
            ("run", self.run_secs),
            ("teardown", self.teardown_secs),
        ] {
            if secs == 0 {
                result.add_error(format!("{} timeout must be greater than zero", name));
            }
        }

        if self.run_secs > 4 * 3600 {
            result.add_warning("run timeout over 4 hours may indicate a misconfiguration");
        }

        result
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        result.merge(self.setup.validate());
        result.merge(self.timeouts.validate());

        if let Some(name) = &self.sandbox_name {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
            if !valid {
                result.add_error(format!(
                    "sandbox_name '{}' may only contain letters, digits, '-', '_' and '.'",
                    name
                ));
            } else {
                result.add_warning(
                    "fixed sandbox_name prevents running sessions concurrently",
                );
            }
        }

        match self.backend {
            BackendKind::Local => {
                if self.image.is_some() {
                    result.add_warning("image is ignored by the local backend");
                }
            }
            BackendKind::Container => {
                if self.sandbox_root.is_some() {
                    result.add_warning("sandbox_root is ignored by the container backend");
                }
            }
        }

        result
    }
}
