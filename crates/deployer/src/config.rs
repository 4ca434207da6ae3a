use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{DeployerError, Result};

const DEFAULT_STABILITY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_FILTER: &str = "info";

/// One top-level deployment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Unique deployment name (e.g. `app.war`)
    pub name: String,
    /// Archive or exploded directory holding the content
    pub path: PathBuf,
    /// Subsystems whose processors are skipped for this deployment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_subsystems: Vec<String>,
    /// Module dependencies the deployment opts out of
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_dependencies: Vec<String>,
}

impl DeploymentSpec {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            excluded_subsystems: Vec::new(),
            excluded_dependencies: Vec::new(),
        }
    }

    /// Deployment named after the last component of `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DeployerError::InvalidDeployment(format!(
                    "cannot derive a deployment name from {}",
                    path.display()
                ))
            })?
            .to_string();
        Ok(Self::new(name, path))
    }

    pub fn with_excluded_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.excluded_subsystems.push(subsystem.into());
        self
    }

    pub fn with_excluded_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.excluded_dependencies.push(dependency.into());
        self
    }
}

/// Deployer settings, stored as TOML.
///
/// ```toml
/// stability_timeout_ms = 10000
/// log_filter = "deployer=debug"
///
/// [[deployments]]
/// name = "app.war"
/// path = "/srv/deployments/app.war"
/// excluded_subsystems = ["jaxrs"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    /// Upper bound for waiting on the pipeline to settle
    pub stability_timeout_ms: u64,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_filter: String,
    pub deployments: Vec<DeploymentSpec>,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            stability_timeout_ms: DEFAULT_STABILITY_TIMEOUT_MS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            deployments: Vec::new(),
        }
    }
}

impl DeployerConfig {
    /// Read the config at `path`. A missing file yields the defaults; a file
    /// that does not parse is an error.
    pub async fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).await?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            DeployerError::Config(reason) => {
                DeployerError::Config(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })?;
        debug!(
            path = %path.display(),
            deployments = config.deployments.len(),
            "Config loaded successfully"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| DeployerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DeployerError::Config(e.to_string()))?;
        fs::write(path, content).await?;
        debug!(path = %path.display(), "Config saved successfully");
        Ok(())
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.deployments {
            if spec.name.trim().is_empty() {
                return Err(DeployerError::Config(
                    "deployment name must not be empty".to_string(),
                ));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(DeployerError::Config(format!(
                    "deployment {} is listed twice",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config = DeployerConfig::read(&temp_dir.path().join("deployer.toml"))
            .await
            .unwrap();
        assert_eq!(config, DeployerConfig::default());
        assert_eq!(config.stability_timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("deployer.toml");

        let config = DeployerConfig {
            stability_timeout_ms: 5_000,
            log_filter: "deployer=debug".to_string(),
            deployments: vec![
                DeploymentSpec::new("app.war", "/srv/app.war").with_excluded_subsystem("jaxrs"),
                DeploymentSpec::new("shop.ear", "/srv/shop.ear")
                    .with_excluded_dependency("org.legacy"),
            ],
        };
        config.write(&path).await.unwrap();

        let loaded = DeployerConfig::read(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_config_malformed_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deployer.toml");
        fs::write(&path, "stability_timeout_ms = \"soon\"").await.unwrap();

        let error = DeployerConfig::read(&path).await.unwrap_err();
        assert!(matches!(error, DeployerError::Config(_)));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = DeployerConfig::from_toml(
            r#"
            [[deployments]]
            name = "app.war"
            path = "/srv/app.war"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.deployments.len(), 1);
        assert!(config.deployments[0].excluded_subsystems.is_empty());
    }

    #[test]
    fn test_duplicate_deployment_rejected() {
        let result = DeployerConfig::from_toml(
            r#"
            [[deployments]]
            name = "app.war"
            path = "a"

            [[deployments]]
            name = "app.war"
            path = "b"
            "#,
        );
        assert!(matches!(result, Err(DeployerError::Config(_))));
    }

    #[test]
    fn test_spec_from_path() {
        let spec = DeploymentSpec::from_path("/srv/deployments/shop.ear").unwrap();
        assert_eq!(spec.name, "shop.ear");
        assert!(DeploymentSpec::from_path("/").is_err());
    }
}
