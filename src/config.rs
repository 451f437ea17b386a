//! Configuration for the offline controller
//!
//! Two layers, as deployed:
//! - [`Args`]: CLI arguments with environment fallbacks (clap), for the proxy
//!   process itself.
//! - [`ControllerConfig`]: what one deployed controller version caches and how,
//!   optionally read from a TOML file so a new version can be rolled out by
//!   editing the file.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::RoutingConfig;
use crate::types::{OfflineError, Result};

/// Version string of the deployed controller
pub const DEFAULT_VERSION: &str = "2.0.0";

/// Application prefix of every generation name
pub const DEFAULT_PREFIX: &str = "maestro-quiz";

/// maestro-offline - offline caching proxy for the Maestro music quiz
#[derive(Parser, Debug, Clone)]
#[command(name = "maestro-offline")]
#[command(about = "Offline caching proxy for the Maestro music quiz")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,

    /// Origin the proxy fronts (overrides the config file)
    #[arg(long, env = "ORIGIN_URL")]
    pub origin: Option<Url>,

    /// Controller config file (TOML)
    #[arg(long, env = "CONTROLLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Deployed version (overrides the config file)
    #[arg(long, env = "APP_VERSION")]
    pub app_version: Option<String>,

    /// Directory for persistent cache storage; in-memory when unset
    #[arg(long, env = "CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Network request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,

    /// How often to check the config file for a new version, in seconds
    #[arg(long, env = "UPDATE_INTERVAL_SECS", default_value = "1800")]
    pub update_interval_secs: u64,

    /// How long an update install waits for the new controller, in milliseconds
    #[arg(long, env = "INSTALL_TIMEOUT_MS", default_value = "30000")]
    pub install_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }

    /// Controller config: the file if given, else defaults, then CLI overrides
    pub async fn controller_config(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config {
            Some(path) => ControllerConfig::from_file(path).await?,
            None => ControllerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.origin = origin.clone();
        }
        if let Some(version) = &self.app_version {
            config.version = version.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.update_interval_secs == 0 {
            return Err("UPDATE_INTERVAL_SECS must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// One deployable controller version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Deployed version; the only place a version string is defined
    pub version: String,
    /// Application prefix of generation names
    pub prefix: String,
    /// Origin that root-relative manifest paths resolve against
    pub origin: Url,
    /// App shell paths pre-warmed at install
    pub manifest: Vec<String>,
    /// Promote straight to active after install instead of waiting
    pub skip_waiting_on_install: bool,
    pub routes: RoutingConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            origin: Url::parse("http://localhost:3000").expect("static origin url"),
            manifest: [
                "/",
                "/manifest.json",
                "/favicon.svg",
                "/quiz",
                "/results",
                "/leaderboard",
                "/instructions",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            skip_waiting_on_install: true,
            routes: RoutingConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            OfflineError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Same config under another version
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(OfflineError::Config("version must not be empty".into()));
        }
        if self.prefix.trim().is_empty() {
            return Err(OfflineError::Config("prefix must not be empty".into()));
        }
        if let Some(path) = self.manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(OfflineError::Config(format!(
                "manifest path must be root-relative: {}",
                path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.version, "2.0.0");
        assert_eq!(config.prefix, "maestro-quiz");
        assert_eq!(config.manifest.len(), 7);
        assert!(config.skip_waiting_on_install);
        assert_eq!(config.routes.dynamic_max_age_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ControllerConfig::from_toml(
            r#"
version = "2.1.0"
origin = "https://quiz.example"
manifest = ["/", "/quiz"]
skip_waiting_on_install = false

[routes]
dynamic_max_age_secs = 600
"#,
        )
        .unwrap();

        assert_eq!(config.version, "2.1.0");
        assert_eq!(config.origin.as_str(), "https://quiz.example/");
        assert_eq!(config.manifest, vec!["/", "/quiz"]);
        assert!(!config.skip_waiting_on_install);
        assert_eq!(config.routes.dynamic_max_age_secs, 600);
        assert_eq!(config.routes.audio_max_age_secs, 7 * 24 * 60 * 60);
        assert_eq!(config.prefix, "maestro-quiz");
    }

    #[test]
    fn test_invalid_manifest_rejected() {
        let result = ControllerConfig::from_toml(r#"manifest = ["quiz"]"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_args_overrides() {
        let args = Args::parse_from([
            "maestro-offline",
            "--origin",
            "https://quiz.example",
            "--app-version",
            "3.0.0",
        ]);
        let config = args.controller_config().await.unwrap();
        assert_eq!(config.version, "3.0.0");
        assert_eq!(config.origin.as_str(), "https://quiz.example/");
        assert!(args.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_file_read_on_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("controller.toml");
        tokio::fs::write(&path, "version = \"4.0.0\"\nmanifest = [\"/\"]\n")
            .await
            .unwrap();

        let config = ControllerConfig::from_file(&path).await.unwrap();
        assert_eq!(config.version, "4.0.0");
        assert_eq!(config.manifest, vec!["/"]);

        let missing = ControllerConfig::from_file(&dir.path().join("absent.toml")).await;
        assert!(matches!(missing, Err(OfflineError::Config(_))));
    }
}
