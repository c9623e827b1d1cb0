// Configuration loaded from YAML with environment overrides

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const ENV_REMOTE_DB: &str = "GRIDSTORE_REMOTE_DB";
pub const ENV_LOCAL_DIR: &str = "GRIDSTORE_LOCAL_DIR";

const CONFIG_FILE: &str = "gridstore.yaml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub listing: ListingConfig,
}

/// Connection parameters for the remote store. No database means "not configured".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding the local storage area
    pub dir: PathBuf,
    /// Prefix prepended to every key the store writes locally
    pub namespace: String,
    /// Reject writes that would grow the area past this many bytes
    pub quota_bytes: Option<u64>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gridstore"),
            namespace: "gridstore:".to_string(),
            quota_bytes: Some(5 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// JSON file replacing the bundled fallback dataset
    pub dataset: Option<PathBuf>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
            dataset: None,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Reads `path` if given, otherwise `gridstore.yaml` in the user config
    /// directory when it exists, otherwise defaults. Environment variables
    /// are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match path {
            Some(p) if p.exists() => {
                info!(path = ?p, "Loading configuration");
                Self::from_file(&p)?
            }
            Some(p) => {
                debug!(path = ?p, "No configuration file, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read configuration file")?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).context("Failed to parse configuration")
    }

    fn apply_env(&mut self) {
        if let Ok(db) = env::var(ENV_REMOTE_DB) {
            self.remote.database = if db.trim().is_empty() { None } else { Some(PathBuf::from(db)) };
        }
        match env::var(ENV_LOCAL_DIR) {
            Ok(dir) if !dir.trim().is_empty() => self.local.dir = PathBuf::from(dir),
            _ => {}
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("gridstore").join(CONFIG_FILE))
}
