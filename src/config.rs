//! Configuration for the orchestrator's data root and pipeline plan.
//!
//! Sources (highest priority first):
//! 1. Environment variable (STAGEHAND_DATA_ROOT)
//! 2. Config file (YAML, path supplied by the caller)
//! 3. Default (~/.stagehand)
//!
//! Resolution happens once at startup; the resulting value is passed into
//! constructors explicitly rather than read ambiently at call time.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable naming the data root.
///
/// Child processes receive this same variable, overridden to their run's
/// workspace root, so the pipeline reads and writes only its own run.
pub const DATA_ROOT_ENV: &str = "STAGEHAND_DATA_ROOT";

/// Raw config file schema
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// Data root directory (relative paths resolve against the config file)
    pub data_root: Option<String>,

    /// Pipeline plan file (relative paths resolve against the config file)
    pub plan: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which per-run workspaces live
    pub data_root: PathBuf,

    /// Pipeline plan file, if configured
    pub plan_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the environment and an optional config file
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => {
                let parsed = load_config_file(path)?;
                let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                Some((parsed, base))
            }
            None => None,
        };

        resolve(std::env::var_os(DATA_ROOT_ENV), file)
    }

    /// Configuration rooted at an explicit directory (used by tests and
    /// embedders that manage their own paths)
    pub fn with_data_root(data_root: PathBuf) -> Self {
        Self {
            data_root,
            plan_path: None,
        }
    }

    /// Directory holding one workspace per run id
    pub fn runs_root(&self) -> PathBuf {
        self.data_root.join("runs")
    }
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Pure resolution over already-gathered inputs
fn resolve(env_root: Option<OsString>, file: Option<(ConfigFile, PathBuf)>) -> Result<Config> {
    let (file_config, base) = match file {
        Some((config, base)) => (config, base),
        None => (ConfigFile::default(), PathBuf::from(".")),
    };

    let data_root = if let Some(env_root) = env_root {
        PathBuf::from(env_root)
    } else if let Some(ref root) = file_config.data_root {
        resolve_path(&base, root)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".stagehand")
    };

    let plan_path = file_config.plan.as_ref().map(|p| resolve_path(&base, p));

    Ok(Config {
        data_root,
        plan_path,
    })
}
