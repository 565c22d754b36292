use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "kdmp-builder.json";
pub const CONFIG_SCHEMA_VERSION: &str = "kdmp-builder.config@0.1.0";

/// Optional per-checkout overrides. Every field falls back to the built-in
/// default when absent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub schema_version: String,
    #[serde(default)]
    pub fixtures_url: Option<String>,
    #[serde(default)]
    pub fixtures_sha256: Option<String>,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default)]
    pub cmake: Option<PathBuf>,
    #[serde(default)]
    pub generator: Option<String>,
    #[serde(default)]
    pub setup_script: Option<PathBuf>,
    #[serde(default)]
    pub test_executable: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION.to_string(),
            fixtures_url: None,
            fixtures_sha256: None,
            fixtures: Vec::new(),
            download_dir: None,
            cmake: None,
            generator: None,
            setup_script: None,
            test_executable: None,
        }
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

impl Config {
    /// A missing file is not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&bytes).with_context(|| format!("parse {}", path.display()))
    }

    /// For a file named on the command line, where a typo must not silently
    /// fall back to defaults.
    pub fn load_required(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("config file not found: {}", path.display());
        }
        Self::load(path)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cfg: Self = serde_json::from_slice(bytes)?;
        if cfg.schema_version != CONFIG_SCHEMA_VERSION {
            bail!(
                "unsupported config schema_version: {} (expected {CONFIG_SCHEMA_VERSION})",
                cfg.schema_version
            );
        }
        let mut fixtures: Vec<String> = Vec::with_capacity(cfg.fixtures.len());
        for name in cfg.fixtures.drain(..) {
            if name.trim().is_empty() || fixtures.contains(&name) {
                continue;
            }
            let escapes = Path::new(&name)
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                bail!("invalid fixture name {name:?}: must stay inside the download dir");
            }
            fixtures.push(name);
        }
        cfg.fixtures = fixtures;
        Ok(cfg)
    }
}
