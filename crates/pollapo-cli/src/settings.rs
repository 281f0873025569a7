//! User settings from `~/.config/pollapo/config.toml`, overridden by the
//! environment and then by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub cache_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub api_url: Option<String>,
}

impl Settings {
    /// Load the default settings file; a missing file yields empty settings.
    pub fn load_default() -> Result<Self, String> {
        match config_dir() {
            Some(dir) => Self::load(&dir.join(SETTINGS_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read settings '{}': {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("invalid settings '{}': {e}", path.display()))
    }

    /// Apply `POLLAPO_CACHE_DIR` and `POLLAPO_API_URL`.
    #[must_use]
    pub fn with_env(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            cache_dir: non_empty("POLLAPO_CACHE_DIR")
                .map(|v| expand_tilde(&v))
                .or(self.cache_dir),
            api_url: non_empty("POLLAPO_API_URL").or(self.api_url),
            ..self
        }
    }

    /// Cache root: explicit setting, else `~/.config/pollapo/cache`.
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return expand_tilde(&dir.to_string_lossy());
        }
        config_dir().map_or_else(|| PathBuf::from(".pollapo-cache"), |d| d.join("cache"))
    }
}

fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("pollapo"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
