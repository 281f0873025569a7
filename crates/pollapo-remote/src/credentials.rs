//! Token discovery.
//!
//! Lookup order: explicit token, `GITHUB_TOKEN`, then the GitHub CLI's
//! `hosts.yml` (`$GH_CONFIG_DIR/hosts.yml` or `~/.config/gh/hosts.yml`).

use crate::RemoteError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const GITHUB_HOST: &str = "github.com";

#[derive(Debug, Deserialize)]
struct GhHostsEntry {
    #[serde(default)]
    oauth_token: Option<String>,
}

pub fn load_token(explicit: Option<&str>) -> Result<String, RemoteError> {
    let env_token = std::env::var("GITHUB_TOKEN").ok();
    let hosts = gh_hosts_path();
    load_token_from(explicit, env_token.as_deref(), hosts.as_deref())
}

pub fn load_token_from(
    explicit: Option<&str>,
    env_token: Option<&str>,
    gh_hosts: Option<&Path>,
) -> Result<String, RemoteError> {
    if let Some(token) = non_blank(explicit) {
        debug!("using token from command line");
        return Ok(token);
    }
    if let Some(token) = non_blank(env_token) {
        debug!("using token from GITHUB_TOKEN");
        return Ok(token);
    }
    if let Some(path) = gh_hosts {
        if let Some(token) = read_gh_hosts(path)? {
            debug!("using token from {}", path.display());
            return Ok(token);
        }
    }
    Err(RemoteError::AuthFailed(
        "no GitHub token: pass --token, set GITHUB_TOKEN, or run 'gh auth login'".to_owned(),
    ))
}

fn non_blank(token: Option<&str>) -> Option<String> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

fn read_gh_hosts(path: &Path) -> Result<Option<String>, RemoteError> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let hosts: HashMap<String, GhHostsEntry> = serde_yaml::from_str(&content)
        .map_err(|e| RemoteError::Config(format!("invalid {}: {e}", path.display())))?;
    Ok(hosts
        .get(GITHUB_HOST)
        .and_then(|entry| non_blank(entry.oauth_token.as_deref())))
}

fn gh_hosts_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("GH_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join("hosts.yml"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/gh/hosts.yml"))
}
