use crate::{RemoteClient, RemoteConfig, RemoteError};
use flate2::read::GzDecoder;
use pollapo_schema::{is_commit_hash, CommitHash};
use pollapo_store::FileTree;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("pollapo/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";
/// Upper bound on error bodies read for diagnostics.
const MAX_ERROR_BODY: u64 = 64 * 1024;

type Response = ureq::http::Response<ureq::Body>;

/// GitHub REST client.
///
/// Uses three endpoints:
/// - `GET /user`                               token validation
/// - `GET /repos/<o>/<r>/commits/<branch>`     branch head (`Accept: application/vnd.github.sha`)
/// - `GET /repos/<o>/<r>/tarball/<rev>`        gzip tarball of the tree
pub struct GithubClient {
    config: RemoteConfig,
    agent: ureq::Agent,
}

impl GithubClient {
    pub fn new(config: RemoteConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
            .http_status_as_error(false)
            .build();
        let agent = ureq::Agent::new_with_config(agent_config);
        Self { config, agent }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn repo_url(&self, owner: &str, repo: &str, tail: &str) -> String {
        format!(
            "{}/repos/{}/{}/{tail}",
            self.config.api_url,
            encode_ref(owner),
            encode_ref(repo)
        )
    }

    fn do_get(&self, url: &str, accept: &str) -> Result<Response, RemoteError> {
        let mut req = self
            .agent
            .get(url)
            .header("Accept", accept)
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::Timeout(_)) => {
                return Err(RemoteError::Timeout(url.to_owned()));
            }
            Err(e) => {
                return Err(RemoteError::Network(format!("{url}: {e}")));
            }
        };
        let code = resp.status().as_u16();
        if code >= 400 {
            return Err(status_error(code, resp, url));
        }
        Ok(resp)
    }
}

impl RemoteClient for GithubClient {
    fn validate_token(&self) -> Result<(), RemoteError> {
        let url = format!("{}/user", self.config.api_url);
        debug!("GET {url}");
        match self.do_get(&url, "application/vnd.github+json") {
            Ok(_) => Ok(()),
            Err(RemoteError::NotFound(detail)) => Err(RemoteError::AuthFailed(detail)),
            Err(e) => Err(e),
        }
    }

    fn resolve_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<CommitHash, RemoteError> {
        let url = self.repo_url(owner, repo, &format!("commits/{}", encode_ref(branch)));
        debug!("GET {url}");
        let resp = self.do_get(&url, "application/vnd.github.sha")?;
        let mut body = String::new();
        resp.into_body()
            .into_reader()
            .take(1024)
            .read_to_string(&mut body)
            .map_err(|e| RemoteError::Network(format!("{url}: {e}")))?;
        let sha = body.trim();
        if !is_commit_hash(sha) {
            return Err(RemoteError::Network(format!(
                "unexpected commit response for {url}: '{}'",
                sha.chars().take(80).collect::<String>()
            )));
        }
        Ok(CommitHash::new(sha.to_ascii_lowercase()))
    }

    fn fetch_tree(
        &self,
        owner: &str,
        repo: &str,
        revision: &str,
    ) -> Result<FileTree, RemoteError> {
        let url = self.repo_url(owner, repo, &format!("tarball/{}", encode_ref(revision)));
        debug!("GET {url}");
        let resp = self.do_get(&url, "application/vnd.github+json")?;
        let tree = parse_tarball(resp.into_body().into_reader())?;
        debug!("{owner}/{repo}@{revision}: {} files", tree.len());
        Ok(tree)
    }
}

fn status_error(code: u16, resp: Response, url: &str) -> RemoteError {
    let headers = resp.headers();
    let rate_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "0");
    let retry_after = headers.contains_key("retry-after");

    let message = error_message(resp);
    let detail = if message.is_empty() {
        format!("HTTP {code} for {url}")
    } else {
        format!("HTTP {code} for {url}: {message}")
    };

    match code {
        401 => RemoteError::AuthFailed(detail),
        404 | 422 => RemoteError::NotFound(detail),
        429 => RemoteError::RateLimited(detail),
        403 if rate_exhausted || retry_after => RemoteError::RateLimited(detail),
        403 => RemoteError::AuthFailed(detail),
        _ => RemoteError::Network(detail),
    }
}

/// GitHub error bodies are `{"message": "..."}`; fall back to the raw text.
fn error_message(resp: Response) -> String {
    let mut body = String::new();
    if resp
        .into_body()
        .into_reader()
        .take(MAX_ERROR_BODY)
        .read_to_string(&mut body)
        .is_err()
    {
        return String::new();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(msg) = value.get("message").and_then(serde_json::Value::as_str) {
            return msg.to_owned();
        }
    }
    body.trim().chars().take(200).collect()
}

/// Read a GitHub tarball: gzip'd tar with a single top-level directory that is stripped.
pub(crate) fn parse_tarball(reader: impl Read) -> Result<FileTree, RemoteError> {
    let invalid = |e: std::io::Error| RemoteError::InvalidArchive(e.to_string());
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    let mut tree = FileTree::new();
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(invalid)?.into_owned();
        let rel: Vec<String> = path
            .components()
            .skip(1)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if rel.is_empty() {
            continue;
        }
        let rel = rel.join("/");
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(invalid)?;
        tree.insert(&rel, contents)
            .map_err(|e| RemoteError::InvalidArchive(e.to_string()))?;
    }
    Ok(tree)
}

/// Percent-encode everything except unreserved characters and `/`.
fn encode_ref(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
