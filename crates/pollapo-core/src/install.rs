use crate::concurrency::CacheLock;
use crate::lock::{prune, reconcile};
use crate::resolver::{Resolution, ResolutionEvent, ResolveOptions, Resolver};
use crate::CoreError;
use pollapo_remote::{RemoteClient, RemoteError};
use pollapo_schema::{write_lock_table, DependencyRef, Manifest, ReplaceFileOption};
use pollapo_store::CacheStore;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub out_dir: PathBuf,
    pub resolve: ResolveOptions,
    /// Drop lock entries for branches no longer reachable.
    pub prune_lock: bool,
    /// Write the reconciled lock table back into the manifest.
    pub write_lock: bool,
}

impl InstallOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            resolve: ResolveOptions::default(),
            prune_lock: false,
            write_lock: true,
        }
    }
}

/// Two revisions of one repository reached in the same run. Only `kept` is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kept: DependencyRef,
    pub skipped: DependencyRef,
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub resolution: Resolution,
    /// Installed dependencies in the order they were first reached.
    pub installed: Vec<DependencyRef>,
    pub conflicts: Vec<Conflict>,
    pub lock_written: bool,
    pub pruned: Vec<DependencyRef>,
    /// `.proto` files changed by replace-file-option rules.
    pub files_rewritten: usize,
}

/// Resolve the manifest at `manifest_path`, write its lock table back and
/// populate `options.out_dir` with one directory per repository.
pub fn install(
    manifest_path: &Path,
    store: &CacheStore,
    remote: &dyn RemoteClient,
    options: InstallOptions,
    observer: &mut dyn FnMut(&ResolutionEvent),
) -> Result<InstallReport, CoreError> {
    info!("installing from {}", manifest_path.display());
    let manifest = Manifest::load(manifest_path)?;
    let rules = compile_rules(&manifest.replace_file_options())?;
    check_out_dir(&options.out_dir, manifest_path, store.layout().root())?;

    remote.validate_token().map_err(|e| match e {
        RemoteError::AuthFailed(msg) | RemoteError::NotFound(msg) => {
            CoreError::AuthenticationFailed(msg)
        }
        other => CoreError::Remote(other),
    })?;

    let base = manifest.lock_table();
    let resolver = Resolver::new(store, remote, options.resolve);
    let resolution = resolver.resolve_with(manifest.dependencies(), &base, observer)?;

    let mut lock = reconcile(&base, &resolution.events);
    let pruned = if options.prune_lock {
        prune(&mut lock, &resolution.events)
    } else {
        Vec::new()
    };
    let lock_written = options.write_lock && lock != base;
    if lock_written {
        write_lock_table(manifest_path, &lock)?;
        debug!("lock table written to {}", manifest_path.display());
    }

    let (installed, conflicts) = select_installs(&resolution.events);
    for c in &conflicts {
        warn!(
            "conflicting revisions of {}: installing {}, skipping {}",
            c.kept.repository(),
            c.kept.revision,
            c.skipped.revision
        );
    }

    let files_rewritten = {
        let _shared = CacheLock::acquire_shared(&store.layout().lock_file())?;
        populate_out_dir(store, &options.out_dir, &installed, &rules)?
    };
    info!(
        "installed {} repositories into {}",
        installed.len(),
        options.out_dir.display()
    );

    Ok(InstallReport {
        resolution,
        installed,
        conflicts,
        lock_written,
        pruned,
        files_rewritten,
    })
}

/// First immutable revision of each repository wins, in event order.
fn select_installs(events: &[ResolutionEvent]) -> (Vec<DependencyRef>, Vec<Conflict>) {
    let mut installed: Vec<DependencyRef> = Vec::new();
    let mut by_repo: HashMap<(&str, &str), usize> = HashMap::new();
    let mut conflicts = Vec::new();

    for ev in events.iter().filter(|e| !e.kind.is_branch()) {
        let key = (ev.dep.owner.as_str(), ev.dep.repo.as_str());
        match by_repo.get(&key) {
            None => {
                by_repo.insert(key, installed.len());
                installed.push(ev.dep.clone());
            }
            Some(&idx) if installed[idx].revision != ev.dep.revision => {
                conflicts.push(Conflict {
                    kept: installed[idx].clone(),
                    skipped: ev.dep.clone(),
                });
            }
            Some(_) => {}
        }
    }
    (installed, conflicts)
}

/// `out_dir` is deleted wholesale on install, so it must not contain the
/// manifest or the cache.
fn check_out_dir(out_dir: &Path, manifest_path: &Path, cache_root: &Path) -> Result<(), CoreError> {
    let out = normalize(out_dir)?;
    let manifest_dir = normalize(manifest_path.parent().unwrap_or_else(|| Path::new("")))?;
    let cache = normalize(cache_root)?;
    let reason = if manifest_dir.starts_with(&out) {
        Some(format!("it contains the manifest {}", manifest_path.display()))
    } else if cache.starts_with(&out) {
        Some(format!("it contains the cache {}", cache_root.display()))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(CoreError::UnsafeOutDir {
            path: out_dir.to_owned(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Absolute form of `path` with `.`/`..` resolved and the longest existing
/// prefix canonicalized, so symlinked and not-yet-created paths compare alike.
fn normalize(path: &Path) -> Result<PathBuf, CoreError> {
    let absolute = if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut lexical = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(rest.iter().rev().fold(canonical, |acc, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_owned());
                existing = parent;
            }
            _ => return Ok(lexical),
        }
    }
}

/// Replace `out_dir` with the given cache entries. Staged next to `out_dir`
/// and renamed into place, so a failure leaves the previous contents alone.
fn populate_out_dir(
    store: &CacheStore,
    out_dir: &Path,
    deps: &[DependencyRef],
    rules: &[FileOptionRule],
) -> Result<usize, CoreError> {
    let parent = out_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".pollapo-install-")
        .tempdir_in(parent)?;

    let mut rewritten = 0;
    for dep in deps {
        let tree = store.verify(dep)?;
        let repo_dir = staging.path().join(&dep.owner).join(&dep.repo);
        for (rel, contents) in tree.iter() {
            let out_rel = format!("{}/{}/{rel}", dep.owner, dep.repo);
            let dest = repo_dir.join(rel);
            if let Some(dir) = dest.parent() {
                fs::create_dir_all(dir)?;
            }
            match rewrite_file_options(rules, &out_rel, contents) {
                Some(updated) => {
                    fs::write(&dest, updated)?;
                    rewritten += 1;
                }
                None => fs::write(&dest, contents)?,
            }
        }
        debug!("installed {dep} ({} files)", tree.len());
    }

    if out_dir.exists() {
        fs::remove_dir_all(out_dir)?;
    }
    fs::rename(staging.path(), out_dir)?;
    Ok(rewritten)
}

/// A compiled `replace-file-option` entry.
#[derive(Debug)]
struct FileOptionRule {
    name: String,
    path: Regex,
    value: String,
    statement: Regex,
}

fn compile_rules(
    options: &BTreeMap<String, ReplaceFileOption>,
) -> Result<Vec<FileOptionRule>, CoreError> {
    options
        .iter()
        .map(|(name, opt)| {
            let invalid = |e: regex::Error| CoreError::InvalidReplaceRule {
                name: name.clone(),
                message: e.to_string(),
            };
            let path = Regex::new(&opt.regex).map_err(invalid)?;
            let statement = Regex::new(&format!(
                r#"(?m)^([ \t]*)option[ \t]+{}[ \t]*=[ \t]*"(?:[^"\\]|\\.)*"[ \t]*;"#,
                regex::escape(name)
            ))
            .map_err(invalid)?;
            Ok(FileOptionRule {
                name: name.clone(),
                path,
                value: opt.value.clone(),
                statement,
            })
        })
        .collect()
}

/// Apply every matching rule to a `.proto` file; `None` if nothing changed.
fn rewrite_file_options(rules: &[FileOptionRule], out_rel: &str, contents: &[u8]) -> Option<Vec<u8>> {
    if rules.is_empty() || !out_rel.ends_with(".proto") {
        return None;
    }
    let mut source = std::str::from_utf8(contents).ok()?.to_owned();
    let mut changed = false;
    for rule in rules {
        let Some(caps) = rule.path.captures(out_rel) else {
            continue;
        };
        let mut value = String::new();
        caps.expand(&rule.value, &mut value);
        if !rule.statement.is_match(&source) {
            continue;
        }
        let quoted = value.replace('\\', "\\\\").replace('"', "\\\"");
        let updated = rule.statement.replace_all(&source, |c: &Captures<'_>| {
            format!("{}option {} = \"{quoted}\";", &c[1], rule.name)
        });
        if updated != source {
            source = updated.into_owned();
            changed = true;
        }
    }
    changed.then(|| source.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolutionEventKind;

    fn dep(s: &str) -> DependencyRef {
        s.parse().unwrap()
    }

    fn ev(kind: ResolutionEventKind, d: &str) -> ResolutionEvent {
        let dep = dep(d);
        ResolutionEvent {
            kind,
            resolved_revision: dep.revision.clone(),
            dep,
        }
    }

    fn rules(name: &str, regex: &str, value: &str) -> Vec<FileOptionRule> {
        let mut opts = BTreeMap::new();
        opts.insert(
            name.to_owned(),
            ReplaceFileOption {
                regex: regex.to_owned(),
                value: value.to_owned(),
            },
        );
        compile_rules(&opts).unwrap()
    }

    #[test]
    fn first_revision_of_a_repository_wins() {
        let events = vec![
            ev(ResolutionEventKind::Downloaded, "a/b@v1"),
            ev(ResolutionEventKind::HashCheckedAndUpdated, "c/d@main"),
            ev(ResolutionEventKind::CacheHit, "c/d@v3"),
            ev(ResolutionEventKind::Downloaded, "a/b@v2"),
        ];
        let (installed, conflicts) = select_installs(&events);
        assert_eq!(installed, vec![dep("a/b@v1"), dep("c/d@v3")]);
        assert_eq!(
            conflicts,
            vec![Conflict {
                kept: dep("a/b@v1"),
                skipped: dep("a/b@v2"),
            }]
        );
    }

    #[test]
    fn rewrites_option_with_path_captures() {
        let rules = rules("java_package", r"^acme/([^/]+)/", "com.acme.$1");
        let src = b"syntax = \"proto3\";\noption java_package = \"old.pkg\";\nmessage M {}\n";
        let out = rewrite_file_options(&rules, "acme/widget/a.proto", src).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("option java_package = \"com.acme.widget\";"));
        assert!(!out.contains("old.pkg"));
        assert!(out.contains("message M {}"));
    }

    #[test]
    fn non_matching_path_is_untouched() {
        let rules = rules("java_package", r"^acme/", "com.acme");
        let src = b"option java_package = \"x\";\n";
        assert!(rewrite_file_options(&rules, "other/repo/a.proto", src).is_none());
    }

    #[test]
    fn file_without_option_is_untouched() {
        let rules = rules("go_package", ".*", "example.com/gen");
        assert!(rewrite_file_options(&rules, "a/b/c.proto", b"message M {}\n").is_none());
    }

    #[test]
    fn only_proto_files_are_rewritten() {
        let rules = rules("go_package", ".*", "example.com/gen");
        let src = b"option go_package = \"x\";\n";
        assert!(rewrite_file_options(&rules, "a/b/README.md", src).is_none());
    }

    #[test]
    fn option_name_is_matched_exactly() {
        let rules = rules("java_package", ".*", "com.acme");
        let src = b"option java_package_suffix = \"x\";\n";
        assert!(rewrite_file_options(&rules, "a/b/c.proto", src).is_none());
    }

    #[test]
    fn out_dir_may_not_contain_manifest_or_cache() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        fs::create_dir_all(&proj).unwrap();
        let manifest = proj.join("pollapo.yml");
        let cache = dir.path().join("home/.config/pollapo/cache");

        for bad in [proj.clone(), proj.join("."), dir.path().to_owned(), proj.join("sub/..")] {
            let err = check_out_dir(&bad, &manifest, &cache).unwrap_err();
            assert!(matches!(err, CoreError::UnsafeOutDir { .. }), "{}", bad.display());
        }
        let err = check_out_dir(&dir.path().join("home"), &manifest, &cache).unwrap_err();
        assert!(err.to_string().contains("cache"));

        assert!(check_out_dir(&proj.join(".pollapo"), &manifest, &cache).is_ok());
        assert!(check_out_dir(&dir.path().join("out"), &manifest, &cache).is_ok());
    }

    #[test]
    fn invalid_rule_regex_is_reported() {
        let mut opts = BTreeMap::new();
        opts.insert(
            "java_package".to_owned(),
            ReplaceFileOption {
                regex: "(".to_owned(),
                value: "x".to_owned(),
            },
        );
        let err = compile_rules(&opts).unwrap_err();
        assert!(matches!(err, CoreError::InvalidReplaceRule { .. }));
    }
}
