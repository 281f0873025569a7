use super::{describe, event_label, json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use crate::settings::Settings;
use pollapo_core::resolver::{DEFAULT_JOBS, DEFAULT_MAX_RETRIES};
use pollapo_core::{install, CancelToken, InstallOptions, ResolutionEventKind, ResolveOptions};
use pollapo_remote::config::{DEFAULT_API_URL, DEFAULT_TIMEOUT_SECS};
use pollapo_remote::{load_token, GithubClient, RemoteConfig};
use pollapo_store::{CacheLayout, CacheStore};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InstallArgs {
    pub config: PathBuf,
    pub out_dir: PathBuf,
    pub clean: bool,
    pub token: Option<String>,
    pub revalidate: bool,
    pub prune_lock: bool,
    pub jobs: Option<usize>,
    pub api_url: Option<String>,
}

pub fn run(
    args: &InstallArgs,
    settings: &Settings,
    cache_dir: &Path,
    cancel: CancelToken,
    json: bool,
) -> Result<u8, String> {
    let token = load_token(args.token.as_deref()).map_err(|e| e.to_string())?;
    let api_url = args
        .api_url
        .as_deref()
        .or(settings.api_url.as_deref())
        .unwrap_or(DEFAULT_API_URL);
    let remote = GithubClient::new(
        RemoteConfig::new(api_url)
            .with_token(&token)
            .with_timeout_secs(settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
    );
    let store = CacheStore::new(CacheLayout::new(cache_dir));

    let options = InstallOptions {
        resolve: ResolveOptions {
            clean: args.clean,
            revalidate: args.revalidate,
            jobs: args.jobs.or(settings.jobs).unwrap_or(DEFAULT_JOBS),
            max_retries: settings.retries.unwrap_or(DEFAULT_MAX_RETRIES),
            cancel,
            ..ResolveOptions::default()
        },
        prune_lock: args.prune_lock,
        ..InstallOptions::new(&args.out_dir)
    };

    let pb = (!json).then(|| spinner("resolving dependencies…"));
    let mut observer = |ev: &pollapo_core::ResolutionEvent| {
        if let Some(pb) = &pb {
            pb.set_message(format!("{} {}", event_label(ev.kind), ev.dep));
        }
    };

    let report = match install(&args.config, &store, &remote, options, &mut observer) {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, "install failed");
            }
            return Err(describe(&e));
        }
    };

    let res = &report.resolution;
    if json {
        let payload = serde_json::json!({
            "out_dir": args.out_dir,
            "cache_dir": cache_dir,
            "events": res.events,
            "installed": report.installed,
            "conflicts": report.conflicts,
            "lock_written": report.lock_written,
            "pruned": report.pruned,
            "files_rewritten": report.files_rewritten,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    if let Some(pb) = &pb {
        spin_ok(
            pb,
            &format!(
                "installed {} repositories into {}",
                report.installed.len(),
                args.out_dir.display()
            ),
        );
    }
    println!(
        "  {} downloaded, {} cached, {} locked, {} checked",
        res.count(ResolutionEventKind::Downloaded),
        res.count(ResolutionEventKind::CacheHit),
        res.count(ResolutionEventKind::LockedHashReused),
        res.count(ResolutionEventKind::HashCheckedAndUpdated),
    );
    if report.lock_written {
        println!("  lock updated in {}", args.config.display());
    }
    for dep in &report.pruned {
        println!("  pruned lock entry {dep}");
    }
    for c in &report.conflicts {
        eprintln!(
            "{} {} requested at {} and {}; installed {}",
            console::style("warning:").yellow().bold(),
            c.kept.repository(),
            c.kept.revision,
            c.skipped.revision,
            c.kept.revision
        );
    }
    Ok(EXIT_SUCCESS)
}
