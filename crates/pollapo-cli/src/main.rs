mod commands;
mod settings;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::install::InstallArgs;
use commands::{exit_code_for, EXIT_FAILURE};
use pollapo_core::{install_signal_handler, CancelToken};
use settings::{expand_tilde, Settings};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "pollapo",
    version,
    about = "Protobuf dependency manager for GitHub-hosted repositories"
)]
struct Cli {
    /// Cache directory (defaults to ~/.config/pollapo/cache).
    #[arg(long, global = true)]
    cache_dir: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve, cache and install the dependencies listed in pollapo.yml.
    Install {
        /// Path to the pollapo manifest.
        #[arg(short = 'C', long, default_value = "pollapo.yml")]
        config: PathBuf,
        /// Directory to install dependencies into (replaced on every run).
        #[arg(short, long, default_value = ".pollapo")]
        out_dir: PathBuf,
        /// Clear the cache before resolving.
        #[arg(short, long, default_value_t = false)]
        clean: bool,
        /// GitHub token (defaults to GITHUB_TOKEN, then the gh CLI login).
        #[arg(short, long)]
        token: Option<String>,
        /// Resolve branches again even when the lock table pins them.
        #[arg(long, default_value_t = false)]
        revalidate: bool,
        /// Remove lock entries for branches that are no longer reachable.
        #[arg(long, default_value_t = false)]
        prune_lock: bool,
        /// Maximum number of concurrent downloads.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// GitHub API base URL (for GitHub Enterprise).
        #[arg(long)]
        api_url: Option<String>,
    },
    /// Remove every cached dependency.
    Clean,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("POLLAPO_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let settings = match Settings::load_default() {
        Ok(s) => s.with_env(|key| std::env::var(key).ok()),
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let cache_dir = cli
        .cache_dir
        .as_deref()
        .map_or_else(|| settings.cache_dir(), expand_tilde);

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let result = match cli.command {
        Commands::Install {
            config,
            out_dir,
            clean,
            token,
            revalidate,
            prune_lock,
            jobs,
            api_url,
        } => commands::install::run(
            &InstallArgs {
                config,
                out_dir,
                clean,
                token,
                revalidate,
                prune_lock,
                jobs,
                api_url,
            },
            &settings,
            &cache_dir,
            cancel,
            cli.json,
        ),
        Commands::Clean => commands::clean::run(&cache_dir, cli.json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}
