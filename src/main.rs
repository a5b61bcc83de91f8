use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use covtrend::cancel::CancellationToken;
use covtrend::cli::{self, Style};
use covtrend::compare::Comparator;
use covtrend::config::Config;
use covtrend::diff::{DiffSource, FileDiff, GitDiff, StdinDiff};
use covtrend::store::{HistoryStore, RecordOptions};
use covtrend::transport::{ArtifactTransport, DirectoryTransport, HttpTransport};

/// covtrend — Coverage history, trend analytics and base/head comparison.
#[derive(Parser)]
#[command(name = "covtrend", version, about)]
struct Cli {
    /// Directory holding the history store
    #[arg(long, global = true, env = "COVTREND_STORE", default_value = ".covtrend")]
    store: PathBuf,

    /// Configuration file (defaults apply when it does not exist)
    #[arg(long, global = true, env = "COVTREND_CONFIG", default_value = "covtrend.toml")]
    config: PathBuf,

    /// Abort store and sync operations after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a coverage snapshot (JSON) into the history store.
    Record {
        /// Path to the snapshot JSON.
        snapshot: PathBuf,

        /// Branch name (overrides the snapshot's).
        #[arg(long, env = "COVTREND_BRANCH")]
        branch: Option<String>,

        /// Commit SHA (overrides the snapshot's).
        #[arg(long, env = "COVTREND_COMMIT")]
        commit: Option<String>,

        /// Link to the commit.
        #[arg(long)]
        commit_url: Option<String>,

        /// Extra metadata as key=value (repeatable).
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Show the most recent record for a branch.
    Latest {
        branch: String,

        #[arg(long)]
        json: bool,
    },

    /// List the records for a branch, oldest first.
    History {
        branch: String,

        /// Only records from the last N days (0 = all).
        #[arg(long, default_value_t = 0)]
        days: u32,

        #[arg(long)]
        json: bool,
    },

    /// Trend statistics and forecast for a branch.
    Trend {
        branch: String,

        /// Analysis window in days (0 = all history).
        #[arg(long, default_value_t = 30)]
        days: u32,

        #[arg(long)]
        json: bool,
    },

    /// Aggregate statistics over the whole store.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Apply the retention policy.
    Cleanup {
        /// Only clean this branch.
        #[arg(long)]
        branch: Option<String>,
    },

    /// Compare a head snapshot against a base snapshot.
    Compare {
        /// Head snapshot JSON.
        head: PathBuf,

        /// Base snapshot JSON.
        #[arg(long, conflicts_with = "base_branch")]
        base: Option<PathBuf>,

        /// Use the latest recorded entry of this branch as the base.
        #[arg(long)]
        base_branch: Option<String>,

        /// Unified diff file used for per-file line counts.
        #[arg(long, conflicts_with_all = ["git_diff", "stdin_diff"])]
        diff_file: Option<PathBuf>,

        /// Git diff arguments, e.g. "main...HEAD".
        #[arg(long, conflicts_with = "stdin_diff")]
        git_diff: Option<String>,

        /// Read a unified diff from stdin.
        #[arg(long)]
        stdin_diff: bool,

        #[arg(long, value_enum, default_value = "text")]
        format: Style,

        /// Exit with status 1 if coverage dropped by at least this many points.
        #[arg(long)]
        fail_on_drop: Option<f64>,
    },

    /// Merge two exported history files and print the result.
    Merge {
        local: PathBuf,
        external: PathBuf,

        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Export a branch's history in the exchange format.
    Export {
        branch: String,

        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Pull history from the artifact store, merge, and push it back.
    Sync {
        branch: String,

        /// Use a directory (e.g. a restored CI cache) instead of the HTTP
        /// endpoint in COVTREND_ARTIFACT_URL.
        #[arg(long)]
        artifact_dir: Option<PathBuf>,
    },
}

fn main() {
    let args = Cli::parse();

    let filter = match (args.quiet, args.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}

fn write_output(output: &str, path: Option<&PathBuf>) -> Result<()> {
    match path {
        Some(path) => std::fs::write(path, output)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn run(args: Cli) -> Result<i32> {
    let config = Config::load_or_default(&args.config).context("Failed to load configuration")?;
    let cancel = match args.timeout_secs {
        Some(secs) => CancellationToken::with_timeout(Duration::from_secs(secs)),
        None => CancellationToken::new(),
    };
    let open_store = || {
        HistoryStore::open(&args.store, config.history.clone())
            .with_context(|| format!("Failed to open history store at {}", args.store.display()))
    };

    let output = match args.command {
        Commands::Record {
            snapshot,
            branch,
            commit,
            commit_url,
            metadata,
        } => {
            let store = open_store()?;
            let snapshot = cli::load_snapshot(&snapshot)?;
            let options = RecordOptions {
                branch,
                commit_sha: commit,
                commit_url,
                metadata: cli::parse_metadata(&metadata)?,
            };
            cli::cmd_record(&store, snapshot, options, &cancel)?
        }
        Commands::Latest { branch, json } => {
            cli::cmd_latest(&open_store()?, &branch, json, &cancel)?
        }
        Commands::History { branch, days, json } => {
            cli::cmd_history(&open_store()?, &branch, days, json, &cancel)?
        }
        Commands::Trend { branch, days, json } => {
            cli::cmd_trend(&open_store()?, &branch, days, json, &cancel)?
        }
        Commands::Stats { json } => cli::cmd_stats(&open_store()?, json, &cancel)?,
        Commands::Cleanup { branch } => {
            cli::cmd_cleanup(&open_store()?, branch.as_deref(), &cancel)?
        }
        Commands::Compare {
            head,
            base,
            base_branch,
            diff_file,
            git_diff,
            stdin_diff,
            format,
            fail_on_drop,
        } => {
            let head = cli::load_snapshot(&head)?;
            let base = match (base, base_branch) {
                (Some(path), _) => Some(cli::load_snapshot(&path)?),
                (None, Some(branch)) => cli::baseline_from_store(&open_store()?, &branch, &cancel)?,
                (None, None) => None,
            };

            let source: Option<Box<dyn DiffSource>> = match (diff_file, git_diff, stdin_diff) {
                (Some(path), _, _) => Some(Box::new(FileDiff { path })),
                (None, Some(args), _) => Some(Box::new(GitDiff { args })),
                (None, None, true) => Some(Box::new(StdinDiff)),
                (None, None, false) => None,
            };
            let diff_text = source.map(|s| s.fetch_diff()).transpose()?;

            let comparator = Comparator::new(config.compare.clone());
            let (output, regressed) = cli::cmd_compare(
                &comparator,
                base.as_ref(),
                &head,
                diff_text.as_deref(),
                &format,
                fail_on_drop,
            )?;
            write_output(&output, None)?;
            return Ok(i32::from(regressed));
        }
        Commands::Merge {
            local,
            external,
            output,
        } => {
            let merged = cli::cmd_merge(&local, &external, config.merge.max_runs)?;
            write_output(&merged, output.as_ref())?;
            return Ok(0);
        }
        Commands::Export { branch, output } => {
            let exported = cli::cmd_export(&open_store()?, &branch, config.merge.max_runs, &cancel)?;
            write_output(&exported, output.as_ref())?;
            return Ok(0);
        }
        Commands::Sync {
            branch,
            artifact_dir,
        } => {
            let store = open_store()?;
            let transport: Box<dyn ArtifactTransport> = match artifact_dir {
                Some(dir) => Box::new(DirectoryTransport::new(dir)),
                None => Box::new(HttpTransport::from_env()?),
            };
            cli::cmd_sync(&store, transport.as_ref(), config.merge.clone(), &branch, &cancel)?
        }
    };

    write_output(&output, None)?;
    Ok(0)
}
