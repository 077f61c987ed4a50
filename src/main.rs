use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use github_backup::backup::RepoOutcome;
use github_backup::config::CliOverrides;
use github_backup::{
    BackupEngine, Catalog, Config, GitHubCatalog, ProgressEvent, ProgressSink, StateDb,
};

/// Exit code when the run completed but some repositories or prunes failed
const EXIT_PARTIAL_FAILURE: u8 = 2;

#[derive(Parser)]
#[command(name = "github-backup")]
#[command(about = "Incremental mirror backups of every repository in a GitHub account")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory that receives archives
    #[arg(short = 'd', long = "dir")]
    output_directory: Option<String>,

    /// Organization to back up
    #[arg(short, long)]
    organization: Option<String>,

    /// User to back up, and login for credentials
    #[arg(short, long)]
    username: Option<String>,

    /// Password or personal access token
    #[arg(short, long)]
    password: Option<String>,

    /// State database path
    #[arg(long)]
    state_file: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up changed repositories, then prune (default)
    Backup {
        /// Only report what would be backed up
        #[arg(long)]
        dry_run: bool,
    },

    /// Prune expired archives only
    Prune,

    /// List repositories with their recorded state
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    config.apply_overrides(CliOverrides {
        output_directory: cli.output_directory,
        organization: cli.organization,
        username: cli.username,
        password: cli.password,
        state_file: cli.state_file,
    })?;

    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting github-backup v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Backup { dry_run: false }) {
        Commands::Backup { dry_run } => cmd_backup(dry_run, &config).await,
        Commands::Prune => cmd_prune(&config),
        Commands::List => cmd_list(&config).await,
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let default_level = if verbose { "debug" } else { level };
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

/// Prints one line per repository event
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, event: ProgressEvent<'_>) {
        match event {
            ProgressEvent::Started { repo } => println!("Backing up {}..", repo),
            ProgressEvent::Succeeded { repo, .. } => println!("{}: OK", repo),
            ProgressEvent::Skipped { repo } => println!("{}: SKIPPING", repo),
            ProgressEvent::Failed { repo, error } => println!("{}: ERROR ({})", repo, error),
        }
    }
}

fn open_state(config: &Config) -> Result<StateDb> {
    let path = config.state_path();
    StateDb::open_at(&path)
        .with_context(|| format!("Failed to open state database at {}", path.display()))
}

async fn cmd_backup(dry_run: bool, config: &Config) -> Result<ExitCode> {
    let request = config
        .build_request(dry_run)
        .context("Invalid configuration")?;
    let catalog = GitHubCatalog::with_api_url(&config.api_url)?;
    let mirror = config.mirror_transfer();
    // a dry run must not create the state database
    let state = if dry_run && !config.state_path().exists() {
        StateDb::open_in_memory()?
    } else {
        open_state(config)?
    };

    let summary = BackupEngine::new(&catalog, &mirror, &state)
        .with_progress(&ConsoleProgress)
        .run(&request)
        .await
        .with_context(|| format!("Backup of {} failed", request.account))?;

    if dry_run {
        for report in &summary.reports {
            if let RepoOutcome::WouldBackUp { reason } = &report.outcome {
                println!("  would back up {} ({})", report.name, reason.as_str());
            }
        }
    }

    if let Some(prune) = &summary.prune {
        for path in &prune.deleted {
            println!("Pruned {}", path.display());
        }
        for (path, reason) in &prune.failed {
            println!("Failed to prune {}: {}", path.display(), reason);
        }
    }
    if let Some(reason) = &summary.prune_error {
        println!("Pruning failed: {}", reason);
    }

    println!(
        "{} repositories: {} backed up, {} skipped, {} failed ({:.1}s)",
        summary.total_repositories,
        summary.backed_up,
        summary.skipped,
        summary.failed,
        summary.duration.as_secs_f64()
    );

    Ok(if summary.has_failures() || summary.prune_failed() {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    } else {
        ExitCode::SUCCESS
    })
}

fn cmd_prune(config: &Config) -> Result<ExitCode> {
    let request = config
        .build_request(false)
        .context("Invalid configuration")?;
    let state = open_state(config)?;
    let catalog = GitHubCatalog::with_api_url(&config.api_url)?;
    let mirror = config.mirror_transfer();

    let report = BackupEngine::new(&catalog, &mirror, &state).prune(&request, chrono::Utc::now())?;

    for path in &report.deleted {
        println!("Pruned {}", path.display());
    }
    for (path, reason) in &report.failed {
        println!("Failed to prune {}: {}", path.display(), reason);
    }
    println!(
        "{} archive(s) deleted, {} kept",
        report.deleted.len(),
        report.kept.len()
    );

    Ok(if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    })
}

async fn cmd_list(config: &Config) -> Result<ExitCode> {
    let request = config
        .build_request(true)
        .context("Invalid configuration")?;
    let catalog = GitHubCatalog::with_api_url(&config.api_url)?;
    let state = open_state(config)?;

    let repositories = catalog
        .list_repositories(&request.account, request.credentials.as_ref())
        .await
        .with_context(|| format!("Failed to list repositories of {}", request.account))?;
    let repositories = request.filter.apply(repositories);

    println!("Repositories ({}):", repositories.len());

    for repo in repositories {
        let key = request.account.qualify(&repo.name);
        match state.get_repo(&key)? {
            Some(recorded) => println!(
                "  {} (last backup {}, {} branch(es))",
                repo.name,
                recorded.last_backup_at.format("%Y-%m-%d %H:%M"),
                recorded.branch_heads.len()
            ),
            None => println!("  {} (never backed up)", repo.name),
        }
    }

    Ok(ExitCode::SUCCESS)
}
