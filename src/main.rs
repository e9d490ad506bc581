use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use releasegate::config::LoggingConfig;
use releasegate::control::SessionSummary;
use releasegate::registry::DaemonStatus;
use releasegate::{
    ChangeWatcher, Config, ControlSurface, GitCli, GitHubReleases, History, ProcessRegistry,
    ReleaseHost, StopOutcome, Supervisor, SyncRequest, VersionControl,
};

#[derive(Parser)]
#[command(name = "releasegate")]
#[command(about = "Gate which local changes are tagged, pushed and released")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to .releasegate.yml, then the XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the background watcher
    Start {
        /// Run the watcher in this process instead of detaching
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the background watcher
    Stop,

    /// Stop (if running) and start the background watcher
    Restart,

    /// Show watcher status
    Status,

    /// Commit, tag and publish the approved changes
    Sync {
        /// stable, release, hotfix or production
        class: String,

        /// Release message
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// Fast-forward the branch from the remote
    Pull,

    /// Push the branch and any release tags the remote is missing
    Push,

    /// Compare the local repository with the remote
    Check,

    /// Show remote repository metadata
    Info,

    /// Show recent sync events
    History {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Run the watcher loop (used by `start`)
    #[command(hide = true)]
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(|p| std::fs::canonicalize(&p).unwrap_or(p));
    let config = load_config(config_path.as_ref())?;

    let detached = matches!(cli.command, Commands::Watch);
    init_logging(cli.verbose, &config.logging, detached)?;
    info!("Starting releasegate v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Start { foreground } => cmd_start(foreground, &config, config_path).await,
        Commands::Stop => cmd_stop(&config, config_path).await,
        Commands::Restart => cmd_restart(&config, config_path).await,
        Commands::Status => cmd_status(&config),
        Commands::Sync { class, message } => cmd_sync(&class, &message.join(" "), &config).await,
        Commands::Pull => cmd_pull(&config).await,
        Commands::Push => cmd_push(&config).await,
        Commands::Check => cmd_check(&config).await,
        Commands::Info => cmd_info(&config).await,
        Commands::History { limit } => cmd_history(limit, &config),
        Commands::Watch => cmd_watch(&config).await,
    }
}

/// Initialize logging from verbosity and config. `RUST_LOG` always wins.
fn init_logging(verbose: bool, logging: &LoggingConfig, detached: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(logging.color && !detached)
                    .with_writer(io::stderr),
            )
            .init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn git_backend(config: &Config) -> Arc<dyn VersionControl> {
    Arc::new(GitCli::from_config(config))
}

/// Hosted-release capability, or `None` when it is disabled or has no credentials
async fn release_host(
    config: &Config,
    vcs: &Arc<dyn VersionControl>,
    for_publishing: bool,
) -> Option<Arc<dyn ReleaseHost>> {
    if for_publishing && !config.github.create_releases {
        return None;
    }

    let remote_url = vcs.remote_url().await.ok().flatten();
    match GitHubReleases::connect(config, remote_url.as_deref()) {
        Ok(host) => Some(Arc::new(host)),
        Err(e) => {
            warn!("GitHub releases unavailable: {:#}", e);
            None
        }
    }
}

fn open_history(config: &Config) -> Option<Arc<History>> {
    if !config.history.enabled {
        return None;
    }

    match History::open_at(std::path::Path::new(&config.history.db_path)) {
        Ok(history) => Some(Arc::new(history)),
        Err(e) => {
            warn!("History disabled: {:#}", e);
            None
        }
    }
}

async fn control_surface(config: &Config, for_publishing: bool) -> Result<ControlSurface> {
    let vcs = git_backend(config);
    let host = release_host(config, &vcs, for_publishing).await;
    ControlSurface::from_config(config, vcs, host, open_history(config)).await
}

fn watcher(config: &Config) -> Result<ChangeWatcher> {
    ChangeWatcher::from_config(config, git_backend(config), open_history(config))
}

async fn cmd_start(foreground: bool, config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    if foreground {
        let registry = ProcessRegistry::new(config.pid_file_path());
        let watcher = watcher(config)?;

        registry.claim()?.record(std::process::id())?;
        println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
        return watcher.serve(&registry).await;
    }

    // Fail on a broken config here rather than in the detached process
    config.watch_interval()?;
    config.tick_timeout()?;

    println!("🚀 Starting releasegate watcher...");
    let supervisor = Supervisor::from_config(config, config_path)?;
    let marker = supervisor.start()?;

    println!("✅ Watcher started in background");
    println!("   PID: {}", marker.pid);
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);
    println!("   Interval: {}", config.daemon.interval);
    Ok(())
}

async fn cmd_stop(config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    println!("🛑 Stopping releasegate watcher...");

    let supervisor = Supervisor::from_config(config, config_path)?;
    match supervisor.stop().await? {
        StopOutcome::Terminated { pid } => println!("✅ Watcher stopped (PID {})", pid),
        StopOutcome::Killed { pid } => {
            println!("✅ Watcher killed after ignoring SIGTERM (PID {})", pid)
        }
        StopOutcome::Reclaimed { pid } => {
            println!("⚠️  Watcher (PID {}) was already gone, stale marker removed", pid)
        }
    }
    Ok(())
}

async fn cmd_restart(config: &Config, config_path: Option<PathBuf>) -> Result<()> {
    println!("🔄 Restarting releasegate watcher...");

    config.watch_interval()?;
    let supervisor = Supervisor::from_config(config, config_path)?;
    let marker = supervisor.restart().await?;

    println!("✅ Watcher restarted (PID {})", marker.pid);
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("📊 releasegate Watcher Status");

    let registry = ProcessRegistry::new(config.pid_file_path());
    match registry.inspect() {
        Ok(DaemonStatus::Running(marker)) => {
            let uptime = Utc::now().signed_duration_since(marker.started_at);
            println!("   🟢 Status: running");
            println!("   🆔 PID: {}", marker.pid);
            println!("   🕒 Started: {}", marker.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("   ⏱️  Uptime: {:.1}m", uptime.num_seconds() as f64 / 60.0);
            println!("   🔄 Interval: {}", config.daemon.interval);
            println!("   📄 Log file: {}", config.daemon.log_file);
        }
        Ok(DaemonStatus::Stale(marker)) => {
            println!("   🟡 Status: stale");
            println!("   Recorded PID {} is gone; marker removed", marker.pid);
        }
        Ok(DaemonStatus::Stopped) => {
            println!("   🔴 Status: stopped");
            println!("   💡 Use 'releasegate start' to start the watcher");
        }
        Err(e) => {
            println!("   ⚠️  Status: unknown ({})", e);
        }
    }
    println!("   📁 PID file: {}", registry.path().display());

    Ok(())
}

async fn cmd_sync(class: &str, message: &str, config: &Config) -> Result<()> {
    // Reject bad input before touching git
    SyncRequest::new(class, message)?;

    let surface = control_surface(config, true).await?;
    let outcome = surface.sync(class, message, &terminal_confirm).await?;

    let session = &outcome.session;
    println!("\n🎉 Sync complete");
    println!("   🏷️  Tag: {}", session.tag_name);
    println!("   📦 Files: {}", session.file_count);
    println!("   🔗 Commit: {}", releasegate::git::short(&session.commit));
    println!("   🌿 Branch: {}", surface.branch());
    if let Some(url) = &outcome.release.hosted_url {
        println!("   📝 Release: {}", url);
    }
    if session.reused_tag {
        println!("   ♻️  Reused the unpublished tag from an earlier attempt");
    }
    if let Some(warning) = &outcome.warning {
        println!("   ⚠️  {}", warning);
    }

    Ok(())
}

/// Ask on the terminal. Only `y`/`yes` proceeds.
fn terminal_confirm(summary: &SessionSummary) -> bool {
    println!("📋 Sync summary");
    println!("   Class: {}", summary.request.class);
    println!("   Message: {}", summary.request.message);
    println!("   Branch: {}", summary.branch);
    println!("   Tag: {}", summary.tag_preview);
    println!("   Approved files: {}", summary.file_count());
    for path in summary.approved.iter().take(20) {
        println!("     + {}", path);
    }
    if summary.approved.len() > 20 {
        println!("     ... and {} more", summary.approved.len() - 20);
    }
    if summary.excluded > 0 {
        println!("   Excluded files: {} (never synced)", summary.excluded);
    }

    print!("Proceed? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_affirmative(&answer),
        Err(_) => false,
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

async fn cmd_pull(config: &Config) -> Result<()> {
    let surface = control_surface(config, false).await?;
    let summary = surface.pull().await?;
    println!("✅ {}", summary);
    Ok(())
}

async fn cmd_push(config: &Config) -> Result<()> {
    let surface = control_surface(config, true).await?;
    let report = surface.push().await?;

    println!("✅ Pushed {}", report.branch);
    if report.pushed_tags.is_empty() {
        println!("   No pending release tags");
    }
    for tag in &report.pushed_tags {
        println!("   🏷️  {}", tag);
    }
    Ok(())
}

async fn cmd_check(config: &Config) -> Result<()> {
    let surface = match control_surface(config, false).await {
        Ok(surface) => surface,
        Err(e) => {
            println!("⚠️  Cannot inspect repository: {:#}", e);
            return Ok(());
        }
    };
    let report = surface.check().await;

    println!("🔍 Local vs remote on {}", report.branch);
    match (&report.divergence, &report.remote_error) {
        (Some(d), _) => {
            println!("   ⬆️  Ahead: {}", d.ahead);
            println!("   ⬇️  Behind: {}", d.behind);
            for (status, path) in &d.changed_files {
                println!("     {} {}", status, path);
            }
        }
        (None, Some(e)) => println!("   ⚠️  Remote comparison unavailable: {}", e),
        (None, None) => {}
    }

    let approved = report.pending.approved();
    println!("   📝 Pending approved changes: {}", approved.len());
    for record in &report.pending.records {
        let marker = if record.is_approved() { "+" } else { "-" };
        println!("     {} {} ({})", marker, record.path, record.status);
    }
    if report.pending.excluded_count() > 0 {
        println!("   🚫 Excluded: {}", report.pending.excluded_count());
    }

    if !report.unpushed_tags.is_empty() {
        println!("   🏷️  Tags not on the remote (run 'releasegate push'):");
        for tag in &report.unpushed_tags {
            println!("     {}", tag);
        }
    }

    Ok(())
}

async fn cmd_info(config: &Config) -> Result<()> {
    let surface = match control_surface(config, false).await {
        Ok(surface) => surface,
        Err(e) => {
            println!("⚠️  Cannot inspect repository: {:#}", e);
            return Ok(());
        }
    };
    let report = surface.info().await;

    println!("ℹ️  Repository information");
    println!(
        "   🔗 Remote: {}",
        report.remote_url.as_deref().unwrap_or("(none)")
    );
    println!("   🌿 Branch: {}", report.branch);
    if let Some(head) = &report.head {
        println!("   📍 HEAD: {}", releasegate::git::short(head));
    }

    match (&report.remote, &report.remote_error) {
        (Some(remote), _) => {
            println!("   📁 {}", remote.full_name);
            if let Some(branch) = &remote.default_branch {
                println!("   Default branch: {}", branch);
            }
            if let Some(private) = remote.private {
                println!("   Visibility: {}", if private { "private" } else { "public" });
            }
            if let Some(pushed) = remote.pushed_at {
                println!("   Last push: {}", pushed.format("%Y-%m-%d %H:%M"));
            }
            if let Some(latest) = &remote.latest_release {
                println!("   Latest release: {}", latest);
            }
            if let Some(url) = &remote.html_url {
                println!("   {}", url);
            }
        }
        (None, Some(e)) => println!("   ⚠️  Remote metadata unavailable: {}", e),
        (None, None) => {}
    }

    Ok(())
}

fn cmd_history(limit: usize, config: &Config) -> Result<()> {
    let history = History::open_at(std::path::Path::new(&config.history.db_path))?;
    let events = history.recent(limit)?;

    if events.is_empty() {
        println!("No events recorded");
        return Ok(());
    }

    for event in events {
        let icon = if event.event_type.is_failure() { "❌" } else { "•" };
        println!(
            "{} {} {:<14} {} {}",
            icon,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.as_str(),
            event.tag_name.as_deref().unwrap_or("-"),
            event.summary
        );
    }
    Ok(())
}

/// Detached watcher entry point. The launching process has already recorded
/// this PID in the marker.
async fn cmd_watch(config: &Config) -> Result<()> {
    let registry = ProcessRegistry::new(config.pid_file_path());
    info!("Watcher process {} serving {}", std::process::id(), config.repository);
    watcher(config)?.serve(&registry).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_yes_affirms() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative("YES"));
        assert!(is_affirmative("  Yes  "));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("\n"));
        assert!(!is_affirmative("n"));
        assert!(!is_affirmative("yep"));
    }

    #[test]
    fn test_message_words_are_joined() {
        let cli = Cli::try_parse_from(["releasegate", "sync", "stable", "fix", "ranking"]).unwrap();
        match cli.command {
            Commands::Sync { class, message } => {
                assert_eq!(class, "stable");
                assert_eq!(message.join(" "), "fix ranking");
            }
            _ => panic!("expected sync"),
        }
    }
}
