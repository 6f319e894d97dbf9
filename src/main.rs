mod colors;
mod commands;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stowage::PackageManager;
use stowage::catalog::StaticCatalog;
use stowage::config::Config;
use stowage::host::{JsonSettings, SettingsDisabler};
use stowage::layout::Layout;
use stowage::transport::HttpTransport;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about = "Install, upgrade and remove host-application packages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Data directory (defaults to STOWAGE_DATA_DIR or the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Catalog JSON file (defaults to catalog.json in the data directory)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages
    Install {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Upgrade installed packages
    Upgrade {
        /// Package names (or all outdated if empty)
        packages: Vec<String>,
    },

    /// Install packages again even if current
    Reinstall {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Remove packages and libraries nothing else needs
    Remove {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// List installed packages
    List {
        /// Only unpacked package directories
        #[arg(long)]
        unpacked: bool,

        /// Only packages with a newer release
        #[arg(long)]
        outdated: bool,
    },

    /// List installed libraries
    Libraries {
        /// Only libraries no installed package needs
        #[arg(long)]
        orphaned: bool,
    },

    /// Reconcile state left by interrupted operations
    Cleanup,

    /// Manage package backups
    Backups {
        #[command(subcommand)]
        action: BackupsAction,
    },

    /// Show paths and effective settings
    Config,

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum BackupsAction {
    /// Delete backups older than the configured age
    Prune {
        /// Override max_backup_age (days)
        #[arg(long)]
        max_age: Option<u32>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "stowage=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager(cli: &Cli) -> anyhow::Result<PackageManager> {
    let layout = cli
        .data_dir
        .as_ref()
        .map(Layout::new)
        .unwrap_or_else(Layout::from_env);

    let config = Config::load(&layout.settings_file()).context("failed to read settings")?;
    layout
        .ensure(&config.python_versions)
        .context("failed to create data directory")?;
    let settings = Arc::new(JsonSettings::open(&layout.settings_file())?);

    let catalog_path = cli
        .catalog
        .clone()
        .unwrap_or_else(|| layout.root().join("catalog.json"));
    let catalog = if catalog_path.exists() {
        StaticCatalog::load(&catalog_path)
            .with_context(|| format!("failed to load catalog {}", catalog_path.display()))?
    } else {
        tracing::debug!(path = %catalog_path.display(), "no catalog; nothing is available");
        StaticCatalog::default()
    };

    let transport = HttpTransport::new(Duration::from_secs(config.http_timeout_secs))?;
    let disabler = Arc::new(SettingsDisabler::new(settings.clone()));

    Ok(PackageManager::new(
        layout,
        config,
        settings,
        Arc::new(catalog),
        Arc::new(transport),
        disabler,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    colors::init_colors();

    let Some(command) = &cli.command else {
        println!("{} stowage - package install engine", "📦".bold());
        println!("\nRun {} to see available commands.", "stowage --help".cyan());
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stowage", &mut std::io::stdout());
        return Ok(());
    }

    let pm = build_manager(&cli)?;

    // Mutating commands start from a reconciled state.
    if matches!(
        command,
        Commands::Install { .. }
            | Commands::Upgrade { .. }
            | Commands::Reinstall { .. }
            | Commands::Remove { .. }
    ) {
        let report = pm.cleanup().await;
        if !report.incompatible.is_empty() {
            println!(
                "{} {} installed packages are incompatible with this host; run {} for details",
                "⚠".yellow(),
                report.incompatible.len(),
                "stowage cleanup".cyan()
            );
        }
    }

    match command {
        Commands::Install { packages } => commands::install(&pm, packages).await?,
        Commands::Upgrade { packages } => commands::upgrade(&pm, packages).await?,
        Commands::Reinstall { packages } => commands::reinstall(&pm, packages).await?,
        Commands::Remove { packages } => commands::remove(&pm, packages).await?,
        Commands::List { unpacked, outdated } => commands::list(&pm, *unpacked, *outdated)?,
        Commands::Libraries { orphaned } => commands::libraries(&pm, *orphaned)?,
        Commands::Cleanup => commands::cleanup(&pm).await?,
        Commands::Backups {
            action: BackupsAction::Prune { max_age },
        } => commands::prune(&pm, *max_age)?,
        Commands::Config => commands::config(&pm)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
