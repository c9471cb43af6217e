// src/main.rs

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use cmam::cache::{CacheStore, CleanPolicy};
use cmam::config::Settings;
use cmam::db::models::Changeset;
use cmam::doctor;
use cmam::download::{DefaultFetcher, Fetcher};
use cmam::hash::Digest;
use cmam::layout::Layout;
use cmam::manifest::ManifestStore;
use cmam::package::{PackageRef, VersionSpec, normalize_name};
use cmam::registry;
#[cfg(windows)]
use cmam::search_path::RegistryScope;
#[cfg(not(windows))]
use cmam::search_path::ProfileScope;
use cmam::search_path::{PathRegistrar, UserPathScope};
use cmam::transaction::{
    Operation, SwapOutcome, TransactionEngine, TransactionReport, TxOutcome,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cmam")]
#[command(author, version, about = "Local application manager with verified downloads, atomic installs and rollback", long_about = None)]
struct Cli {
    /// cmam root directory (default: ~/.cmam)
    #[arg(long, global = true, env = "CMAM_ROOT")]
    root: Option<PathBuf>,

    /// Show debug output
    #[arg(long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only show warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a package
    Install {
        /// Package name
        name: String,
        /// Version to install (default: latest)
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Reinstall even if the same build is already installed
        #[arg(short, long)]
        force: bool,
    },
    /// Update an installed package
    Update {
        /// Package name
        name: String,
        /// Version to move to (default: latest)
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Keep the replaced version for `cmam restore`
        #[arg(long)]
        keep_backup: bool,
    },
    /// Remove an installed package (a backup is kept)
    Uninstall {
        /// Package name
        name: String,
    },
    /// Put the most recent backup of a package back in place
    Restore {
        /// Package name
        name: String,
    },
    /// Update cmam itself (takes effect on the next launch)
    SelfUpdate {
        /// Version to stage (default: latest)
        #[arg(short = 'v', long)]
        version: Option<String>,
        /// Stage even if the running binary is already that build
        #[arg(short, long)]
        force: bool,
    },
    /// List installed packages
    List,
    /// Show details of an installed package
    Info {
        /// Package name
        name: String,
    },
    /// Show transaction history
    History {
        /// Only show transactions for this package
        name: Option<String>,
    },
    /// Check the installation for problems
    Doctor {
        /// Rebuild the manifest from verifiable install markers
        #[arg(long)]
        fix: bool,
    },
    /// Inspect or clean the download cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached artifacts, least recently used first
    List,
    /// Evict old and least recently used artifacts
    Clean {
        /// Evict entries not used for this many days
        #[arg(long)]
        max_age_days: Option<u32>,
        /// Shrink the cache below this many bytes
        #[arg(long)]
        max_bytes: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Stable exit code for a failed command
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<cmam::Error>())
        .map(|e| e.outcome().code())
        .unwrap_or(1)
}

fn run(cli: Cli) -> Result<()> {
    let Some(command) = cli.command else {
        println!("cmam v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'cmam --help' for usage information");
        return Ok(());
    };

    if let Commands::Completions { shell } = command {
        clap_complete::generate(shell, &mut Cli::command(), "cmam", &mut std::io::stdout());
        return Ok(());
    }

    let root = match cli.root {
        Some(root) => root,
        None => Layout::default_root()?,
    };
    let layout = Layout::new(root);
    let settings = Settings::load(&layout)?;

    // Doctor inspects the root as it is, before recovery touches it
    if let Commands::Doctor { fix } = command {
        return cmd_doctor(&layout, &settings, fix);
    }

    let engine = build_engine(&layout, &settings)?;
    match engine.recover() {
        Ok(report) => {
            for item in &report.unresolved {
                warn!("Unresolved interrupted transaction: {}", item);
            }
            match &report.swap {
                Some(SwapOutcome::Completed { version })
                | Some(SwapOutcome::AlreadySwapped { version }) => {
                    println!("cmam updated to {}", version);
                }
                Some(SwapOutcome::Discarded { reason }) => {
                    println!("Pending cmam update discarded: {}", reason);
                }
                None => {}
            }
        }
        Err(e) => warn!("Startup recovery failed: {}", e),
    }

    match command {
        Commands::Install {
            name,
            version,
            force,
        } => {
            let package = PackageRef::new(&name, VersionSpec::from_option(version.as_deref()))?;
            info!("Installing package: {}", package);
            let report = engine
                .install(&package, force)
                .with_context(|| format!("Failed to install {}", name))?;
            print_report(&report);
            if report.outcome == TxOutcome::Committed {
                register_path(&layout, &settings);
            }
            Ok(())
        }
        Commands::Update {
            name,
            version,
            keep_backup,
        } => {
            let package = PackageRef::new(&name, VersionSpec::from_option(version.as_deref()))?;
            let report = engine
                .update(&package, keep_backup)
                .with_context(|| format!("Failed to update {}", name))?;
            print_report(&report);
            Ok(())
        }
        Commands::Uninstall { name } => {
            let report = engine
                .uninstall(&name)
                .with_context(|| format!("Failed to uninstall {}", name))?;
            print_report(&report);
            Ok(())
        }
        Commands::Restore { name } => {
            let report = engine
                .restore(&name)
                .with_context(|| format!("Failed to restore {}", name))?;
            print_report(&report);
            Ok(())
        }
        Commands::SelfUpdate { version, force } => {
            let report = engine
                .self_update(&VersionSpec::from_option(version.as_deref()), force)
                .context("Failed to update cmam")?;
            print_report(&report);
            Ok(())
        }
        Commands::List => {
            let manifest = engine.store().snapshot()?;
            if manifest.is_empty() {
                println!("No packages installed.");
            } else {
                println!("Installed packages:");
                for entry in manifest.iter() {
                    print!("  {} {}", entry.name, entry.version);
                    if let Some(backup) = &entry.backup {
                        print!(" [backup #{}]", backup.sequence);
                    }
                    println!();
                }
                println!("\nTotal: {} package(s)", manifest.len());
            }
            Ok(())
        }
        Commands::Info { name } => {
            let name = normalize_name(&name)?;
            let manifest = engine.store().snapshot()?;
            let entry = manifest
                .get(&name)
                .ok_or_else(|| cmam::Error::NotInstalled(name.clone()))?;

            println!("{} {}", entry.name, entry.version);
            println!("  Path: {}", entry.install_path.display());
            println!("  Digest: {}", entry.digest);
            println!("  Installed: {}", entry.installed_at);

            let backups = engine.backups().list(&name)?;
            if backups.is_empty() {
                println!("  Backups: none");
            } else {
                println!("  Backups:");
                for record in backups.iter().rev() {
                    println!(
                        "    #{} {} ({})",
                        record.sequence, record.entry.version, record.created_at
                    );
                }
            }
            Ok(())
        }
        Commands::History { name } => {
            let conn = cmam::db::init(&layout.database_path())?;
            let changesets = match name {
                Some(name) => Changeset::find_by_package(&conn, &normalize_name(&name)?)?,
                None => Changeset::list_all(&conn)?,
            };

            if changesets.is_empty() {
                println!("No transaction history.");
            } else {
                println!("Transaction history:");
                for changeset in &changesets {
                    let timestamp = changeset
                        .finished_at
                        .as_deref()
                        .or(changeset.created_at.as_deref())
                        .unwrap_or("pending");
                    let versions = match (&changeset.from_version, &changeset.to_version) {
                        (Some(from), Some(to)) => format!("{} -> {}", from, to),
                        (None, Some(to)) => to.clone(),
                        (Some(from), None) => format!("{} -> (removed)", from),
                        (None, None) => String::new(),
                    };
                    print!(
                        "  [{}] {} {} {} {} ({})",
                        changeset.id.unwrap_or_default(),
                        timestamp,
                        changeset.operation,
                        changeset.package,
                        versions,
                        changeset.status.as_str()
                    );
                    if let Some(error) = &changeset.error {
                        print!(": {}", error);
                    }
                    println!();
                }
                println!("\nTotal: {} transaction(s)", changesets.len());
            }
            Ok(())
        }
        Commands::Cache { command } => cmd_cache(&layout, &settings, &engine, command),
        Commands::Doctor { .. } | Commands::Completions { .. } => Ok(()),
    }
}

fn build_engine(layout: &Layout, settings: &Settings) -> Result<TransactionEngine> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(DefaultFetcher::new(settings.http_timeout())?);
    let registry = registry::from_settings(&settings.registry, fetcher.clone(), settings.retry_policy());
    Ok(TransactionEngine::new(
        layout.clone(),
        settings,
        registry,
        fetcher,
    )?)
}

fn print_report(report: &TransactionReport) {
    let to = report.to_version.as_deref().unwrap_or("?");
    match report.outcome {
        TxOutcome::Unchanged => {
            println!("{} {} is already installed", report.package, to);
        }
        TxOutcome::Pending => {
            println!(
                "cmam {} downloaded and verified; it takes effect the next time cmam starts",
                to
            );
        }
        TxOutcome::Committed => {
            match (report.operation, report.from_version.as_deref()) {
                (Operation::Uninstall, from) => {
                    println!("Uninstalled {} {}", report.package, from.unwrap_or("?"));
                }
                (Operation::Restore, _) => println!("Restored {} {}", report.package, to),
                (_, Some(from)) if from != to => {
                    println!("Updated {} {} -> {}", report.package, from, to);
                }
                _ => println!("Installed {} {}", report.package, to),
            }
            if let Some(path) = &report.install_path {
                println!("  Path: {}", path.display());
            }
            if let Some(sequence) = report.backup {
                println!("  Backup: #{} (use `cmam restore {}`)", sequence, report.package);
            }
        }
    }
}

/// Where the user-level PATH is persisted on this platform
#[cfg(windows)]
fn user_scope(_settings: &Settings) -> cmam::Result<impl UserPathScope> {
    Ok(RegistryScope::new())
}

#[cfg(not(windows))]
fn user_scope(settings: &Settings) -> cmam::Result<impl UserPathScope> {
    Ok(ProfileScope::new(settings.profile_path()?))
}

/// Put the install directory on the user's PATH after an install
///
/// The install itself already committed, so failures only warn.
fn register_path(layout: &Layout, settings: &Settings) {
    let scope = match user_scope(settings) {
        Ok(scope) => scope,
        Err(e) => {
            warn!("Could not update PATH: {}", e);
            return;
        }
    };
    let registrar = PathRegistrar::new(scope);
    match registrar.ensure_registered(&layout.scripts_dir()) {
        Ok(true) => println!(
            "Added {} to PATH in {}; start a new shell to use it",
            layout.scripts_dir().display(),
            registrar.scope().describe()
        ),
        Ok(false) => {}
        Err(e) => warn!("Could not update PATH: {}", e),
    }
}

fn cmd_doctor(layout: &Layout, settings: &Settings, fix: bool) -> Result<()> {
    let store = ManifestStore::new(layout, settings.lock_timeout());
    let registrar = PathRegistrar::new(user_scope(settings)?);

    if fix {
        layout.ensure()?;
        let repaired = store.repair().context("Failed to repair the manifest")?;
        println!(
            "Manifest rebuilt with {} package(s); {} unverifiable record(s) dropped",
            repaired.manifest.len(),
            repaired.unresolved().len()
        );
    }

    let report = doctor::diagnose(layout, &store, &registrar);
    print!("{}", report.render());
    if report.has_errors() {
        anyhow::bail!("doctor found problems that need attention");
    }
    Ok(())
}

fn cmd_cache(
    layout: &Layout,
    settings: &Settings,
    engine: &TransactionEngine,
    command: CacheCommands,
) -> Result<()> {
    let cache = CacheStore::new(layout);
    match command {
        CacheCommands::List => {
            let entries = cache.list()?;
            if entries.is_empty() {
                println!("Cache is empty.");
                return Ok(());
            }
            let total: u64 = entries.iter().map(|e| e.size).sum();
            for entry in &entries {
                println!(
                    "  {}  {:>12} bytes  last used {}",
                    entry.digest.short(),
                    entry.size,
                    entry.last_access
                );
            }
            println!("\nTotal: {} artifact(s), {} bytes", entries.len(), total);
            Ok(())
        }
        CacheCommands::Clean {
            max_age_days,
            max_bytes,
        } => {
            let mut policy = CleanPolicy {
                max_age: settings.cache_max_age(),
                max_bytes: settings.cache_max_bytes,
            };
            if let Some(days) = max_age_days {
                policy.max_age = std::time::Duration::from_secs(u64::from(days) * 24 * 60 * 60);
            }
            if let Some(bytes) = max_bytes {
                policy.max_bytes = bytes;
            }

            // Artifacts of installed versions stay so a reinstall is offline
            let protect: HashSet<Digest> = engine
                .store()
                .snapshot()?
                .iter()
                .map(|entry| entry.digest.clone())
                .collect();
            let report = cache.clean(&policy, &protect)?;
            println!(
                "Removed {} artifact(s) ({} bytes) and {} stale temp file(s); {} kept",
                report.removed.len(),
                report.freed_bytes,
                report.stale_temp_files,
                report.kept
            );
            Ok(())
        }
    }
}
