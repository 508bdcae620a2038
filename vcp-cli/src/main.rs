//! vcp: copy, sync, move and remove files across versioned stores.
//!
//! # Usage
//!
//! ```bash
//! # Create a repository in the local store
//! vcp init alice/data
//!
//! # Upload a directory
//! vcp cp -r ./reports vcp://alice/data/main/reports
//!
//! # Create a branch from another one
//! vcp cp -r vcp://alice/data/main vcp://alice/data/release
//!
//! # Mirror a directory, copying only what changed
//! vcp sync ./site vcp://alice/data/main/site --use-mtime
//!
//! # Inspect
//! vcp ls vcp://alice/data/main
//! vcp log vcp://alice/data/main
//! vcp cat vcp://alice/data/main/reports/q1.csv --limit 1024
//!
//! # Branches
//! vcp branch make vcp://alice/data main release
//! vcp branch ls vcp://alice/data
//! vcp branch del vcp://alice/data release --yes
//! ```

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use vcp_core::executor::format_size;
use vcp_core::ops::{self, Context, CopyOptions};
use vcp_core::config::DEFAULT_BRANCH;
use vcp_core::{BackendRegistry, Config, DiskStore, SyncComparator, SyncOptions};

#[derive(Parser, Debug)]
#[command(name = "vcp")]
#[command(author = "vcp Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Copy files between local paths and versioned repository stores")]
struct Cli {
    /// Configuration file (default: ~/.vcp/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory of the on-disk store
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy files or directories
    Cp {
        /// Sources followed by the destination
        #[arg(required = true, num_args = 2..)]
        paths: Vec<String>,
        /// Copy directories recursively
        #[arg(short, long)]
        recursive: bool,
        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,
        /// Concurrent transfers
        #[arg(short, long)]
        parallel: Option<usize>,
        /// Print every committed change as JSON
        #[arg(long)]
        show_changes: bool,
    },

    /// Copy new and changed files from a directory into a destination
    Sync {
        source: String,
        destination: String,
        /// Also copy files whose source is newer
        #[arg(long)]
        use_mtime: bool,
        /// Report what would be copied without copying
        #[arg(long)]
        dryrun: bool,
        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,
        /// Concurrent transfers
        #[arg(short, long)]
        parallel: Option<usize>,
    },

    /// Move a file or directory within a branch
    Mv {
        source: String,
        destination: String,
        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Remove files or directories
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Commit message
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// List a directory
    Ls { path: String },

    /// Show the commit history of a branch
    Log { path: String },

    /// Print a file to stdout
    Cat {
        path: String,
        /// Maximum number of bytes to print (0 prints the whole file)
        #[arg(long, default_value_t = 0)]
        limit: u64,
    },

    /// Manage the branches of a repository
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },

    /// Create a repository in the on-disk store
    Init {
        /// Repository as user/repo
        repo: String,
        /// Initial branch
        #[arg(short, long, default_value = DEFAULT_BRANCH)]
        branch: String,
    },
}

#[derive(Subcommand, Debug)]
enum BranchCommands {
    /// List branches
    Ls {
        /// Repository as scheme://user/repo
        repo: String,
    },

    /// Create a branch as a copy of another one
    Make {
        repo: String,
        src_branch: String,
        new_branch: String,
    },

    /// Delete a branch and its history
    Del {
        repo: String,
        branch: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive("vcp=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = load_config(&cli)?;
    match cli.command {
        Commands::Cp {
            paths,
            recursive,
            message,
            parallel,
            show_changes,
        } => {
            config.parallel = parallel.unwrap_or(config.parallel);
            cmd_cp(config, paths, recursive, message, show_changes).await
        }

        Commands::Sync {
            source,
            destination,
            use_mtime,
            dryrun,
            message,
            parallel,
        } => {
            config.parallel = parallel.unwrap_or(config.parallel);
            cmd_sync(config, source, destination, use_mtime, dryrun, message).await
        }

        Commands::Mv {
            source,
            destination,
            message,
        } => cmd_mv(config, source, destination, message).await,

        Commands::Rm { paths, message } => cmd_rm(config, paths, message).await,

        Commands::Ls { path } => cmd_ls(config, path).await,

        Commands::Log { path } => cmd_log(config, path).await,

        Commands::Cat { path, limit } => cmd_cat(config, path, limit).await,

        Commands::Branch { command } => cmd_branch(config, command).await,

        Commands::Init { repo, branch } => cmd_init(config, repo, branch).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_with_env(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.apply_store_root_override(cli.store_root.clone());
    config.validate()?;
    tracing::debug!("Using store root {}", config.store_root.display());
    Ok(config)
}

fn build_context(config: Config) -> Result<Context> {
    let cwd = std::env::current_dir().context("Cannot determine working directory")?;
    let mut registry = BackendRegistry::new(config.default_endpoint.clone(), cwd);
    let store = DiskStore::new(config.store_root.clone(), config.default_endpoint.clone());
    registry.register(Arc::new(store))?;
    Ok(Context::new(registry, config))
}

async fn cmd_cp(
    config: Config,
    mut paths: Vec<String>,
    recursive: bool,
    message: String,
    show_changes: bool,
) -> Result<()> {
    let destination = paths.pop().context("Missing destination")?;
    let ctx = build_context(config)?;
    let options = CopyOptions { recursive, message };

    let report = ops::copy(&ctx, &paths, &destination, &options)
        .await
        .with_context(|| format!("Copy to {} failed", destination))?;

    println!("{}", report.summary.summary());
    for dir in &report.skipped_directories {
        println!("  skipped directory {} (use -r)", dir);
    }
    if show_changes {
        println!("{}", serde_json::to_string_pretty(&report.changes)?);
    }
    Ok(())
}

async fn cmd_sync(
    config: Config,
    source: String,
    destination: String,
    use_mtime: bool,
    dryrun: bool,
    message: String,
) -> Result<()> {
    let comparator = if use_mtime || config.use_mtime {
        SyncComparator::SizeAndTime
    } else {
        SyncComparator::SizeOnly
    };
    let ctx = build_context(config)?;
    let options = SyncOptions {
        comparator,
        dryrun,
        message,
    };

    let stats = ops::sync(&ctx, &source, &destination, options)
        .await
        .with_context(|| format!("Sync of {} to {} failed", source, destination))?;

    println!("Sync {}:", if dryrun { "plan" } else { "completed" });
    println!("  Copied:  {}", stats.copied);
    println!("  Ignored: {}", stats.ignored);
    println!("  Failed:  {}", stats.failed);
    Ok(())
}

async fn cmd_mv(config: Config, source: String, destination: String, message: String) -> Result<()> {
    let ctx = build_context(config)?;
    ops::move_path(&ctx, &source, &destination, &message)
        .await
        .with_context(|| format!("Failed to move {} to {}", source, destination))?;
    println!("Moved {} -> {}", source, destination);
    Ok(())
}

async fn cmd_rm(config: Config, paths: Vec<String>, message: String) -> Result<()> {
    let ctx = build_context(config)?;
    ops::remove(&ctx, &paths, &message)
        .await
        .context("Remove failed")?;
    for p in &paths {
        println!("Removed {}", p);
    }
    Ok(())
}

async fn cmd_ls(config: Config, path: String) -> Result<()> {
    let ctx = build_context(config)?;
    let entries = ops::list(&ctx, &path)
        .await
        .with_context(|| format!("Cannot list {}", path))?;
    for entry in entries {
        let mtime = entry
            .info
            .mtime
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        if entry.info.is_dir() {
            println!("{:>10}  {:16}  {}/", "-", mtime, entry.name);
        } else {
            println!("{:>10}  {:16}  {}", format_size(entry.info.size), mtime, entry.name);
        }
    }
    Ok(())
}

async fn cmd_log(config: Config, path: String) -> Result<()> {
    let ctx = build_context(config)?;
    let records = ops::log(&ctx, &path)
        .await
        .with_context(|| format!("Cannot read log of {}", path))?;
    if records.is_empty() {
        println!("No commits on {}", path);
        return Ok(());
    }
    for record in records.iter().rev() {
        let date = chrono::DateTime::from_timestamp(record.timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| record.timestamp.to_string());
        let short = record.id.get(..8).unwrap_or(&record.id);
        println!("{}  {}  {} change(s)  {}", short, date, record.changes, record.message);
    }
    Ok(())
}

async fn cmd_cat(config: Config, path: String, limit: u64) -> Result<()> {
    let ctx = build_context(config)?;
    let limit = (limit > 0).then_some(limit);
    let mut stdout = tokio::io::stdout();
    ops::cat(&ctx, &path, limit, &mut stdout)
        .await
        .with_context(|| format!("Cannot print {}", path))?;
    Ok(())
}

async fn cmd_branch(config: Config, command: BranchCommands) -> Result<()> {
    let ctx = build_context(config)?;
    match command {
        BranchCommands::Ls { repo } => {
            let branches = ops::list_branches(&ctx, &repo)
                .await
                .with_context(|| format!("Cannot list branches of {}", repo))?;
            for branch in branches {
                println!("{}", branch.name);
            }
        }
        BranchCommands::Make {
            repo,
            src_branch,
            new_branch,
        } => {
            ops::make_branch(&ctx, &repo, &src_branch, &new_branch)
                .await
                .with_context(|| format!("Failed to create branch {}", new_branch))?;
            println!("Created branch {} from {}", new_branch, src_branch);
        }
        BranchCommands::Del { repo, branch, yes } => {
            eprintln!("Deleting a branch cannot be undone.");
            eprintln!("Content that only exists on {} will be lost.", branch);
            if !yes {
                eprintln!("Add --yes to delete");
                return Ok(());
            }
            ops::delete_branch(&ctx, &repo, &branch)
                .await
                .with_context(|| format!("Failed to delete branch {}", branch))?;
            println!("Deleted branch {}", branch);
        }
    }
    Ok(())
}

async fn cmd_init(config: Config, repo: String, branch: String) -> Result<()> {
    let store = DiskStore::new(config.store_root.clone(), config.default_endpoint.clone());
    store
        .init_repo(&repo, &branch)
        .await
        .with_context(|| format!("Failed to initialize {}", repo))?;
    println!("Initialized {} (branch {})", repo, branch);
    println!("  Store: {}", store.root().display());
    println!("  URL:   vcp://{}/{}", repo.trim_matches('/'), branch);
    Ok(())
}
