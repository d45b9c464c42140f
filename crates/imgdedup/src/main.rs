//! # imgdedup CLI (`dedup`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dedup init` | Create the SQLite database and run schema migrations |
//! | `dedup index <path>` | Register images under a directory and embed new or changed ones |
//! | `dedup cluster` | Rebuild duplicate groups from stored embeddings |
//! | `dedup review ...` | Inspect groups, record decisions, print the deletion plan |
//! | `dedup stats` | Show database counts |
//!
//! ## Examples
//!
//! ```bash
//! dedup init --config ./config/dedup.toml
//! dedup index ./photos --dry-run
//! dedup cluster --threshold 0.95 --backend hnsw
//! dedup review show g-3f2a9c0d1b7e4a65
//! dedup review set 0b6c... keep --allow-exception
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use imgdedup::{cluster_cmd, config, index_cmd, logging, migrate, review_cmd, stats};
use imgdedup_core::cluster::BackendKind;
use imgdedup_core::models::Decision;

/// Near-duplicate image detection with an operator review workflow.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dedup.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dedup",
    about = "Find near-duplicate images and review which copies to delete",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dedup.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it on an existing database is safe.
    Init,

    /// Register images under a directory and embed new or changed ones.
    ///
    /// Files that disappeared since the last run are marked missing.
    Index {
        /// Directory to scan.
        path: PathBuf,

        /// Process at most this many files.
        #[arg(long)]
        limit: Option<usize>,

        /// Re-embed every file even if its content is unchanged.
        #[arg(long)]
        force: bool,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Classify files as new/changed/unchanged without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Rebuild duplicate groups from the stored embeddings.
    ///
    /// Replaces every existing group. Decisions for groups that survive
    /// unchanged are kept; the rest are discarded.
    Cluster {
        /// Override `clustering.similarity_threshold` (0 < t <= 1).
        #[arg(long)]
        threshold: Option<f32>,

        /// Override `clustering.backend` (`exact` or `hnsw`).
        #[arg(long)]
        backend: Option<BackendKind>,
    },

    /// Review duplicate groups and record keep/delete decisions.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum ReviewAction {
    /// List groups. Only unresolved groups unless `--all` is given.
    List {
        #[arg(long)]
        all: bool,
    },

    /// Show one group with its members and decisions.
    Show { group: String },

    /// Keep one member and delete the rest.
    ///
    /// Keeps the representative unless `--keep` names another member.
    /// Members that already have a decision are left alone unless
    /// `--override` is given.
    Resolve {
        group: String,

        /// Asset id of the member to keep.
        #[arg(long)]
        keep: Option<String>,

        /// Replace existing decisions.
        #[arg(long = "override")]
        override_existing: bool,
    },

    /// Set the decision for a single asset.
    Set {
        asset: String,

        /// `keep`, `delete`, or `pending`.
        decision: Decision,

        /// Permit a result with zero or multiple keeps in the group.
        #[arg(long)]
        allow_exception: bool,
    },

    /// Keep every member of a group.
    Ignore { group: String },

    /// Delete every member of a group.
    DeleteAll { group: String },

    /// Clear decisions for one group, or for all groups.
    Reset { group: Option<String> },

    /// Print the assets marked for deletion.
    Plan {
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            path,
            limit,
            force,
            batch_size,
            dry_run,
        } => {
            index_cmd::run_index(&cfg, &path, limit, force, batch_size, dry_run).await?;
        }
        Commands::Cluster { threshold, backend } => {
            cluster_cmd::run_cluster(&cfg, threshold, backend).await?;
        }
        Commands::Review { action } => match action {
            ReviewAction::List { all } => review_cmd::run_list(&cfg, all).await?,
            ReviewAction::Show { group } => review_cmd::run_show(&cfg, &group).await?,
            ReviewAction::Resolve {
                group,
                keep,
                override_existing,
            } => review_cmd::run_resolve(&cfg, &group, keep, override_existing).await?,
            ReviewAction::Set {
                asset,
                decision,
                allow_exception,
            } => review_cmd::run_set(&cfg, &asset, decision, allow_exception).await?,
            ReviewAction::Ignore { group } => review_cmd::run_ignore(&cfg, &group).await?,
            ReviewAction::DeleteAll { group } => review_cmd::run_delete_all(&cfg, &group).await?,
            ReviewAction::Reset { group } => review_cmd::run_reset(&cfg, group.as_deref()).await?,
            ReviewAction::Plan { json } => review_cmd::run_plan(&cfg, json).await?,
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
