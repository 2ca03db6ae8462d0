use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Content index, epoch maintenance and format upgrades for strata repositories",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $STRATA_CONFIG              (environment variable)
  3. ./strata.yaml               (project)

Environment variables:
  STRATA_CONFIG       Path to configuration file (overrides default search)
  STRATA_PASSPHRASE   Repository passphrase (overrides the config file)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides STRATA_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Initialize a new repository
    Init {
        /// Create the repository with the flat legacy index
        #[arg(long)]
        legacy: bool,

        /// Object retention mode for data blobs (governance, compliance)
        #[arg(long, requires = "retention_period")]
        retention_mode: Option<String>,

        /// How long data blobs stay protected (e.g. 30d)
        #[arg(long, requires = "retention_mode")]
        retention_period: Option<String>,
    },

    /// Generate a minimal configuration file
    Config {
        /// Destination path (default: ./strata.yaml)
        #[arg(long)]
        dest: Option<String>,
    },

    /// Store a file as a single content and print its ID
    Put {
        /// File to store
        file: String,

        /// Single-letter content prefix (g-z)
        #[arg(long)]
        prefix: Option<char>,
    },

    /// Write a content's bytes to stdout
    Cat {
        /// Content ID
        id: String,
    },

    /// Mark a content as deleted
    Delete {
        /// Content ID
        id: String,
    },

    /// Inspect and maintain the content index
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },

    /// Inspect and maintain the epoch index
    Epoch {
        #[command(subcommand)]
        command: EpochCommand,
    },

    /// Manage the local metadata cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Upgrade the repository to the epoch index format
    Upgrade {
        #[command(subcommand)]
        command: UpgradeCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum IndexCommand {
    /// List index blobs
    List {
        /// Include blobs already superseded by compaction
        #[arg(long)]
        all: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List contents known to the index
    Contents {
        /// Include deleted contents
        #[arg(long)]
        deleted: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Merge small index blobs
    Compact {
        /// Merge every index blob regardless of size
        #[arg(long)]
        all: bool,

        /// Leave up to this many small blobs alone
        #[arg(long, default_value_t = 0)]
        max_small_blobs: usize,

        /// Drop deleted entries older than this age (e.g. 7d)
        #[arg(long)]
        drop_deleted_older_than: Option<String>,

        /// Drop the entry for this content ID (repeatable)
        #[arg(long = "drop")]
        drop: Vec<String>,

        /// Acknowledge that dropping entries can lose data
        #[arg(long)]
        allow_dangerous: bool,
    },

    /// Rebuild index entries from pack blobs
    Recover {
        /// Recover a single pack blob instead of scanning every pack
        #[arg(long)]
        pack: Option<String>,

        /// Write recovered entries to the index (default is a dry run)
        #[arg(long)]
        commit: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum EpochCommand {
    /// Show the current epoch snapshot
    Show,

    /// Advance, compact, checkpoint and clean up as needed
    Maintain,

    /// Delete index blobs no longer needed by any reader
    Cleanup,

    /// Write a range checkpoint over settled epochs
    Checkpoint {
        /// Write a checkpoint even if the frequency has not been reached
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum CacheCommand {
    /// Bring the local index blob cache in line with the repository
    Sync,
}

#[derive(Subcommand)]
pub(crate) enum UpgradeCommand {
    /// Take the upgrade lock and migrate to the epoch index
    Begin {
        /// Lock owner (default: user@host)
        #[arg(long)]
        owner: Option<String>,

        /// Note stored with the lock
        #[arg(long, default_value = "")]
        message: String,
    },

    /// Show the upgrade lock, if any
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Abandon an unfinished upgrade and restore the previous format
    Rollback {
        /// Acknowledge that writes made in the new format may be lost
        #[arg(long)]
        force: bool,
    },
}
