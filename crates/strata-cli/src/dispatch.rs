use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use strata_core::clock::SystemClock;
use strata_core::config::StrataConfig;
use strata_core::repo::Repository;

use crate::cli::{CacheCommand, Commands, EpochCommand, IndexCommand, UpgradeCommand};
use crate::cmd;

pub(crate) type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Open the repository the config points at.
pub(crate) fn open_repo(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
) -> Result<Repository, Box<dyn std::error::Error>> {
    let repo = Repository::open_from_config(cfg, Arc::new(SystemClock), Some(shutdown.clone()))?;
    Ok(repo)
}

pub(crate) fn dispatch_command(
    command: &Commands,
    cfg: &StrataConfig,
    shutdown: Arc<AtomicBool>,
) -> CmdResult {
    match command {
        Commands::Init {
            legacy,
            retention_mode,
            retention_period,
        } => cmd::init::run_init(
            cfg,
            &shutdown,
            *legacy,
            retention_mode.as_deref(),
            retention_period.as_deref(),
        ),
        // Handled before the config is loaded.
        Commands::Config { .. } => Ok(()),
        Commands::Put { file, prefix } => cmd::content::run_put(cfg, &shutdown, file, *prefix),
        Commands::Cat { id } => cmd::content::run_cat(cfg, &shutdown, id),
        Commands::Delete { id } => cmd::content::run_delete(cfg, &shutdown, id),
        Commands::Index { command } => match command {
            IndexCommand::List { all, json } => cmd::index::run_list(cfg, &shutdown, *all, *json),
            IndexCommand::Contents { deleted, json } => {
                cmd::index::run_contents(cfg, &shutdown, *deleted, *json)
            }
            IndexCommand::Compact {
                all,
                max_small_blobs,
                drop_deleted_older_than,
                drop,
                allow_dangerous,
            } => cmd::index::run_compact(
                cfg,
                &shutdown,
                cmd::index::CompactArgs {
                    all: *all,
                    max_small_blobs: *max_small_blobs,
                    drop_deleted_older_than: drop_deleted_older_than.as_deref(),
                    drop,
                    allow_dangerous: *allow_dangerous,
                },
            ),
            IndexCommand::Recover { pack, commit } => {
                cmd::index::run_recover(cfg, &shutdown, pack.as_deref(), *commit)
            }
        },
        Commands::Epoch { command } => match command {
            EpochCommand::Show => cmd::epoch::run_show(cfg, &shutdown),
            EpochCommand::Maintain => cmd::epoch::run_maintain(cfg, &shutdown),
            EpochCommand::Cleanup => cmd::epoch::run_cleanup(cfg, &shutdown),
            EpochCommand::Checkpoint { force } => {
                cmd::epoch::run_checkpoint(cfg, &shutdown, *force)
            }
        },
        Commands::Cache { command } => match command {
            CacheCommand::Sync => cmd::cache::run_sync(cfg, &shutdown),
        },
        Commands::Upgrade { command } => match command {
            UpgradeCommand::Begin { owner, message } => {
                cmd::upgrade::run_begin(cfg, &shutdown, owner.as_deref(), message)
            }
            UpgradeCommand::Status { json } => cmd::upgrade::run_status(cfg, &shutdown, *json),
            UpgradeCommand::Rollback { force } => {
                cmd::upgrade::run_rollback(cfg, &shutdown, *force)
            }
        },
    }
}
