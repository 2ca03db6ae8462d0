use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use strata_core::config::StrataConfig;

use crate::dispatch::{open_repo, CmdResult};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) fn run_sync(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>) -> CmdResult {
    if cfg.repository.cache_path().is_none() {
        println!("No cache_dir configured; nothing to sync.");
        return Ok(());
    }
    let repo = open_repo(cfg, shutdown)?;
    let stats = repo.content().sync_metadata_cache()?;

    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "Downloaded", stats.downloaded);
    add_kv_row(&mut table, theme, "Already cached", stats.kept);
    add_kv_row(&mut table, theme, "Removed stale", stats.removed_stale);
    add_kv_row(&mut table, theme, "Dropped corrupt", stats.dropped_corrupt);
    println!("{table}");
    Ok(())
}
