use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use comfy_table::Cell;
use strata_core::config::StrataConfig;

use crate::dispatch::{open_repo, CmdResult};
use crate::format::{format_bytes, format_duration, format_time};
use crate::table::{add_kv_row, number_cell, CliTableTheme};

pub(crate) fn run_show(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let manager = repo.epoch_manager()?;
    let snap = manager.refresh_snapshot()?;
    let params = manager.parameters();
    let theme = CliTableTheme::detect();

    let mut summary = theme.new_kv_table();
    add_kv_row(&mut summary, theme, "Write epoch", snap.write_epoch);
    let started = snap
        .epoch_start_times
        .get(&snap.write_epoch)
        .map(|t| format_time(*t))
        .unwrap_or_else(|| "-".into());
    add_kv_row(&mut summary, theme, "Epoch started", started);
    add_kv_row(
        &mut summary,
        theme,
        "Checkpointed through",
        snap.checkpoint_max()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    add_kv_row(
        &mut summary,
        theme,
        "Deletion watermark",
        snap.deletion_watermark
            .map(format_time)
            .unwrap_or_else(|| "-".into()),
    );
    add_kv_row(&mut summary, theme, "Snapshot valid until", format_time(snap.valid_until));
    add_kv_row(
        &mut summary,
        theme,
        "Min epoch duration",
        format_duration(params.min_epoch_duration),
    );
    add_kv_row(
        &mut summary,
        theme,
        "Refresh frequency",
        format_duration(params.epoch_refresh_frequency),
    );
    println!("{summary}");
    println!();

    let mut epochs = theme.new_data_table(&["Epoch", "Index blobs", "Size", "Compacted"]);
    for epoch in 0..=snap.max_epoch() {
        let blobs = snap.uncompacted.get(&epoch).map(Vec::as_slice).unwrap_or(&[]);
        let compacted = if snap.chain_range_for(epoch).is_some() {
            "range"
        } else if snap.single_epoch_sets.contains_key(&epoch) {
            "single"
        } else {
            ""
        };
        if blobs.is_empty() && compacted.is_empty() {
            continue;
        }
        let size: u64 = blobs.iter().map(|b| b.length).sum();
        epochs.add_row(vec![
            number_cell(epoch),
            number_cell(blobs.len()),
            number_cell(format_bytes(size)),
            Cell::new(compacted),
        ]);
    }
    println!("{epochs}");
    Ok(())
}

pub(crate) fn run_maintain(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let stats = repo.epoch_manager()?.maintain()?;

    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(
        &mut table,
        theme,
        "Advanced to epoch",
        stats
            .advanced_to
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    add_kv_row(&mut table, theme, "Compacted epochs", stats.compacted_epochs);
    add_kv_row(
        &mut table,
        theme,
        "Range checkpoint",
        stats
            .range_checkpoint
            .map(|(min, max)| format!("{min}-{max}"))
            .unwrap_or_else(|| "-".into()),
    );
    add_kv_row(&mut table, theme, "Deleted blobs", stats.cleanup.deleted);
    add_kv_row(&mut table, theme, "Retained blobs", stats.cleanup.protected);
    println!("{table}");
    Ok(())
}

pub(crate) fn run_cleanup(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let stats = repo.epoch_manager()?.cleanup()?;
    println!("Deleted {} index blob(s).", stats.deleted);
    if stats.protected > 0 {
        println!("{} blob(s) still under retention were kept.", stats.protected);
    }
    Ok(())
}

pub(crate) fn run_checkpoint(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    force: bool,
) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    match repo.epoch_manager()?.generate_range_checkpoint(force)? {
        Some((min, max)) => println!("Wrote range checkpoint for epochs {min}-{max}."),
        None => println!("No range checkpoint needed."),
    }
    Ok(())
}
