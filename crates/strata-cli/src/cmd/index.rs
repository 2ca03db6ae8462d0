use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use comfy_table::Cell;
use strata_core::clock::chrono_duration;
use strata_core::config::{parse_human_duration, StrataConfig};
use strata_core::index::CompactOptions;
use strata_types::{BlobId, ContentId};

use crate::dispatch::{open_repo, CmdResult};
use crate::format::{format_bytes, format_time, format_unix_time};
use crate::table::{add_kv_row, number_cell, CliTableTheme};

pub(crate) struct CompactArgs<'a> {
    pub all: bool,
    pub max_small_blobs: usize,
    pub drop_deleted_older_than: Option<&'a str>,
    pub drop: &'a [String],
    pub allow_dangerous: bool,
}

pub(crate) fn run_list(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    all: bool,
    json: bool,
) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let blobs = repo.content().index_blobs(all)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&blobs)?);
        return Ok(());
    }

    let corrupt = repo.content().corrupt_index_blobs();
    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["ID", "Size", "Written", "State"]);
    for blob in &blobs {
        let state = if corrupt.contains(&blob.id) {
            "corrupt"
        } else if blob.superseded {
            "superseded"
        } else {
            "active"
        };
        table.add_row(vec![
            Cell::new(blob.id.as_str()),
            number_cell(format_bytes(blob.length)),
            Cell::new(format_time(blob.timestamp)),
            Cell::new(state),
        ]);
    }
    println!("{table}");
    println!();
    println!(
        "{} index blob(s), v{} index",
        blobs.len(),
        u8::from(repo.content().index_version())
    );
    if !corrupt.is_empty() {
        println!(
            "{} corrupt index blob(s); run `strata index recover --commit` to rebuild.",
            corrupt.len()
        );
    }
    Ok(())
}

pub(crate) fn run_contents(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    deleted: bool,
    json: bool,
) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let contents = repo.content().iterate_contents(deleted);

    if json {
        println!("{}", serde_json::to_string_pretty(&contents)?);
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_data_table(&["Content", "Pack", "Offset", "Size", "Written", ""]);
    for info in &contents {
        table.add_row(vec![
            Cell::new(info.content_id),
            Cell::new(info.pack_blob_id.as_str()),
            number_cell(info.packed_offset),
            number_cell(format_bytes(u64::from(info.original_length))),
            Cell::new(format_unix_time(info.timestamp)),
            Cell::new(if info.deleted { "deleted" } else { "" }),
        ]);
    }
    println!("{table}");
    println!();
    println!("{} content(s)", contents.len());
    Ok(())
}

pub(crate) fn run_compact(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    args: CompactArgs<'_>,
) -> CmdResult {
    let mut repo = open_repo(cfg, shutdown)?;
    let opts = compact_options(&args, repo.clock().now())?;
    let stats = repo.content_mut().compact_indexes(&opts)?;

    if stats.input_blobs == 0 {
        println!("Nothing to compact.");
        return Ok(());
    }
    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "Merged blobs", stats.input_blobs);
    add_kv_row(&mut table, theme, "Written blobs", stats.output_blobs);
    add_kv_row(&mut table, theme, "Deleted blobs", stats.deleted_blobs);
    add_kv_row(&mut table, theme, "Dropped entries", stats.dropped_entries);
    println!("{table}");
    Ok(())
}

fn compact_options(
    args: &CompactArgs<'_>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<CompactOptions, Box<dyn std::error::Error>> {
    let drop_contents = args
        .drop
        .iter()
        .map(|id| id.parse::<ContentId>())
        .collect::<Result<Vec<_>, _>>()?;
    let drop_deleted_before = match args.drop_deleted_older_than {
        Some(age) => Some(now - chrono_duration(parse_human_duration(age)?)),
        None => None,
    };
    let opts = CompactOptions {
        max_small_blobs: args.max_small_blobs,
        all_indexes: args.all,
        drop_contents,
        drop_deleted_before,
        allow_dangerous: args.allow_dangerous,
    };
    opts.validate()?;
    Ok(opts)
}

pub(crate) fn run_recover(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    pack: Option<&str>,
    commit: bool,
) -> CmdResult {
    let mut repo = open_repo(cfg, shutdown)?;
    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();

    match pack {
        Some(pack) => {
            let report =
                repo.content_mut()
                    .recover_index_from_pack_blob(&BlobId::new(pack), None, commit)?;
            add_kv_row(&mut table, theme, "Pack", report.blob_id);
            add_kv_row(&mut table, theme, "Recovered contents", report.entries.len());
            add_kv_row(&mut table, theme, "New to the index", report.added);
            add_kv_row(
                &mut table,
                theme,
                "Unrecoverable",
                format_bytes(report.unrecoverable_bytes),
            );
        }
        None => {
            let stats = repo
                .content_mut()
                .recover_indexes(&cfg.recovery.to_options(commit))?;
            add_kv_row(&mut table, theme, "Pack blobs", stats.discovered_blobs);
            add_kv_row(&mut table, theme, "Processed", stats.processed_blobs);
            add_kv_row(&mut table, theme, "Failed", stats.failed_blobs);
            add_kv_row(&mut table, theme, "Recovered contents", stats.recovered_contents);
            add_kv_row(&mut table, theme, "New to the index", stats.added_contents);
            add_kv_row(
                &mut table,
                theme,
                "Unrecoverable",
                format_bytes(stats.unrecoverable_bytes),
            );
            if stats.removed_corrupt_index_blobs > 0 {
                add_kv_row(
                    &mut table,
                    theme,
                    "Removed corrupt index blobs",
                    stats.removed_corrupt_index_blobs,
                );
            }
        }
    }
    println!("{table}");
    if !commit {
        println!();
        println!("Dry run: pass --commit to write the recovered entries.");
    }
    repo.close()?;
    Ok(())
}
