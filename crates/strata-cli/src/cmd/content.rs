use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use strata_core::config::StrataConfig;
use strata_types::ContentId;

use crate::dispatch::{open_repo, CmdResult};
use crate::format::format_bytes;

pub(crate) fn run_put(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    file: &str,
    prefix: Option<char>,
) -> CmdResult {
    let data = std::fs::read(file).map_err(|e| format!("reading {file}: {e}"))?;
    let mut repo = open_repo(cfg, shutdown)?;
    let id = repo.content_mut().write_content(&data, prefix, None)?;
    repo.close()?;

    tracing::info!(content = %id, size = data.len(), "stored");
    println!("{id}");
    Ok(())
}

pub(crate) fn run_cat(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>, id: &str) -> CmdResult {
    let id: ContentId = id.parse()?;
    let repo = open_repo(cfg, shutdown)?;
    let data = repo.content().read_content(&id)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

pub(crate) fn run_delete(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>, id: &str) -> CmdResult {
    let id: ContentId = id.parse()?;
    let mut repo = open_repo(cfg, shutdown)?;
    let size = repo
        .content()
        .content_info(&id)
        .map(|info| u64::from(info.original_length))
        .unwrap_or(0);
    repo.content_mut().delete_content(&id)?;
    repo.close()?;

    println!("Deleted {id} ({})", format_bytes(size));
    Ok(())
}
