use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use strata_core::clock::SystemClock;
use strata_core::config::{parse_human_duration, StrataConfig};
use strata_core::format::{BlobCfg, MutableParameters, RetentionMode};
use strata_core::repo::Repository;

use crate::dispatch::CmdResult;
use crate::format::format_duration;

pub(crate) fn run_init(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    legacy: bool,
    retention_mode: Option<&str>,
    retention_period: Option<&str>,
) -> CmdResult {
    let parameters = initial_parameters(cfg, legacy)?;
    let blob_cfg = blob_cfg_from_args(retention_mode, retention_period)?;

    let repo = Repository::init_from_config(
        cfg,
        Arc::new(SystemClock),
        parameters.clone(),
        blob_cfg.clone(),
        Some(shutdown.clone()),
    )?;
    let unique_id = repo.format().format()?.unique_id;
    repo.close()?;

    println!("Repository initialized at: {}", cfg.repository.url);
    println!("Unique ID: {unique_id}");
    println!(
        "Index: v{}{}",
        u8::from(parameters.index_version),
        if legacy { " (legacy, upgrade later)" } else { "" }
    );
    if blob_cfg.is_retention_enabled() {
        println!(
            "Retention: {:?} for {}",
            blob_cfg.retention_mode,
            format_duration(blob_cfg.retention_period)
        );
    }
    Ok(())
}

fn initial_parameters(
    cfg: &StrataConfig,
    legacy: bool,
) -> Result<MutableParameters, Box<dyn std::error::Error>> {
    let base = if legacy {
        MutableParameters::legacy()
    } else {
        MutableParameters {
            epoch_parameters: cfg.epoch.to_parameters()?,
            ..MutableParameters::default()
        }
    };
    Ok(MutableParameters {
        max_pack_size: cfg.repository.max_pack_size,
        ..base
    })
}

fn blob_cfg_from_args(
    mode: Option<&str>,
    period: Option<&str>,
) -> Result<BlobCfg, Box<dyn std::error::Error>> {
    let (Some(mode), Some(period)) = (mode, period) else {
        return Ok(BlobCfg::default());
    };
    let mode = match mode.to_ascii_lowercase().as_str() {
        "governance" => RetentionMode::Governance,
        "compliance" => RetentionMode::Compliance,
        other => return Err(format!("unknown retention mode: '{other}'").into()),
    };
    Ok(BlobCfg::retention(mode, parse_human_duration(period)?))
}
