use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use strata_core::config::StrataConfig;
use strata_core::upgrade::{UpgradeOptions, UpgradeState};

use crate::dispatch::{open_repo, CmdResult};
use crate::format::{format_duration, format_time};
use crate::table::{add_kv_row, CliTableTheme};

pub(crate) fn run_begin(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    owner: Option<&str>,
    message: &str,
) -> CmdResult {
    let owner = owner.map(str::to_string).unwrap_or_else(default_owner);
    let opts = upgrade_options(cfg, &owner, message)?;
    let repo = open_repo(cfg, shutdown)?;

    println!(
        "Upgrading {} as {owner}; writers drain for {}.",
        cfg.repository.url,
        format_duration(opts.io_drain_timeout * 2 + opts.max_permitted_clock_drift)
    );
    let mut machine = repo.upgrade(opts);
    match machine.run()? {
        UpgradeState::Committed => println!("Upgrade committed."),
        UpgradeState::Waiting => {
            if let Some(lock) = repo.format().upgrade_lock_intent()? {
                println!(
                    "Upgrade lock set. The upgrade may start at {}; run `strata upgrade begin` again then.",
                    format_time(lock.upgrade_time())
                );
            }
        }
        other => println!("Upgrade stopped in state {other:?}."),
    }
    Ok(())
}

fn upgrade_options(
    cfg: &StrataConfig,
    owner: &str,
    message: &str,
) -> Result<UpgradeOptions, Box<dyn std::error::Error>> {
    let epoch_parameters = cfg.epoch.to_parameters()?;
    Ok(cfg.upgrade.to_options(owner, message, epoch_parameters)?)
}

/// `user@host` of the invoking process.
fn default_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into());
    format!("{user}@{}", hostname())
}

fn hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
    }
}

pub(crate) fn run_status(cfg: &StrataConfig, shutdown: &Arc<AtomicBool>, json: bool) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let format = repo.format().load_fresh()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&format.upgrade_lock)?);
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(
        &mut table,
        theme,
        "Index version",
        format!("v{}", u8::from(format.parameters.index_version)),
    );
    add_kv_row(
        &mut table,
        theme,
        "Required features",
        if format.required_features.is_empty() {
            "-".to_string()
        } else {
            format.required_features.join(", ")
        },
    );
    match &format.upgrade_lock {
        None => add_kv_row(&mut table, theme, "Upgrade lock", "none"),
        Some(lock) => {
            let now = repo.clock().now();
            let (locked, fully) = lock.is_locked(now);
            add_kv_row(&mut table, theme, "Upgrade lock", &lock.owner_id);
            add_kv_row(&mut table, theme, "Created", format_time(lock.creation_time));
            add_kv_row(&mut table, theme, "Upgrade time", format_time(lock.upgrade_time()));
            add_kv_row(
                &mut table,
                theme,
                "Writers",
                match (locked, fully) {
                    (_, true) => "drained",
                    (true, false) => "draining",
                    _ => "allowed",
                },
            );
            if !lock.message.is_empty() {
                add_kv_row(&mut table, theme, "Message", &lock.message);
            }
        }
    }
    println!("{table}");
    Ok(())
}

pub(crate) fn run_rollback(
    cfg: &StrataConfig,
    shutdown: &Arc<AtomicBool>,
    force: bool,
) -> CmdResult {
    let repo = open_repo(cfg, shutdown)?;
    let lock = repo.format().upgrade_lock_intent()?;
    let owner = lock.as_ref().map(|l| l.owner_id.as_str()).unwrap_or("unknown");
    let opts = upgrade_options(cfg, owner, "")?;
    repo.upgrade(opts).force_rollback(force)?;
    println!("Upgrade rolled back.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use strata_core::config::parse_config;

    #[test]
    fn default_owner_names_user_and_host() {
        let owner = default_owner();
        let (user, host) = owner.split_once('@').unwrap();
        assert!(!user.is_empty());
        assert!(!host.is_empty());
    }

    #[test]
    fn options_combine_upgrade_and_epoch_sections() {
        let cfg = parse_config(
            "repository:\n  url: memory://\nupgrade:\n  io_drain_timeout: 2m\nepoch:\n  advance_on_count: 7\n",
        )
        .unwrap();
        let opts = upgrade_options(&cfg, "ops@db1", "night").unwrap();
        assert_eq!(opts.owner_id, "ops@db1");
        assert_eq!(opts.io_drain_timeout, Duration::from_secs(120));
        assert_eq!(opts.epoch_parameters.epoch_advance_on_count_threshold, 7);
    }
}
