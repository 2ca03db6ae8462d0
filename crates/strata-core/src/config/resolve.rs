use std::fmt;
use std::path::{Path, PathBuf};

use super::types::StrataConfig;
use crate::error::{Result, StrataError};

pub const CONFIG_ENV_VAR: &str = "STRATA_CONFIG";
pub const PASSPHRASE_ENV_VAR: &str = "STRATA_PASSPHRASE";

/// Where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `STRATA_CONFIG` env var.
    EnvVar(PathBuf),
    /// Found by searching standard locations.
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV_VAR})", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({})", path.display(), level)
            }
        }
    }
}

pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    vec![(PathBuf::from("strata.yaml"), "project")]
}

/// Priority: CLI arg > `STRATA_CONFIG` > first existing search path.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

pub fn load_config(path: &Path) -> Result<StrataConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        StrataError::Config(format!("cannot read config file '{}': {e}", path.display()))
    })?;
    parse_config(&raw).map_err(|e| match e {
        StrataError::Config(msg) => {
            StrataError::Config(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Parse and check a YAML config document.
pub fn parse_config(raw: &str) -> Result<StrataConfig> {
    let config: StrataConfig =
        serde_yaml::from_str(raw).map_err(|e| StrataError::Config(e.to_string()))?;
    if config.repository.url.trim().is_empty() {
        return Err(StrataError::Config("repository.url must not be empty".into()));
    }
    config.compression.to_compression()?;
    config.encryption.encryption_mode()?;
    Ok(config)
}

/// A minimal YAML config suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# strata configuration file

repository:
  url: /path/to/repo
  # cache_dir: /var/cache/strata

# encryption:
#   mode: aes256gcm        # or none
#   passphrase: "..."      # or set STRATA_PASSPHRASE

# compression:
#   algorithm: lz4         # none, lz4, zstd
#   zstd_level: 3

# epoch:
#   min_epoch_duration: 24h
#   refresh_frequency: 20m
#   cleanup_safety_margin: 4h

# recovery:
#   parallelism: 4
#   ignore_errors: false

# upgrade:
#   io_drain_timeout: 15m
#   status_poll_interval: 1m
#   max_permitted_clock_drift: 5s
#   advance_notice: 2h
"#
}
