mod defaults;
mod resolve;
mod types;

pub use self::defaults::parse_human_duration;
pub use self::resolve::{
    default_config_search_paths, load_config, minimal_config_template, parse_config,
    resolve_config_path, ConfigSource, CONFIG_ENV_VAR, PASSPHRASE_ENV_VAR,
};
pub use self::types::*;
