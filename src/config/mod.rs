//! Configuration loading from TOML files and environment variables.
//!
//! Precedence (highest wins):
//! 1. Environment variables (`TABMUX_LISTEN`, `TABMUX_TMUX`, `TABMUX_STORE`)
//! 2. TOML file given with `--config`
//! 3. `./tabmux.toml`
//! 4. `$XDG_CONFIG_HOME/tabmux/tabmux.toml` (or `~/.config/tabmux/tabmux.toml`)
//! 5. Built-in defaults

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

mod defaults;
mod env;
mod init;
mod sources;
mod types;

pub use init::{config_root_dir, default_global_config_path, initialize_default_global_config};
pub use types::{
    Config, GatewayConfig, GlobalConfigInitResult, LoadedConfig, MultiplexerConfig, WindowSection,
};

use env::apply_env_overrides;
use sources::read_config_text_with_sources;

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from `--config`).
pub fn load_config(path_override: Option<&str>) -> Result<LoadedConfig, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

fn load_config_from_sources<FRead, FEnv, FRoot>(
    path_override: Option<&str>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
) -> Result<LoadedConfig, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
{
    let (config_text, source) = read_config_text_with_sources(path_override, &read_file, &config_root)?;
    let mut config: Config = toml::from_str(&config_text)?;
    apply_env_overrides(&mut config, &env_lookup)?;
    validate(&config)?;
    Ok(LoadedConfig { config, source })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.window.ack_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "window.ack_timeout_secs must be at least 1".to_string(),
        ));
    }
    if config.multiplexer.program.trim().is_empty() {
        return Err(ConfigError::Invalid("multiplexer.program is empty".to_string()));
    }
    let prefix = &config.multiplexer.session_prefix;
    if prefix.is_empty() || prefix.contains([':', '.']) || prefix.chars().any(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!(
            "multiplexer.session_prefix `{prefix}` must be non-empty without ':', '.' or whitespace"
        )));
    }
    Ok(())
}
