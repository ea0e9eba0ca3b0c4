//! Environment overrides (`TABMUX_*`), applied after the file is parsed.

use crate::error::ConfigError;

use super::Config;

pub(super) const ENV_LISTEN: &str = "TABMUX_LISTEN";
pub(super) const ENV_TMUX: &str = "TABMUX_TMUX";
pub(super) const ENV_STORE: &str = "TABMUX_STORE";

pub(super) fn apply_env_overrides<FEnv>(config: &mut Config, env_lookup: &FEnv) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(listen) = non_empty(env_lookup, ENV_LISTEN) {
        if !listen.contains(':') {
            return Err(ConfigError::Invalid(format!(
                "invalid {ENV_LISTEN} value `{listen}`: expected host:port"
            )));
        }
        config.gateway.listen = listen;
    }
    if let Some(program) = non_empty(env_lookup, ENV_TMUX) {
        config.multiplexer.program = program;
    }
    if let Some(store) = non_empty(env_lookup, ENV_STORE) {
        config.window.store_path = store;
    }
    Ok(())
}

fn non_empty<FEnv>(env_lookup: &FEnv, name: &str) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    env_lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
