//! Compile-time build metadata for `--version` and the gateway startup log.

/// Semver package version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VCS commit hash captured at build time.
pub const GIT_COMMIT: &str = env!("TABMUX_BUILD_GIT_HASH");

/// Build timestamp captured at compile time.
pub const BUILD_TIMESTAMP: &str = env!("TABMUX_BUILD_TIMESTAMP");

/// `tabmux --version` body (clap prefixes the binary name).
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("TABMUX_BUILD_GIT_HASH"),
    "\nbuilt: ",
    env!("TABMUX_BUILD_TIMESTAMP")
);

/// Help trailer that surfaces build metadata in `tabmux --help`.
pub const HELP_BUILD_METADATA: &str = concat!(
    "Build metadata:\n  commit: ",
    env!("TABMUX_BUILD_GIT_HASH"),
    "\n  built: ",
    env!("TABMUX_BUILD_TIMESTAMP")
);

/// One-line metadata logged when the gateway starts.
pub fn startup_metadata_line() -> String {
    format!("v{VERSION} ({GIT_COMMIT}, built {BUILD_TIMESTAMP})")
}
