//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use tabmux::build_info::{HELP_BUILD_METADATA, LONG_VERSION};

/// Persistent terminal tabs shared across windows, backed by tmux.
#[derive(Debug, Parser)]
#[command(name = "tabmux", version, long_version = LONG_VERSION, after_help = HELP_BUILD_METADATA)]
pub struct Args {
    /// Path to config file (default: ./tabmux.toml or ~/.config/tabmux/tabmux.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the connection gateway.
    Serve {
        /// Listen address, overriding config and TABMUX_LISTEN.
        #[arg(long = "listen", value_name = "ADDR")]
        listen: Option<String>,
    },
    /// List multiplexer sessions.
    List,
    /// Terminate a multiplexer session. This is destructive.
    Kill {
        /// Multiplexer session name.
        name: String,
    },
    /// Write the default config to ~/.config/tabmux/tabmux.toml.
    Init {
        /// Replace an existing file (a timestamped backup is kept).
        #[arg(long = "force")]
        force: bool,
    },
}
