//! tabmux: persistent terminal tabs shared by several UI windows.
//!
//! Each tab is backed by a long-running tmux session. Windows keep their own
//! copy of the session table and replicate it to each other by broadcasting
//! full snapshots; a backend gateway owns the tmux attachments and decides
//! which window currently drives each one.
//!
//! The main pieces:
//!
//! - [`store`]: the session table and its invariants (ownership, split
//!   families, set-once multiplexer names).
//! - [`replicator`]: persists and broadcasts every committed change and
//!   applies snapshots from sibling windows.
//! - [`orchestrator`]: spawn, reattach, detach and close against the gateway,
//!   with correlation-id matching and stale-ack rejection.
//! - [`gateway`]: the backend registry and TCP connection gateway.
//! - [`window`]: one window's event loop tying the above together.
//!
//! # Quick start
//!
//! ```no_run
//! use tabmux::client::GatewayClient;
//! use tabmux::orchestrator::SpawnOptions;
//! use tabmux::replicator::LocalBus;
//! use tabmux::window::{spawn_window, WindowConfig};
//!
//! # async fn example() -> Result<(), tabmux::error::SessionError> {
//! let bus = LocalBus::new(64);
//! let client = GatewayClient::connect("127.0.0.1:7681").await?;
//! let (window, _events, _task) =
//!     spawn_window(WindowConfig::new("main"), client, Box::new(bus.clone()), bus.subscribe())?;
//! let tab = window.spawn(SpawnOptions::new("bash")).await?;
//! window.detach(&tab).await?;
//! # Ok(())
//! # }
//! ```

pub mod build_info;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod normalizer;
pub mod orchestrator;
pub mod protocol;
pub mod replicator;
pub mod store;
#[cfg(test)]
pub mod testsupport;
pub mod tmux;
pub mod window;
