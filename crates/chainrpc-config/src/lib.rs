//! # chainrpc configuration
//!
//! Typed configuration for the JSON-RPC engine: where to connect, how to
//! reconnect, and request defaults.
//!
//! ```rust,no_run
//! use chainrpc_config::ConfigLoader;
//!
//! # async fn example() -> Result<(), chainrpc_config::ConfigError> {
//! let config = ConfigLoader::load(Some("chainrpc.toml".as_ref())).await?;
//! let endpoint = config.endpoint()?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

mod config;
mod endpoint;
mod loader;

pub use config::*;
pub use endpoint::{default_socket_path, Endpoint};
pub use loader::*;
