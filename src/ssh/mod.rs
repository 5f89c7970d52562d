//! Pooled SSH execution core.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Connection keys, host targets, command I/O and tool responses
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error taxonomy and the single transient/permanent classification
//! - `circuit`: Per-host circuit breakers
//! - `auth`: Credential resolution, key loading, keyboard-interactive auth
//! - `secrets`: Passphrase and password stores
//! - `transport` / `client` / `jump`: the SSH connection seam, its russh
//!   implementation and jump-host tunnel cleanup
//! - `pool`: Keyed connection pool with LRU eviction
//! - `execution`: Retry, breaker feedback and elevation hand-off
//! - `elevation`: sudo/doas/su fallback chain
//! - `executor`: Composition root
//! - `commands`: MCP tool implementations

pub mod auth;
pub mod circuit;
pub mod client;
pub mod commands;
pub mod config;
pub mod elevation;
pub mod error;
pub mod execution;
pub mod executor;
pub(crate) mod jump;
pub mod pool;
pub mod secrets;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use commands::RemoteExecCommands;
pub use error::{Result, SshCoreError};
pub use executor::RemoteExecutor;
