//! Transport seam between the pool and the SSH library.
//!
//! The pool only sees [`Connector`] and [`Transport`]. The russh-backed
//! implementations live in [`client`](super::client); tests plug in scripted
//! doubles.

use std::time::Duration;

use async_trait::async_trait;

use super::error::Result;
use super::types::{CommandOutput, ExecRequest, HostTarget};

/// Timeout of the liveness probe run on pooled connections.
pub const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// An authenticated connection, exclusively owned by one pool entry.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one command. A non-zero exit is `Ok`; running past
    /// `request.timeout` is `CommandTimeout`.
    async fn exec(&self, request: &ExecRequest) -> Result<CommandOutput>;

    /// Cheap liveness probe.
    async fn is_alive(&self) -> bool;

    /// Close the connection and any tunnel under it.
    async fn close(&self);

    fn via_jump_host(&self) -> bool {
        false
    }
}

/// Something commands can be run on. Implemented by pooled connections;
/// elevation only needs this much.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &ExecRequest) -> Result<CommandOutput>;
}

/// Establishes authenticated transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget, timeout: Duration) -> Result<Box<dyn Transport>>;
}
