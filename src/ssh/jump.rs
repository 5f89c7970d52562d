//! Jump-host tunnel lifetime.
//!
//! A tunnel opened for a connection attempt must not outlive that attempt
//! when it fails. [`connect_through`] closes the tunnel, bounded by
//! [`JUMP_CLOSE_TIMEOUT`], before the error is returned. If the attempt is
//! cancelled instead, the guard's `Drop` hands the same bounded close to the
//! runtime.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tracing::{debug, warn};

use super::client::SshClientHandler;
use super::config::JUMP_CLOSE_TIMEOUT;
use super::error::Result;

/// A connection to a jump host that can carry an inner connection.
#[async_trait]
pub trait JumpTunnel: Send + Sync + 'static {
    async fn close(&self);
}

#[async_trait]
impl JumpTunnel for client::Handle<SshClientHandler> {
    async fn close(&self) {
        if let Err(e) = self
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Error closing jump host connection: {}", e);
        }
    }
}

/// Close `tunnel`, giving up after [`JUMP_CLOSE_TIMEOUT`].
pub async fn close_bounded<T: JumpTunnel + ?Sized>(tunnel: &T) {
    if tokio::time::timeout(JUMP_CLOSE_TIMEOUT, tunnel.close())
        .await
        .is_err()
    {
        warn!(
            "Jump host tunnel did not close within {:?}, abandoning it",
            JUMP_CLOSE_TIMEOUT
        );
    }
}

struct TunnelGuard<T: JumpTunnel> {
    tunnel: Option<Arc<T>>,
}

impl<T: JumpTunnel> TunnelGuard<T> {
    fn disarm(&mut self) {
        self.tunnel = None;
    }

    async fn close(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            close_bounded(tunnel.as_ref()).await;
        }
    }
}

impl<T: JumpTunnel> Drop for TunnelGuard<T> {
    fn drop(&mut self) {
        let Some(tunnel) = self.tunnel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Connection attempt cancelled, closing jump tunnel");
                runtime.spawn(async move { close_bounded(tunnel.as_ref()).await });
            }
            Err(_) => warn!("No runtime available to close jump tunnel"),
        }
    }
}

/// Run `inner` over an established tunnel.
///
/// On error the tunnel is closed before returning. On success the caller
/// keeps ownership of the tunnel through the `Arc` it passed in.
pub async fn connect_through<T, F, Fut, R>(tunnel: Arc<T>, inner: F) -> Result<R>
where
    T: JumpTunnel,
    F: FnOnce(Arc<T>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut guard = TunnelGuard {
        tunnel: Some(tunnel.clone()),
    };
    match inner(tunnel).await {
        Ok(value) => {
            guard.disarm();
            Ok(value)
        }
        Err(e) => {
            debug!("Inner connection through jump host failed: {}", e);
            guard.close().await;
            Err(e)
        }
    }
}
