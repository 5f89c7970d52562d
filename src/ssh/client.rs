//! russh-backed connector and transport.
//!
//! ## Connection Lifecycle
//!
//! 1. **Credential resolution**: [`AuthResolver`] picks agent, key or a
//!    prompted method for the target (and for the jump host, if any).
//!
//! 2. **Client configuration**: keepalive and compression preference. Pooled
//!    connections have no inactivity timeout; the pool's idle sweep closes them.
//!
//! 3. **Transport**: direct TCP, or a `direct-tcpip` channel opened on an
//!    authenticated jump host connection. Both are bounded by the connect
//!    timeout.
//!
//! 4. **Authentication**: [`AuthChain`] tries the resolved methods in order.
//!
//! Library errors are mapped to [`SshCoreError`] here, through
//! [`classify_transport_error`], and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, client, keys};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthOptions, AuthResolver};
use super::error::{Result, SshCoreError, classify_transport_error};
use super::jump::{close_bounded, connect_through};
use super::transport::{Connector, LIVENESS_PROBE_TIMEOUT, Transport};
use super::types::{CommandOutput, ExecRequest, HostTarget};

/// Client handler that accepts all host keys, like
/// `StrictHostKeyChecking=no`.
///
/// Server keys are not checked against `known_hosts`; the host inventory
/// carries no fingerprints to check them with.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

type SshHandle = client::Handle<SshClientHandler>;

/// Build the russh client configuration.
///
/// - No inactivity timeout: the pool decides when idle connections close
/// - Keepalive every 30 seconds, at most 3 unanswered
/// - ZLIB preferred when `compress` is set
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Connects and authenticates with russh.
pub struct SshConnector {
    resolver: Arc<AuthResolver>,
}

impl SshConnector {
    pub fn new(resolver: Arc<AuthResolver>) -> Self {
        Self { resolver }
    }

    async fn authenticate(
        &self,
        mut handle: SshHandle,
        host: &str,
        username: &str,
        options: &AuthOptions,
    ) -> Result<SshHandle> {
        debug!("Authenticating {}@{} with {:?}", username, host, options);
        let chain = AuthChain::from_options(options, self.resolver.prompt());
        if let Err(e) = chain.authenticate(&mut handle, host, username).await {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn connect_direct(
        &self,
        host: &str,
        port: u16,
        username: &str,
        options: &AuthOptions,
        timeout: Duration,
    ) -> Result<SshHandle> {
        let config = build_client_config(self.resolver.compression());
        let connect_future = client::connect(config, (host, port), SshClientHandler);

        let handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| SshCoreError::ConnectionTimeout {
                host: host.to_string(),
                timeout,
            })?
            .map_err(|e| {
                classify_transport_error(host, username, &format!("Failed to connect: {}", e), timeout)
            })?;

        self.authenticate(handle, host, username, options).await
    }

    async fn connect_via(
        &self,
        jump: &SshHandle,
        host: &str,
        port: u16,
        username: &str,
        options: &AuthOptions,
        timeout: Duration,
    ) -> Result<SshHandle> {
        let channel = tokio::time::timeout(
            timeout,
            jump.channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0),
        )
        .await
        .map_err(|_| SshCoreError::ConnectionTimeout {
            host: host.to_string(),
            timeout,
        })?
        .map_err(|e| SshCoreError::Unreachable {
            host: host.to_string(),
            reason: format!("jump host could not open tunnel: {}", e),
        })?;

        let config = build_client_config(self.resolver.compression());
        let connect_future = client::connect_stream(config, channel.into_stream(), SshClientHandler);
        let handle = tokio::time::timeout(timeout, connect_future)
            .await
            .map_err(|_| SshCoreError::ConnectionTimeout {
                host: host.to_string(),
                timeout,
            })?
            .map_err(|e| {
                classify_transport_error(
                    host,
                    username,
                    &format!("Failed to connect through jump host: {}", e),
                    timeout,
                )
            })?;

        self.authenticate(handle, host, username, options).await
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &HostTarget, timeout: Duration) -> Result<Box<dyn Transport>> {
        let username = target.login_user();
        let resolved = self
            .resolver
            .resolve(
                &target.host,
                &username,
                target.key_path.as_deref(),
                target.jump_host.as_ref(),
            )
            .await?;

        let (Some(jump), Some(jump_auth)) = (&target.jump_host, &resolved.jump) else {
            let handle = self
                .connect_direct(&target.host, target.port, &username, &resolved.target, timeout)
                .await?;
            info!("Connected to {}@{}:{}", username, target.host, target.port);
            return Ok(Box::new(SshTransport::new(&target.host, handle, None)));
        };

        let jump_handle = self
            .connect_direct(&jump.host, jump.port, &jump.username, jump_auth, timeout)
            .await?;
        debug!("Jump host {} ready, tunneling to {}", jump.host, target.host);

        let tunnel = Arc::new(jump_handle);
        let (user, target_auth) = (username.as_str(), &resolved.target);
        let handle = connect_through(tunnel.clone(), |tunnel| async move {
            self.connect_via(&tunnel, &target.host, target.port, user, target_auth, timeout)
                .await
        })
        .await?;

        info!(
            "Connected to {}@{}:{} via {}",
            username, target.host, target.port, jump.host
        );
        Ok(Box::new(SshTransport::new(&target.host, handle, Some(tunnel))))
    }
}

/// An authenticated russh connection, optionally riding a jump tunnel.
pub struct SshTransport {
    host: String,
    handle: SshHandle,
    jump: Option<Arc<SshHandle>>,
}

impl SshTransport {
    fn new(host: &str, handle: SshHandle, jump: Option<Arc<SshHandle>>) -> Self {
        Self {
            host: host.to_string(),
            handle,
            jump,
        }
    }

    fn lost(&self, what: &str, e: russh::Error) -> SshCoreError {
        classify_transport_error(
            &self.host,
            "",
            &format!("{}: {}", what, e),
            LIVENESS_PROBE_TIMEOUT,
        )
    }

    /// Open a session channel, run the command and collect its output.
    /// Unbounded; [`Transport::exec`] puts the request timeout around it.
    async fn run_channel(&self, request: &ExecRequest) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.lost("Failed to open channel", e))?;

        if request.pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| self.lost("Failed to request PTY", e))?;
        }

        channel
            .exec(true, request.command.as_str())
            .await
            .map_err(|e| self.lost("Failed to execute command", e))?;

        if let Some(stdin) = &request.stdin {
            channel
                .data(stdin.as_bytes())
                .await
                .map_err(|e| self.lost("Failed to write stdin", e))?;
            if !request.pty {
                channel
                    .eof()
                    .await
                    .map_err(|e| self.lost("Failed to close stdin", e))?;
            }
        }

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                // ext == 1 is stderr in SSH protocol
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    stderr.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) if exit_code.is_some() => break,
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        let _ = channel.close().await;

        if exit_code.is_none() && self.handle.is_closed() {
            return Err(SshCoreError::ConnectionLost {
                host: self.host.clone(),
                reason: "session closed before the command reported an exit status".to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    /// The timeout covers channel open, PTY and stdin as well as the output.
    async fn exec(&self, request: &ExecRequest) -> Result<CommandOutput> {
        match tokio::time::timeout(request.timeout, self.run_channel(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Command on {} timed out after {:?}", self.host, request.timeout);
                Err(SshCoreError::CommandTimeout {
                    host: self.host.clone(),
                    timeout: request.timeout,
                })
            }
        }
    }

    async fn is_alive(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        let probe = ExecRequest::new("true", LIVENESS_PROBE_TIMEOUT);
        matches!(
            tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, self.exec(&probe)).await,
            Ok(Ok(output)) if output.success()
        )
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Error during disconnect from {}: {}", self.host, e);
        }
        if let Some(jump) = &self.jump {
            close_bounded(jump.as_ref()).await;
        }
    }

    fn via_jump_host(&self) -> bool {
        self.jump.is_some()
    }
}
