//! MCP tool surface over [`RemoteExecutor`].
//!
//! - `ssh_execute`: run a command on a pooled connection, elevating on
//!   permission errors
//! - `ssh_circuit_status` / `ssh_reset_circuit`: inspect or override a host's
//!   circuit breaker
//! - `ssh_disconnect` / `ssh_disconnect_all`: close pooled connections
//! - `ssh_clear_elevation_cache`: retry elevation methods that failed before
//! - `ssh_list_connections` / `ssh_pool_stats`: pool inspection

use std::sync::Arc;

use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::info;

use super::circuit::CircuitStatus;
use super::config::resolve_command_timeout;
use super::execution::ExecuteOptions;
use super::executor::RemoteExecutor;
use super::pool::PoolStats;
use super::types::{
    ConnectionListResponse, HostTarget, JumpHostConfig, SshClearElevationCacheResponse,
    SshDisconnectResponse, SshExecuteResponse, SshResetCircuitResponse, validate_port,
};

/// MCP tools backed by one shared [`RemoteExecutor`].
#[derive(Clone)]
pub struct RemoteExecCommands {
    executor: Arc<RemoteExecutor>,
}

impl RemoteExecCommands {
    pub fn new(executor: Arc<RemoteExecutor>) -> Self {
        Self { executor }
    }
}

/// Build the target of `ssh_execute` from tool arguments.
fn build_target(
    host: String,
    port: Option<u32>,
    username: Option<String>,
    key_path: Option<String>,
    jump_host: Option<String>,
) -> Result<HostTarget, String> {
    let mut target = HostTarget::new(host);
    if let Some(port) = port {
        target = target.with_port(validate_port(port).map_err(|e| e.to_string())?);
    }
    if let Some(username) = username.filter(|u| !u.is_empty()) {
        target = target.with_username(username);
    }
    if let Some(key_path) = key_path.filter(|k| !k.is_empty()) {
        target = target.with_key_path(key_path);
    }
    if let Some(hop) = jump_host.filter(|j| !j.is_empty()) {
        let jump = JumpHostConfig::parse(&hop, &target.login_user()).map_err(|e| e.to_string())?;
        target = target.with_jump_host(jump);
    }
    Ok(target)
}

#[Tools]
impl RemoteExecCommands {
    /// Execute a command on a remote host over a pooled SSH connection.
    ///
    /// Connections are reused per (user, host, port). Transient connection
    /// failures are retried with exponential backoff. A command refused for
    /// lack of privileges is retried through sudo, doas or su, whichever the
    /// host supports; `elevated_with` reports the method used.
    ///
    /// Fails fast with a circuit-open error when the host failed repeatedly;
    /// use `ssh_circuit_status` to see the remaining cool-down.
    #[allow(clippy::too_many_arguments)]
    async fn ssh_execute(
        &self,
        /// Target hostname or IP address
        host: String,
        /// Shell command to execute
        command: String,
        /// SSH port (default: 22)
        port: Option<u32>,
        /// Login user (default: the local user)
        username: Option<String>,
        /// Path to a private key (default: agent, then ~/.ssh/id_ed25519, ~/.ssh/id_rsa, ...)
        key_path: Option<String>,
        /// Jump host as "[user@]host[:port]", one hop only
        jump_host: Option<String>,
        /// Command timeout in seconds (default: 180, env: SSH_COMMAND_TIMEOUT)
        timeout_secs: Option<u64>,
        /// Retry permission-denied failures with sudo/doas/su (default: true)
        elevate: Option<bool>,
    ) -> Result<StructuredContent<SshExecuteResponse>, String> {
        let target = build_target(host, port, username, key_path, jump_host)?;
        let timeout = resolve_command_timeout(timeout_secs);
        let options = ExecuteOptions {
            timeout: Some(timeout),
            elevate: elevate.unwrap_or(true),
            cancel: None,
        };

        let result = self
            .executor
            .execute(&target, &command, options)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(SshExecuteResponse {
            host: target.host,
            stdout: result.output.stdout,
            stderr: result.output.stderr,
            exit_code: result.output.exit_code,
            elevated_with: result.elevated_with.map(|m| m.to_string()),
        }))
    }

    /// Get the circuit breaker state of a host.
    ///
    /// **States:** `CLOSED` (normal), `OPEN` (failing fast until the cool-down
    /// ends), `HALF_OPEN` (one probe request is allowed through).
    async fn ssh_circuit_status(
        &self,
        /// Hostname as passed to ssh_execute
        host: String,
    ) -> StructuredContent<CircuitStatus> {
        StructuredContent(self.executor.circuit_status(&host))
    }

    /// Close a host's circuit and clear its failure count.
    async fn ssh_reset_circuit(
        &self,
        /// Hostname as passed to ssh_execute
        host: String,
    ) -> StructuredContent<SshResetCircuitResponse> {
        let reset = self.executor.reset_circuit(&host);
        let message = if reset {
            format!("Circuit for {} reset", host)
        } else {
            format!("No circuit recorded for {}", host)
        };
        StructuredContent(SshResetCircuitResponse {
            host,
            reset,
            message,
        })
    }

    /// Close every pooled connection to a host, whatever the port or user.
    async fn ssh_disconnect(
        &self,
        /// Hostname as passed to ssh_execute
        host: String,
    ) -> StructuredContent<SshDisconnectResponse> {
        let closed = self.executor.disconnect(&host).await;
        info!("ssh_disconnect closed {} connection(s) to {}", closed, host);
        StructuredContent(SshDisconnectResponse {
            message: format!("Closed {} connection(s) to {}", closed, host),
            host: Some(host),
            closed,
        })
    }

    /// Close every pooled connection.
    async fn ssh_disconnect_all(&self) -> StructuredContent<SshDisconnectResponse> {
        let closed = self.executor.disconnect_all().await;
        StructuredContent(SshDisconnectResponse {
            host: None,
            closed,
            message: format!("Closed {} connection(s)", closed),
        })
    }

    /// Forget detected elevation methods and failures.
    ///
    /// Methods that failed (wrong password, timeout) are skipped until this
    /// is called. Omit `host` to clear every host.
    async fn ssh_clear_elevation_cache(
        &self,
        /// Hostname to clear (default: all hosts)
        host: Option<String>,
    ) -> StructuredContent<SshClearElevationCacheResponse> {
        let cleared = self.executor.clear_elevation_cache(host.as_deref());
        let message = match &host {
            Some(h) => format!("Cleared elevation cache for {}", h),
            None => "Cleared elevation cache for all hosts".to_string(),
        };
        StructuredContent(SshClearElevationCacheResponse {
            host,
            cleared,
            message,
        })
    }

    /// List pooled connections with their idle time.
    async fn ssh_list_connections(&self) -> StructuredContent<ConnectionListResponse> {
        StructuredContent(self.executor.list_connections().await)
    }

    /// Pool occupancy and lifetime counters.
    async fn ssh_pool_stats(&self) -> StructuredContent<PoolStats> {
        StructuredContent(self.executor.stats().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod target_building {
        use super::*;

        #[test]
        fn test_defaults() {
            let target = build_target("db-01".into(), None, None, None, None).unwrap();
            assert_eq!(target.port, 22);
            assert!(target.username.is_none());
            assert!(target.jump_host.is_none());
        }

        #[test]
        fn test_all_arguments() {
            let target = build_target(
                "db-01".into(),
                Some(2222),
                Some("deploy".into()),
                Some("/keys/id_ed25519".into()),
                Some("ops@bastion:22".into()),
            )
            .unwrap();
            assert_eq!(target.port, 2222);
            assert_eq!(target.username.as_deref(), Some("deploy"));
            assert_eq!(target.jump_host.unwrap().username, "ops");
        }

        #[test]
        fn test_jump_user_defaults_to_login_user() {
            let target = build_target(
                "db-01".into(),
                None,
                Some("deploy".into()),
                None,
                Some("bastion".into()),
            )
            .unwrap();
            assert_eq!(target.jump_host.unwrap().username, "deploy");
        }

        #[test]
        fn test_out_of_range_port() {
            let err = build_target("db-01".into(), Some(70000), None, None, None).unwrap_err();
            assert!(err.contains("out of range"));
        }

        #[test]
        fn test_empty_strings_are_ignored() {
            let target =
                build_target("db-01".into(), None, Some(String::new()), Some(String::new()), Some(String::new()))
                    .unwrap();
            assert!(target.username.is_none());
            assert!(target.key_path.is_none());
            assert!(target.jump_host.is_none());
        }
    }
}
