//! Core data types and serializable responses.
//!
//! Response types implement `Serialize`, `Deserialize`, and `JsonSchema` so the
//! MCP tool surface can return them directly.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::error::{Result, SshCoreError};

/// Username used in the pool key when none is given.
pub const DEFAULT_USER_KEY: &str = "default";

/// Identity of a pooled connection: `(username|"default", host, port)`.
///
/// One key per logical endpoint, independent of any jump host in front of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionKey {
    pub username: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionKey {
    pub fn new(username: Option<&str>, host: impl Into<String>, port: u16) -> Self {
        Self {
            username: username
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_USER_KEY)
                .to_string(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Jump host in front of a target. One hop only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JumpHostConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl JumpHostConfig {
    /// Parse `[user@]host[:port]`. `default_user` fills a missing user.
    pub fn parse(value: &str, default_user: &str) -> Result<Self> {
        let value = value.trim();
        let (username, rest) = match value.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
            Some(_) => return Err(SshCoreError::invalid_input("jump host user cannot be empty")),
            None => (default_user.to_string(), value),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u32>().map_err(|_| {
                    SshCoreError::invalid_input(format!("invalid jump host port '{}'", port))
                })?;
                (host, validate_port(port)?)
            }
            None => (rest, default_port()),
        };
        if host.is_empty() {
            return Err(SshCoreError::invalid_input("jump host cannot be empty"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            username,
            key_path: None,
        })
    }
}

/// A host inventory entry: where to connect and with which hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub key_path: Option<PathBuf>,
    pub jump_host: Option<JumpHostConfig>,
}

impl HostTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            key_path: None,
            jump_host: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_jump_host(mut self, jump: JumpHostConfig) -> Self {
        self.jump_host = Some(jump);
        self
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.username.as_deref(), self.host.clone(), self.port)
    }

    /// Login name: explicit username, else the local user.
    pub fn login_user(&self) -> String {
        self.username
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Reject empty hosts and port 0 before any network activity.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(SshCoreError::invalid_input("host cannot be empty"));
        }
        validate_port(u32::from(self.port))?;
        if let Some(jump) = &self.jump_host {
            if jump.host.trim().is_empty() {
                return Err(SshCoreError::invalid_input("jump host cannot be empty"));
            }
            validate_port(u32::from(jump.port))?;
        }
        Ok(())
    }
}

/// Ports must lie in `[1, 65535]`.
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(SshCoreError::invalid_input(format!(
            "port {} out of range 1-65535",
            port
        ))),
    }
}

/// One command to run on an established connection.
#[derive(Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout: Duration,
    /// Written to the command's stdin, then EOF. Never logged.
    pub stdin: Option<String>,
    /// Allocate a PTY (needed by `su` and password `doas`).
    pub pty: bool,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            stdin: None,
            pty: false,
        }
    }
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRequest")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("pty", &self.pty)
            .finish()
    }
}

/// Output of a completed command. A non-zero exit is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the remote side did not report an exit status.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Response of `ssh_execute`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshExecuteResponse {
    pub host: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Elevation method used, when the command needed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevated_with: Option<String>,
}

/// Summary of one pooled connection.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionInfo {
    pub id: String,
    pub key: ConnectionKey,
    /// RFC3339 timestamp of connection establishment
    pub connected_at: String,
    pub idle_secs: u64,
    pub via_jump_host: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionInfo>,
    pub count: usize,
}

/// Response of `ssh_reset_circuit`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshResetCircuitResponse {
    pub host: String,
    /// False when the host had no breaker yet
    pub reset: bool,
    pub message: String,
}

/// Response of `ssh_disconnect` and `ssh_disconnect_all`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshDisconnectResponse {
    /// `None` for disconnect-all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub closed: usize,
    pub message: String,
}

/// Response of `ssh_clear_elevation_cache`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SshClearElevationCacheResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Connection keys whose cached capabilities were dropped
    pub cleared: usize,
    pub message: String,
}
