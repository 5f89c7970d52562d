use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::PrivateKey;

/// SSH user-auth methods in the order the client should try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    Agent,
    PublicKey,
    Password,
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Agent => "agent",
            AuthMethod::PublicKey => "publickey",
            AuthMethod::Password => "password",
            AuthMethod::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded private key. Lives only for the duration of one connect call.
#[derive(Clone)]
pub struct LoadedKey {
    pub path: PathBuf,
    pub key: Arc<PrivateKey>,
}

impl LoadedKey {
    pub fn new(path: impl Into<PathBuf>, key: PrivateKey) -> Self {
        Self {
            path: path.into(),
            key: Arc::new(key),
        }
    }

    pub fn algorithm(&self) -> String {
        self.key.algorithm().to_string()
    }

    pub fn comment(&self) -> String {
        self.key.comment().to_string()
    }
}

impl fmt::Debug for LoadedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKey")
            .field("path", &self.path)
            .field("algorithm", &self.algorithm())
            .field("comment", &self.comment())
            .finish()
    }
}

/// Credentials resolved for one connection attempt.
#[derive(Clone, Default)]
pub struct AuthOptions {
    pub preferred_auth_order: Vec<AuthMethod>,
    pub client_keys: Vec<LoadedKey>,
    pub agent_socket_path: Option<PathBuf>,
    /// Explicit password auth only. Never logged.
    pub password: Option<String>,
}

impl AuthOptions {
    pub fn agent(socket: PathBuf) -> Self {
        Self {
            preferred_auth_order: vec![AuthMethod::Agent, AuthMethod::KeyboardInteractive],
            agent_socket_path: Some(socket),
            ..Default::default()
        }
    }

    pub fn key(key: LoadedKey) -> Self {
        Self {
            preferred_auth_order: vec![AuthMethod::PublicKey, AuthMethod::KeyboardInteractive],
            client_keys: vec![key],
            ..Default::default()
        }
    }

    pub fn password(password: String) -> Self {
        Self {
            preferred_auth_order: vec![AuthMethod::Password, AuthMethod::KeyboardInteractive],
            password: Some(password),
            ..Default::default()
        }
    }

    pub fn keyboard_interactive() -> Self {
        Self {
            preferred_auth_order: vec![AuthMethod::KeyboardInteractive],
            ..Default::default()
        }
    }

    pub fn primary_method(&self) -> Option<AuthMethod> {
        self.preferred_auth_order.first().copied()
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("preferred_auth_order", &self.preferred_auth_order)
            .field("client_keys", &self.client_keys)
            .field("agent_socket_path", &self.agent_socket_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
