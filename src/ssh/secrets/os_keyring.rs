use async_trait::async_trait;
use tracing::{debug, warn};

use super::traits::SecretStore;

/// OS keychain store (macOS Keychain, Windows Credential Manager, Secret Service).
///
/// Keychain calls block, so each one runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeyringSecretStore {
    fn default() -> Self {
        Self::new("remote-exec")
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn get(&self, name: &str) -> Option<String> {
        let service = self.service.clone();
        let name = name.to_string();
        let result = tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &name).and_then(|entry| entry.get_password())
        })
        .await;

        match result {
            Ok(Ok(secret)) => Some(secret),
            Ok(Err(keyring::Error::NoEntry)) => None,
            Ok(Err(e)) => {
                debug!("Keyring lookup failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Keyring task failed: {}", e);
                None
            }
        }
    }

    async fn set(&self, name: &str, value: &str) {
        let service = self.service.clone();
        let name = name.to_string();
        let value = value.to_string();
        let result = tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &name).and_then(|entry| entry.set_password(&value))
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to store secret in keyring: {}", e),
            Err(e) => warn!("Keyring task failed: {}", e),
        }
    }

    async fn delete(&self, name: &str) {
        let service = self.service.clone();
        let name = name.to_string();
        let result = tokio::task::spawn_blocking(move || {
            keyring::Entry::new(&service, &name).and_then(|entry| entry.delete_credential())
        })
        .await;

        match result {
            Ok(Ok(())) | Ok(Err(keyring::Error::NoEntry)) => {}
            Ok(Err(e)) => warn!("Failed to delete secret from keyring: {}", e),
            Err(e) => warn!("Keyring task failed: {}", e),
        }
    }
}
