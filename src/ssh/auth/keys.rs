//! Private key loading with passphrase recovery.
//!
//! A key is first decoded without a passphrase. If it turns out to be
//! encrypted, cached passphrases are tried (by key path, then by host), then
//! the user is prompted once. A passphrase that worked is written back to the
//! secret store under both names.

use std::path::Path;

use russh::keys;
use tracing::{debug, info};

use crate::ssh::error::{Result, SshCoreError};
use crate::ssh::secrets::{self, SecretStore};

use super::options::LoadedKey;
use super::prompt::PromptProvider;

pub struct KeyLoader<'a> {
    prompt: &'a dyn PromptProvider,
    secrets: &'a dyn SecretStore,
}

fn is_encrypted_error(err: &keys::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("encrypted") || msg.contains("passphrase")
}

fn key_error(path: &Path, reason: impl Into<String>) -> SshCoreError {
    SshCoreError::Key {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

impl<'a> KeyLoader<'a> {
    pub fn new(prompt: &'a dyn PromptProvider, secrets: &'a dyn SecretStore) -> Self {
        Self { prompt, secrets }
    }

    /// Load `path` for a connection to `host`.
    ///
    /// Prompts at most once per call.
    pub async fn load(&self, path: &Path, host: &str) -> Result<LoadedKey> {
        if !path.exists() {
            return Err(key_error(path, "key file not found"));
        }

        match keys::load_secret_key(path, None) {
            Ok(key) => return Ok(self.loaded(path, key)),
            Err(e) if !is_encrypted_error(&e) => {
                return Err(key_error(path, format!("failed to load private key: {}", e)));
            }
            Err(_) => debug!("Key {} is passphrase protected", path.display()),
        }

        let path_str = path.display().to_string();
        let by_key = secrets::passphrase_by_key(&path_str);
        let by_host = secrets::passphrase_by_host(host);

        for name in [&by_key, &by_host] {
            if let Some(passphrase) = self.secrets.get(name).await {
                if let Ok(key) = keys::load_secret_key(path, Some(&passphrase)) {
                    debug!("Decrypted {} with cached passphrase", path.display());
                    self.remember(&by_key, &by_host, &passphrase).await;
                    return Ok(self.loaded(path, key));
                }
                debug!("Cached passphrase for {} no longer valid", path.display());
            }
        }

        let Some(passphrase) = self
            .prompt
            .prompt_secret(&format!("Enter passphrase for key {}", path_str))
            .await
            .filter(|p| !p.is_empty())
        else {
            return Err(key_error(path, "key is encrypted and no passphrase was provided"));
        };

        let key = keys::load_secret_key(path, Some(&passphrase))
            .map_err(|e| key_error(path, format!("incorrect passphrase: {}", e)))?;
        self.remember(&by_key, &by_host, &passphrase).await;
        Ok(self.loaded(path, key))
    }

    async fn remember(&self, by_key: &str, by_host: &str, passphrase: &str) {
        self.secrets.set(by_key, passphrase).await;
        self.secrets.set(by_host, passphrase).await;
    }

    fn loaded(&self, path: &Path, key: keys::PrivateKey) -> LoadedKey {
        let loaded = LoadedKey::new(path, key);
        info!(
            "Loaded {} key ({}) from {}",
            loaded.algorithm(),
            loaded.comment(),
            path.display()
        );
        loaded
    }
}
