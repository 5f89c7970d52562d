//! Secret storage for key passphrases and elevation passwords.
//!
//! - [`MemorySecretStore`]: process-lifetime cache, always available
//! - [`KeyringSecretStore`]: OS keychain (feature `keyring`)

mod memory;
#[cfg(feature = "keyring")]
mod os_keyring;
mod traits;

#[cfg(feature = "keyring")]
pub use os_keyring::KeyringSecretStore;
pub use memory::MemorySecretStore;
pub use traits::SecretStore;

use std::sync::Arc;

/// The store used by the binaries: the OS keychain when built with
/// `keyring`, process memory otherwise.
pub fn default_store() -> Arc<dyn SecretStore> {
    #[cfg(feature = "keyring")]
    {
        Arc::new(KeyringSecretStore::default())
    }
    #[cfg(not(feature = "keyring"))]
    {
        Arc::new(MemorySecretStore::new())
    }
}

/// Cache name for a key passphrase, by key file.
pub fn passphrase_by_key(path: &str) -> String {
    format!("ssh-passphrase:key:{}", path)
}

/// Cache name for a key passphrase, by host.
pub fn passphrase_by_host(host: &str) -> String {
    format!("ssh-passphrase:host:{}", host)
}

/// Cache name for an elevation password.
///
/// `namespace` separates the user's own password (sudo/doas) from the root
/// password (su).
pub fn elevation_password(namespace: &str, user: &str, host: &str, port: u16) -> String {
    format!("ssh-elevation:{}:{}@{}:{}", namespace, user, host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_names_differ_by_scope() {
        assert_eq!(passphrase_by_key("/k"), "ssh-passphrase:key:/k");
        assert_eq!(passphrase_by_host("db-01"), "ssh-passphrase:host:db-01");
    }

    #[test]
    fn test_elevation_namespaces_do_not_collide() {
        let user = elevation_password("user", "deploy", "db-01", 22);
        let root = elevation_password("root", "deploy", "db-01", 22);
        assert_ne!(user, root);
        assert_eq!(user, "ssh-elevation:user:deploy@db-01:22");
    }
}
