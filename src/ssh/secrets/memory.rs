use async_trait::async_trait;
use dashmap::DashMap;

use super::traits::SecretStore;

/// Process-lifetime secret cache backed by `DashMap`.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: DashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl std::fmt::Debug for MemorySecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySecretStore")
            .field("entries", &self.secrets.len())
            .finish()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Option<String> {
        self.secrets.get(name).map(|v| v.value().clone())
    }

    async fn set(&self, name: &str, value: &str) {
        self.secrets.insert(name.to_string(), value.to_string());
    }

    async fn delete(&self, name: &str) {
        self.secrets.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemorySecretStore::new();
        assert!(store.get("a").await.is_none());

        store.set("a", "1").await;
        assert_eq!(store.get("a").await.as_deref(), Some("1"));

        store.set("a", "2").await;
        assert_eq!(store.get("a").await.as_deref(), Some("2"));
        assert_eq!(store.len(), 1);

        store.delete("a").await;
        assert!(store.is_empty());
    }

    #[test]
    fn test_debug_hides_values() {
        let store = MemorySecretStore::new();
        store.secrets.insert("k".into(), "hunter2".into());
        let dbg = format!("{:?}", store);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("entries: 1"));
    }
}
