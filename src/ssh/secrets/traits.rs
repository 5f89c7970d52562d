use async_trait::async_trait;

/// External secret store.
///
/// Implementations must tolerate being absent or read-only: `set` failures are
/// logged by the implementation and never surface to the caller, so callers
/// degrade to in-memory caching.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Option<String>;

    async fn set(&self, name: &str, value: &str);

    /// Remove a secret. Stores that cannot delete may ignore this.
    async fn delete(&self, _name: &str) {}
}
