//! Composition root of the connection core.
//!
//! [`RemoteExecutor`] owns the pool, the elevation engine and the execution
//! engine. Applications build one and share it; tests build fresh ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::auth::{AuthResolver, EnvPromptProvider, PromptProvider, SshAgentProbe};
use super::circuit::CircuitStatus;
use super::client::SshConnector;
use super::config::CoreConfig;
use super::elevation::{CapabilitySummary, ElevationEngine};
use super::error::Result;
use super::execution::{ExecuteOptions, ExecutionEngine, ExecutionResult};
use super::pool::{ConnectionPool, PoolStats};
use super::secrets::{self, SecretStore};
use super::transport::Connector;
use super::types::{ConnectionKey, ConnectionListResponse, HostTarget};

pub struct RemoteExecutor {
    pool: Arc<ConnectionPool>,
    elevation: Arc<ElevationEngine>,
    engine: ExecutionEngine,
}

impl RemoteExecutor {
    /// Executor connecting with russh.
    pub fn new(
        config: CoreConfig,
        prompt: Arc<dyn PromptProvider>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let resolver = Arc::new(AuthResolver::new(
            config.auth.clone(),
            prompt.clone(),
            secrets.clone(),
            Arc::new(SshAgentProbe),
        ));
        let connector = Arc::new(SshConnector::new(resolver));
        Self::with_connector(config, connector, prompt, secrets)
    }

    /// Executor configured from the environment, answering prompts from
    /// environment variables.
    pub fn from_env() -> Self {
        Self::new(
            CoreConfig::from_env(),
            Arc::new(EnvPromptProvider),
            secrets::default_store(),
        )
    }

    pub fn with_connector(
        config: CoreConfig,
        connector: Arc<dyn Connector>,
        prompt: Arc<dyn PromptProvider>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.pool, config.circuit, connector));
        let elevation = Arc::new(ElevationEngine::new(config.elevation, prompt, secrets));
        let engine = ExecutionEngine::new(
            pool.clone(),
            elevation.clone(),
            config.retry,
            config.command_timeout,
        );
        Self {
            pool,
            elevation,
            engine,
        }
    }

    pub async fn execute(
        &self,
        target: &HostTarget,
        command: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        self.engine.execute(target, command, options).await
    }

    pub fn circuit_status(&self, host: &str) -> CircuitStatus {
        self.pool.circuits().status(host)
    }

    /// Returns `false` when the host has no breaker yet.
    pub fn reset_circuit(&self, host: &str) -> bool {
        self.pool.circuits().reset(host)
    }

    pub async fn disconnect(&self, host: &str) -> usize {
        self.pool.disconnect(host).await
    }

    pub async fn disconnect_all(&self) -> usize {
        self.pool.disconnect_all().await
    }

    /// Forget elevation capabilities and failed methods for `host`, or for
    /// every host when `None`.
    pub fn clear_elevation_cache(&self, host: Option<&str>) -> usize {
        self.elevation.clear_cache(host)
    }

    pub fn elevation_capabilities(&self, key: &ConnectionKey) -> Option<CapabilitySummary> {
        self.elevation.capabilities(key)
    }

    pub async fn list_connections(&self) -> ConnectionListResponse {
        let connections = self.pool.list().await;
        let count = connections.len();
        ConnectionListResponse { connections, count }
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn cleanup_idle(&self) -> usize {
        self.pool.cleanup_idle().await
    }

    /// Sweep idle connections every `every` until the handle is aborted.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let closed = executor.cleanup_idle().await;
                debug!("Idle sweep closed {} connection(s)", closed);
            }
        })
    }

    /// Close every connection. Called on shutdown.
    pub async fn shutdown(&self) {
        let closed = self.disconnect_all().await;
        info!("Shut down, closed {} connection(s)", closed);
    }
}
