#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use poem_mcpserver::McpServer;
use remote_exec::ssh::config::IDLE_SWEEP_INTERVAL;
use remote_exec::ssh::{RemoteExecCommands, RemoteExecutor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // stdout carries JSON-RPC, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let executor = Arc::new(RemoteExecutor::from_env());
    let sweeper = executor.spawn_idle_sweeper(IDLE_SWEEP_INTERVAL);

    let served =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(RemoteExecCommands::new(executor.clone())))
            .await;

    sweeper.abort();
    executor.shutdown().await;
    served?;
    Ok(())
}
