#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use remote_exec::ssh::config::IDLE_SWEEP_INTERVAL;
use remote_exec::ssh::{RemoteExecCommands, RemoteExecutor};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let executor = Arc::new(RemoteExecutor::from_env());
    let sweeper = executor.spawn_idle_sweeper(IDLE_SWEEP_INTERVAL);

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools = RemoteExecCommands::new(executor.clone());
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| McpServer::new().tools(tools.clone())),
        )
        .with(Tracing);

    info!("Use ssh_execute to run commands; connections are pooled per user@host:port");

    let served = Server::new(TcpListener::bind(mcp_addr))
        .name("remote-exec")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
            None,
        )
        .await;

    sweeper.abort();
    executor.shutdown().await;
    served?;
    Ok(())
}
