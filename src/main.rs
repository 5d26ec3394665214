//! Entry point for the mcp-shell MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), builds the server from environment settings, and serves on
//! stdin/stdout. SIGINT/SIGTERM trigger a graceful shutdown: all owned
//! children get TERM and every PTY session is closed before exit.

use anyhow::Result;
use mcp_shell::config::Settings;
use mcp_shell::server::McpShellServer;
use rmcp::{ServiceExt, transport::stdio};
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing::info!("Starting mcp-shell MCP server v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env();
    let server = McpShellServer::new(settings).await?;
    let supervisor = server.supervisor();
    let terminals = server.terminals();

    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, shutting down");
        }
    }

    supervisor.shutdown().await;
    terminals.close_all().await;
    tracing::info!("mcp-shell server shut down");
    Ok(())
}
