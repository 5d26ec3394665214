//! mcp-shell: a supervised command-execution MCP server.
//!
//! Exposes a structured tool interface over stdio JSON-RPC for an LLM agent
//! to spawn processes under four supervision modes, drive persistent PTY
//! sessions with scrollback and a program guard, pipe captured outputs
//! between executions through an on-disk artifact store, and pass every
//! command through a fail-closed safety pipeline before it runs.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod history;
pub mod output;
pub mod procinfo;
pub mod safety;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod terminal;
