//! Model Context Protocol (MCP) client implementation.
//!
//! This module connects to subprocess (stdio) and HTTP event-stream (SSE)
//! MCP servers for tool discovery and execution.
//!
//! # Layout
//!
//! - [`types`]: JSON-RPC and MCP wire types
//! - [`transport`]: the [`transport::Transport`] trait and its two implementations
//! - [`registry`]: the process-wide [`registry::ServerRegistry`]
//! - [`config`]: server entries as written in configuration files
//!
//! # Tool names
//!
//! Tools are addressed by their bare name. If two servers advertise the same
//! name, calls go to the server that was registered first.

pub mod config;
pub mod error;
pub mod registry;
pub mod transport;
pub mod types;
