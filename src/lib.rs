//! MCP Explorer
//!
//! A tool-orchestration engine: a language model answers user queries and
//! may call tools exposed by independently running Model Context Protocol
//! servers, reached over subprocess pipes or HTTP event streams.
//!
//! # Architecture
//!
//! - **Transports**: one live JSON-RPC channel per tool server, with
//!   concurrent in-flight calls correlated by request id
//! - **Server Registry**: named servers that can be added, removed and renamed
//!   at runtime; reads are served from immutable snapshots
//! - **Conversation**: structured, append-only message history per session
//! - **Query Processor**: the model/tool turn loop
//!
//! # Modules
//!
//! - [`config`]: layered application settings
//! - [`explorer`]: the engine facade used by front ends
//! - [`llm`]: language-model collaborator and the turn loop
//! - [`mcp`]: transports, wire types and the server registry
//! - [`session`]: conversation history

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]

pub mod config;
pub mod explorer;
pub mod llm;
pub mod mcp;
pub mod session;

#[cfg(test)]
mod testing;

pub use explorer::Explorer;
