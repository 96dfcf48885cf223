//! Model Context Protocol (MCP) server handling and JSON-RPC implementations
//!
//! Provides JSON-RPC decoding and validation, protocol negotiation, and the
//! routing of namespaced calls to child servers.

pub mod method;
pub mod router;
pub mod rpc;
pub mod server;
