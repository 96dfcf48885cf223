//! HTTP Transport layer for the Model Context Protocol
//!
//! Provides the Streamable HTTP endpoint on `/`, its SSE sessions, and the
//! health endpoint.

pub mod handlers;
pub mod sessions;
