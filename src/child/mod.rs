//! Child MCP servers and the framed message stream they speak
//!
//! The registry and router only see [`ChildHandle`] and [`ChildEvent`]; the
//! subprocess details live in [`process`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ServerDescriptor;

#[cfg(test)]
pub(crate) mod fake;
pub mod process;

pub use process::ProcessLauncher;

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("child input stream is closed")]
    WriteError,
    #[error("child did not answer `initialize` within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("child rejected `initialize`: {0}")]
    HandshakeRejected(String),
    #[error("child exited before completing `initialize`")]
    ExitedDuringHandshake,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Everything a child produces, in the order it produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEvent {
    Message(Value),
    /// Always the last event of a child.
    Exited(ExitInfo),
}

/// Write side of a running child.
#[async_trait]
pub trait ChildHandle: Send + Sync {
    /// Writes one JSON-RPC message as a single line.
    async fn send(&self, message: &Value) -> Result<(), ChildError>;

    /// Asks the child to terminate, escalating after `grace`.
    async fn stop(&self, grace: Duration);

    fn pid(&self) -> Option<u32> {
        None
    }
}

pub struct ChildLink {
    pub handle: Arc<dyn ChildHandle>,
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

#[async_trait]
pub trait ChildLauncher: Send + Sync {
    /// Starts the child without waiting for protocol readiness.
    async fn start(&self, descriptor: &ServerDescriptor) -> Result<ChildLink, ChildError>;
}
