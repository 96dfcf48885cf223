//! Scripted in-process MCP servers for tests

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{ChildError, ChildEvent, ChildHandle, ChildLauncher, ChildLink, ExitInfo};
use crate::config::ServerDescriptor;

/// What a fake server advertises and how it behaves.
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub prompts: Vec<Value>,
    pub answer_initialize: bool,
    /// Splits list results into pages of this size when set.
    pub page_size: Option<usize>,
}

impl FakeServer {
    /// `echo`, `slow`, `link` tools, one `notes/today` resource and one `greet` prompt.
    pub fn echo() -> Self {
        Self {
            tools: vec![
                json!({"name": "echo", "description": "Echo text", "inputSchema": {"type": "object"}}),
                json!({"name": "slow", "inputSchema": {"type": "object"}}),
                json!({"name": "link", "inputSchema": {"type": "object"}}),
            ],
            resources: vec![json!({"uri": "resource://notes/today", "name": "today", "mimeType": "text/plain"})],
            prompts: vec![json!({"name": "greet", "arguments": [{"name": "who"}]})],
            answer_initialize: true,
            page_size: None,
        }
    }

    pub fn silent() -> Self {
        Self {
            answer_initialize: false,
            ..Self::echo()
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeLauncher {
    servers: Mutex<HashMap<String, FakeServer>>,
    controls: Mutex<HashMap<String, FakeControl>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the behaviour for a launch command. Unknown commands fail to spawn.
    pub fn with_server(self, command: &str, server: FakeServer) -> Self {
        self.servers
            .lock()
            .expect("servers lock")
            .insert(command.to_string(), server);
        self
    }

    pub fn control(&self, command: &str) -> FakeControl {
        self.controls
            .lock()
            .expect("controls lock")
            .get(command)
            .cloned()
            .expect("fake child was started")
    }
}

#[async_trait]
impl ChildLauncher for FakeLauncher {
    async fn start(&self, descriptor: &ServerDescriptor) -> Result<ChildLink, ChildError> {
        let server = self
            .servers
            .lock()
            .expect("servers lock")
            .get(&descriptor.command)
            .cloned()
            .ok_or_else(|| ChildError::Spawn {
                command: descriptor.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such fake"),
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(FakeState {
            server: Mutex::new(server),
            events: events_tx,
            exited: Mutex::new(false),
            received: Mutex::new(Vec::new()),
            held: Mutex::new(None),
        });

        self.controls
            .lock()
            .expect("controls lock")
            .insert(descriptor.command.clone(), FakeControl(state.clone()));

        Ok(ChildLink {
            handle: Arc::new(FakeChild(state)),
            events: events_rx,
        })
    }
}

struct FakeState {
    server: Mutex<FakeServer>,
    events: mpsc::UnboundedSender<ChildEvent>,
    exited: Mutex<bool>,
    received: Mutex<Vec<Value>>,
    /// `tools/list` replies parked until released, when holding.
    held: Mutex<Option<Vec<Value>>>,
}

impl FakeState {
    fn emit(&self, message: Value) {
        let _ = self.events.send(ChildEvent::Message(message));
    }

    fn exit(&self, code: i32) {
        let mut exited = self.exited.lock().expect("exited lock");
        if !*exited {
            *exited = true;
            let _ = self.events.send(ChildEvent::Exited(ExitInfo {
                code: Some(code),
                signal: None,
            }));
        }
    }

    fn handle(&self, message: &Value) {
        let (Some(id), Some(method)) = (message.get("id").cloned(), message["method"].as_str())
        else {
            return;
        };
        let params = &message["params"];
        let server = self.server.lock().expect("server lock").clone();

        let result = match method {
            "initialize" if server.answer_initialize => {
                let mut capabilities = serde_json::Map::new();
                if !server.tools.is_empty() {
                    capabilities.insert("tools".into(), json!({"listChanged": true}));
                }
                if !server.resources.is_empty() {
                    capabilities.insert("resources".into(), json!({}));
                }
                if !server.prompts.is_empty() {
                    capabilities.insert("prompts".into(), json!({}));
                }
                json!({
                    "protocolVersion": "2025-03-26",
                    "capabilities": capabilities,
                    "serverInfo": {"name": "fake", "version": "0.0.0"}
                })
            }
            "initialize" => return,
            "tools/list" => page("tools", &server.tools, server.page_size, params),
            "resources/list" => page("resources", &server.resources, server.page_size, params),
            "prompts/list" => page("prompts", &server.prompts, server.page_size, params),
            "tools/call" => match params["name"].as_str() {
                Some("echo") => json!({
                    "content": [{"type": "text", "text": params["arguments"]["text"]}],
                    "arguments": params["arguments"]
                }),
                Some("link") => json!({
                    "content": [
                        {"type": "resource_link", "uri": "resource://notes/today", "name": "today"},
                        {"type": "resource", "resource": {"uri": "file:///tmp/x", "text": "x"}}
                    ]
                }),
                Some("structured") => json!({
                    "content": [{"type": "text", "text": "{}"}],
                    "structuredContent": {
                        "type": "resource",
                        "resource": {"uri": "resource://notes/today"},
                        "contents": [{"uri": "resource://notes/today"}]
                    }
                }),
                Some("slow") => return,
                _ => {
                    self.emit(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32602, "message": "Unknown tool"}
                    }));
                    return;
                }
            },
            "resources/read" => json!({
                "contents": [{"uri": params["uri"], "mimeType": "text/plain", "text": "read ok"}]
            }),
            "prompts/get" => json!({
                "messages": [
                    {
                        "role": "user",
                        "content": {"type": "text", "text": format!("hello {}", params["arguments"]["who"].as_str().unwrap_or("?"))}
                    },
                    {
                        "role": "user",
                        "content": {"type": "resource", "resource": {"uri": "resource://notes/today", "text": "notes"}}
                    }
                ]
            }),
            _ => {
                self.emit(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "Method not found"}
                }));
                return;
            }
        };

        let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
        if method == "tools/list" {
            if let Some(held) = self.held.lock().expect("held lock").as_mut() {
                held.push(reply);
                return;
            }
        }
        self.emit(reply);
    }
}

/// Cursors are the decimal offset of the next page.
fn page(key: &str, items: &[Value], page_size: Option<usize>, params: &Value) -> Value {
    let start = params["cursor"]
        .as_str()
        .and_then(|cursor| cursor.parse::<usize>().ok())
        .unwrap_or(0);
    let end = page_size.map_or(items.len(), |size| (start + size).min(items.len()));

    let page = items[start.min(end)..end].to_vec();
    let mut result = json!({ key: page });
    if end < items.len() {
        result["nextCursor"] = Value::String(end.to_string());
    }
    result
}

struct FakeChild(Arc<FakeState>);

#[async_trait]
impl ChildHandle for FakeChild {
    async fn send(&self, message: &Value) -> Result<(), ChildError> {
        if *self.0.exited.lock().expect("exited lock") {
            return Err(ChildError::WriteError);
        }
        self.0
            .received
            .lock()
            .expect("received lock")
            .push(message.clone());
        self.0.handle(message);
        Ok(())
    }

    async fn stop(&self, _grace: Duration) {
        self.0.exit(0);
    }
}

/// Test-side remote control for a started fake child.
#[derive(Clone)]
pub(crate) struct FakeControl(Arc<FakeState>);

impl FakeControl {
    pub fn exit(&self, code: i32) {
        self.0.exit(code);
    }

    pub fn emit(&self, message: Value) {
        self.0.emit(message);
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        self.0.server.lock().expect("server lock").tools = tools;
    }

    /// Parks `tools/list` replies until [`FakeControl::release_held`].
    pub fn hold_tool_lists(&self) {
        *self.0.held.lock().expect("held lock") = Some(Vec::new());
    }

    pub fn held_count(&self) -> usize {
        self.0
            .held
            .lock()
            .expect("held lock")
            .as_ref()
            .map_or(0, Vec::len)
    }

    /// Stops holding and delivers parked replies newest first.
    pub fn release_held(&self) {
        let held = self.0.held.lock().expect("held lock").take().unwrap_or_default();
        for reply in held.into_iter().rev() {
            self.0.emit(reply);
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.0.received.lock().expect("received lock").clone()
    }

    /// Requests (messages with an id) received for `method`.
    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|message| message["method"] == method && message.get("id").is_some())
            .collect()
    }
}
