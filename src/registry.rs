//! Child server sessions and their lifecycle
//!
//! The registry owns one [`ChildSession`] per started server, drives the
//! `starting → ready → crashed/stopped` state machine, correlates responses
//! with pending requests and relays child notifications to SSE subscribers.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    catalog::{CapabilityKind, Catalog},
    child::{ChildError, ChildEvent, ChildHandle, ChildLauncher, ChildLink, ExitInfo},
    config::{ServerDescriptor, Timeouts},
    errors::RouteError,
    mcp::rpc::{json_rpc_error, json_rpc_notification, json_rpc_request, json_rpc_result},
    namespace::Namespacing,
};

/// Protocol version offered to children in `initialize`.
pub const CHILD_PROTOCOL_VERSION: &str = "2025-03-26";

const NOTIFICATION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Ready,
    Crashed,
    Stopped,
}

impl SessionState {
    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Ready, Crashed)
                | (Ready, Stopped)
                | (Crashed, Stopped)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A forwarded request awaiting the child's reply.
struct PendingResponse {
    method: String,
    completion: oneshot::Sender<Result<Value, RouteError>>,
}

/// Runtime state of one started child.
pub struct ChildSession {
    descriptor: ServerDescriptor,
    handle: Arc<dyn ChildHandle>,
    state: Mutex<SessionState>,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    next_id: AtomicU64,
    capabilities: Mutex<Value>,
    refresh: tokio::sync::Mutex<()>,
    started_at: DateTime<Utc>,
}

impl ChildSession {
    fn new(descriptor: ServerDescriptor, handle: Arc<dyn ChildHandle>) -> Self {
        Self {
            descriptor,
            handle,
            state: Mutex::new(SessionState::Starting),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capabilities: Mutex::new(json!({})),
            refresh: tokio::sync::Mutex::new(()),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Applies a state transition; returns `false` when it is not allowed.
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.can_become(next) {
            return false;
        }
        debug!(server_id = %self.descriptor.id, from = %*state, to = %next, "session state changed");
        *state = next;
        true
    }

    /// Capabilities the child advertised in its `initialize` result.
    pub fn capabilities(&self) -> Value {
        self.capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_capabilities(&self, capabilities: Value) {
        *self
            .capabilities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = capabilities;
    }

    pub fn pending_count(&self) -> usize {
        self.pending_table().len()
    }

    fn pending_table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingResponse>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends one request and waits for the matching response message.
    ///
    /// The returned value is the child's whole JSON-RPC response, which may
    /// carry either `result` or `error`. Dropping the future discards the
    /// pending entry; a reply arriving afterwards is ignored.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, RouteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion, outcome) = oneshot::channel();
        self.pending_table().insert(
            id,
            PendingResponse {
                method: method.to_string(),
                completion,
            },
        );
        let _guard = PendingGuard { session: self, id };

        // The deadline covers the write too: a child that stops reading
        // stdin must not stall the caller.
        let exchange = async {
            if let Err(err) = self
                .handle
                .send(&json_rpc_request(id, method, params))
                .await
            {
                debug!(server_id = %self.descriptor.id, method, error = %err, "failed to forward request");
                return Err(RouteError::WriteError {
                    server_id: self.descriptor.id.clone(),
                });
            }

            match outcome.await {
                Ok(result) => result,
                Err(_) => Err(RouteError::child_unavailable(&self.descriptor.id)),
            }
        };

        match timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    server_id = %self.descriptor.id,
                    method,
                    timeout_ms = deadline.as_millis(),
                    "child did not respond in time"
                );
                Err(RouteError::UpstreamTimeout {
                    server_id: self.descriptor.id.clone(),
                    timeout: deadline,
                })
            }
        }
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<(), RouteError> {
        self.send_within(&json_rpc_notification(method, params), deadline)
            .await
    }

    async fn send_within(&self, message: &Value, deadline: Duration) -> Result<(), RouteError> {
        match timeout(deadline, self.handle.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RouteError::WriteError {
                server_id: self.descriptor.id.clone(),
            }),
            Err(_) => Err(RouteError::UpstreamTimeout {
                server_id: self.descriptor.id.clone(),
                timeout: deadline,
            }),
        }
    }

    /// Held across a catalog refresh so list replies of overlapping
    /// refreshes cannot land out of order.
    pub(crate) fn refresh_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.refresh
    }

    fn complete(&self, id: u64, response: Value) {
        match self.pending_table().remove(&id) {
            Some(pending) => {
                let _ = pending.completion.send(Ok(response));
            }
            None => debug!(server_id = %self.descriptor.id, id, "dropping late or unknown response"),
        }
    }

    fn fail_pending(&self) {
        let drained: Vec<(u64, PendingResponse)> = self.pending_table().drain().collect();
        for (id, pending) in drained {
            debug!(server_id = %self.descriptor.id, id, method = %pending.method, "failing pending request");
            let _ = pending
                .completion
                .send(Err(RouteError::child_unavailable(&self.descriptor.id)));
        }
    }
}

struct PendingGuard<'a> {
    session: &'a ChildSession,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.pending_table().remove(&self.id);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

pub struct ServerRegistry {
    descriptors: Vec<ServerDescriptor>,
    display_index: HashMap<String, String>,
    sessions: RwLock<HashMap<String, Arc<ChildSession>>>,
    catalog: Catalog,
    launcher: Arc<dyn ChildLauncher>,
    notifications: broadcast::Sender<Value>,
    timeouts: Timeouts,
    namespacing: Namespacing,
}

impl ServerRegistry {
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        namespacing: Namespacing,
        timeouts: Timeouts,
        launcher: Arc<dyn ChildLauncher>,
    ) -> Self {
        let display_index = descriptors
            .iter()
            .map(|descriptor| (descriptor.display_name.clone(), descriptor.id.clone()))
            .collect();
        let catalog = Catalog::new(descriptors.iter().map(|descriptor| descriptor.id.clone()));
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);

        Self {
            descriptors,
            display_index,
            sessions: RwLock::new(HashMap::new()),
            catalog,
            launcher,
            notifications,
            timeouts,
            namespacing,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn namespacing(&self) -> Namespacing {
        self.namespacing
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn descriptors(&self) -> &[ServerDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, server_id: &str) -> Option<&ServerDescriptor> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.id == server_id)
    }

    /// Reverse index from display name to server id.
    pub fn server_for_display_name(&self, display_name: &str) -> Option<&str> {
        self.display_index.get(display_name).map(String::as_str)
    }

    /// Notifications relayed from children, already in external form.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    fn sessions_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ChildSession>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self, server_id: &str) -> Option<Arc<ChildSession>> {
        self.sessions_read().get(server_id).cloned()
    }

    /// Returns the session of a `ready` child.
    pub fn lookup(&self, server_id: &str) -> Result<Arc<ChildSession>, RouteError> {
        if self.descriptor(server_id).is_none() {
            return Err(RouteError::ServerNotFound(server_id.to_string()));
        }

        self.session(server_id)
            .filter(|session| session.is_ready())
            .ok_or_else(|| RouteError::child_unavailable(server_id))
    }

    /// Starts every configured server concurrently and returns how many
    /// reached `ready`. Individual failures are logged, never propagated.
    pub async fn start_all(self: &Arc<Self>) -> usize {
        let outcomes = join_all(
            self.descriptors
                .iter()
                .map(|descriptor| self.register_server(descriptor)),
        )
        .await;

        outcomes
            .into_iter()
            .zip(&self.descriptors)
            .filter(|(outcome, descriptor)| match outcome {
                Ok(()) => true,
                Err(err) => {
                    warn!(server_id = %descriptor.id, error = %err, "child startup failed");
                    false
                }
            })
            .count()
    }

    pub async fn register_server(
        self: &Arc<Self>,
        descriptor: &ServerDescriptor,
    ) -> Result<(), ChildError> {
        let ChildLink { handle, events } = self.launcher.start(descriptor).await?;

        let session = Arc::new(ChildSession::new(descriptor.clone(), handle));
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(descriptor.id.clone(), session.clone());
        tokio::spawn(pump_events(Arc::downgrade(self), session.clone(), events));

        if let Err(err) = self.handshake(&session).await {
            session.transition(SessionState::Crashed);
            session.fail_pending();
            session.handle.stop(self.timeouts.shutdown_grace).await;
            return Err(err);
        }

        if !session.transition(SessionState::Ready) {
            return Err(ChildError::ExitedDuringHandshake);
        }
        info!(server_id = %descriptor.id, name = %descriptor.display_name, "child ready");

        self.catalog
            .refresh(&session, self.namespacing, self.timeouts.call)
            .await;
        Ok(())
    }

    async fn handshake(&self, session: &ChildSession) -> Result<(), ChildError> {
        let params = json!({
            "protocolVersion": CHILD_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let response = session
            .request("initialize", Some(params), self.timeouts.startup)
            .await
            .map_err(|err| match err {
                RouteError::UpstreamTimeout { timeout, .. } => ChildError::HandshakeTimeout(timeout),
                _ => ChildError::ExitedDuringHandshake,
            })?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ChildError::HandshakeRejected(message.to_string()));
        }

        let capabilities = response
            .pointer("/result/capabilities")
            .cloned()
            .unwrap_or_else(|| json!({}));
        session.set_capabilities(capabilities);

        session
            .notify("notifications/initialized", None, self.timeouts.startup)
            .await
            .map_err(|err| match err {
                RouteError::UpstreamTimeout { timeout, .. } => ChildError::HandshakeTimeout(timeout),
                _ => ChildError::ExitedDuringHandshake,
            })
    }

    /// Stops every child and marks it `stopped`.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ChildSession>> = self.sessions_read().values().cloned().collect();
        let grace = self.timeouts.shutdown_grace;

        join_all(sessions.iter().map(|session| async move {
            session.transition(SessionState::Stopped);
            session.handle.stop(grace).await;
            session.fail_pending();
        }))
        .await;

        info!(servers = sessions.len(), "all children stopped");
    }

    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.descriptors
            .iter()
            .map(|descriptor| {
                let session = self.session(&descriptor.id);
                ServerStatus {
                    id: descriptor.id.clone(),
                    name: descriptor.display_name.clone(),
                    state: session
                        .as_ref()
                        .map_or(SessionState::Crashed, |session| session.state()),
                    pid: session.as_ref().and_then(|session| session.handle.pid()),
                    started_at: session.as_ref().map(|session| session.started_at),
                }
            })
            .collect()
    }

    /// Maps a child-local resource URI to its external form.
    pub fn external_resource_uri(&self, session: &ChildSession, local_uri: &str) -> String {
        self.namespacing
            .external_uri(&session.descriptor.display_name, local_uri)
    }

    fn broadcast(&self, message: Value) {
        // No subscribers is the common case.
        let _ = self.notifications.send(message);
    }

    fn on_child_message(self: &Arc<Self>, session: &Arc<ChildSession>, message: Value) {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let id = message.get("id").cloned();

        match (method, id) {
            (None, Some(id)) => match response_id(&id) {
                Some(id) => session.complete(id, message),
                None => debug!(server_id = %session.id(), "dropping response with foreign id"),
            },
            (Some(method), Some(id)) => self.answer_child_request(session, &method, id),
            (Some(method), None) => self.on_child_notification(session, &method, message),
            (None, None) => {
                warn!(server_id = %session.id(), "ignoring message without method or id")
            }
        }
    }

    fn answer_child_request(&self, session: &Arc<ChildSession>, method: &str, id: Value) {
        let reply = if method == "ping" {
            json_rpc_result(Some(id), json!({}))
        } else {
            debug!(server_id = %session.id(), method, "rejecting child request");
            json_rpc_error(Some(id), crate::mcp::rpc::METHOD_NOT_FOUND, "Method not found")
        };

        let session = session.clone();
        let deadline = self.timeouts.call;
        tokio::spawn(async move {
            if let Err(err) = session.send_within(&reply, deadline).await {
                debug!(server_id = %session.id(), error = %err, "failed to answer child request");
            }
        });
    }

    fn on_child_notification(
        self: &Arc<Self>,
        session: &Arc<ChildSession>,
        method: &str,
        mut message: Value,
    ) {
        if let Some(kind) = CapabilityKind::from_list_changed(method) {
            if !session.is_ready() {
                return;
            }
            debug!(server_id = %session.id(), kind = ?kind, "child capabilities changed");
            let registry = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                registry
                    .catalog
                    .refresh(&session, registry.namespacing, registry.timeouts.call)
                    .await;
                registry.broadcast(json_rpc_notification(kind.list_changed_method(), None));
            });
            return;
        }

        match method {
            "notifications/resources/updated" => {
                if let Some(uri) = message.pointer("/params/uri").and_then(Value::as_str) {
                    let external = self.external_resource_uri(session, uri);
                    message["params"]["uri"] = Value::String(external);
                }
                self.broadcast(message);
            }
            "notifications/progress" | "notifications/message" => self.broadcast(message),
            _ => debug!(server_id = %session.id(), method, "ignoring child notification"),
        }
    }

    fn on_child_exited(&self, session: &ChildSession, exit: ExitInfo) {
        let crashed = session.transition(SessionState::Crashed);
        self.catalog.remove(session.id());
        session.fail_pending();

        if crashed {
            warn!(server_id = %session.id(), exit = %exit, "child exited unexpectedly");
            for kind in CapabilityKind::ALL {
                self.broadcast(json_rpc_notification(kind.list_changed_method(), None));
            }
        } else {
            debug!(server_id = %session.id(), state = %session.state(), exit = %exit, "child exit observed");
        }
    }
}

fn response_id(id: &Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|id| id.parse().ok()))
}

/// Drains one child's events in order. Ends with the child.
async fn pump_events(
    registry: Weak<ServerRegistry>,
    session: Arc<ChildSession>,
    mut events: mpsc::UnboundedReceiver<ChildEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            session.fail_pending();
            return;
        };

        match event {
            ChildEvent::Message(message) => registry.on_child_message(&session, message),
            ChildEvent::Exited(exit) => {
                registry.on_child_exited(&session, exit);
                return;
            }
        }
    }

    // Launcher went away without reporting an exit.
    if let Some(registry) = registry.upgrade() {
        registry.on_child_exited(&session, ExitInfo::default());
    }
}
