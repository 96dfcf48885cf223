//! SSE sessions opened with `GET /`
//!
//! Each session is one long-lived event stream. It carries responses to
//! messages pushed with `POST /?sessionId=<id>` and every notification the
//! registry relays from children.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex},
};

use axum::response::sse::Event;
use futures::{
    future,
    stream::{self, Stream, StreamExt},
};
use serde_json::Value;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>>,
}

/// Receiving side of one session. Dropping it closes the session.
pub struct OpenSession {
    pub id: String,
    receiver: mpsc::UnboundedReceiver<Value>,
    _guard: SessionGuard,
}

struct SessionGuard {
    manager: SessionManager,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.manager.close(&self.id) {
            debug!(session_id = %self.id, "sse session dropped");
        }
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Value>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open(&self) -> OpenSession {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.table().insert(id.clone(), sender);
        info!(session_id = %id, "sse session opened");

        OpenSession {
            id: id.clone(),
            receiver,
            _guard: SessionGuard {
                manager: self.clone(),
                id,
            },
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    /// Queues a message on the session's stream. Returns `false` if the
    /// session is gone.
    pub fn push(&self, id: &str, message: Value) -> bool {
        self.table()
            .get(id)
            .is_some_and(|sender| sender.send(message).is_ok())
    }

    /// Removes a session; its stream ends once queued messages are flushed.
    pub fn close(&self, id: &str) -> bool {
        self.table().remove(id).is_some()
    }

    /// Ends every open stream.
    pub fn close_all(&self) {
        let closed = std::mem::take(&mut *self.table());
        if !closed.is_empty() {
            info!(sessions = closed.len(), "closing sse sessions");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Endpoint event followed by session messages and relayed notifications.
pub fn event_stream(
    session: OpenSession,
    notifications: broadcast::Receiver<Value>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/?sessionId={}", session.id));

    let messages = stream::unfold(
        (session, notifications),
        |(mut session, mut notifications)| async move {
            loop {
                let message = tokio::select! {
                    pushed = session.receiver.recv() => pushed?,
                    relayed = notifications.recv() => match relayed {
                        Ok(message) => message,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(session_id = %session.id, skipped, "sse session lagged behind notifications");
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    },
                };

                return Some((Ok(message_event(&message)), (session, notifications)));
            }
        },
    );

    stream::once(future::ready(Ok(endpoint))).chain(messages)
}

pub fn message_event(message: &Value) -> Event {
    Event::default().event("message").data(message.to_string())
}
