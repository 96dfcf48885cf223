//! Merged view of every ready child's tools, resources and prompts
//!
//! Each child owns one [`CatalogSlice`]. A refresh builds a complete new slice
//! and swaps it in only if the child is still `ready`, so readers never see a
//! half-populated list and a crashed child never reappears.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::Duration,
};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{errors::RouteError, namespace::Namespacing, registry::ChildSession};

/// Upper bound on `nextCursor` pages followed per list call.
const MAX_LIST_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [Self::Tool, Self::Resource, Self::Prompt];

    pub fn list_method(self) -> &'static str {
        match self {
            Self::Tool => "tools/list",
            Self::Resource => "resources/list",
            Self::Prompt => "prompts/list",
        }
    }

    /// Key of the item array in a list result, and of the capability in `initialize`.
    pub fn result_key(self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Resource => "resources",
            Self::Prompt => "prompts",
        }
    }

    /// Field that identifies one item.
    pub fn identity_key(self) -> &'static str {
        match self {
            Self::Resource => "uri",
            Self::Tool | Self::Prompt => "name",
        }
    }

    pub fn list_changed_method(self) -> &'static str {
        match self {
            Self::Tool => "notifications/tools/list_changed",
            Self::Resource => "notifications/resources/list_changed",
            Self::Prompt => "notifications/prompts/list_changed",
        }
    }

    pub fn from_list_changed(method: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.list_changed_method() == method)
    }
}

/// One item as exposed to clients, with its route back to the child.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespacedCapability {
    pub kind: CapabilityKind,
    pub external_name: String,
    pub server_id: String,
    pub local_name: String,
    /// Child's definition with the identity field rewritten.
    pub definition: Value,
}

#[derive(Debug, Default)]
pub struct CatalogSlice {
    items: HashMap<CapabilityKind, Vec<NamespacedCapability>>,
    /// External resource URI to the child's own URI.
    local_uris: HashMap<String, String>,
}

impl CatalogSlice {
    pub fn items(&self, kind: CapabilityKind) -> &[NamespacedCapability] {
        self.items.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn local_uri(&self, external_uri: &str) -> Option<&str> {
        self.local_uris.get(external_uri).map(String::as_str)
    }

    fn insert(&mut self, kind: CapabilityKind, items: Vec<NamespacedCapability>) {
        if kind == CapabilityKind::Resource {
            self.local_uris.extend(
                items
                    .iter()
                    .map(|item| (item.external_name.clone(), item.local_name.clone())),
            );
        }
        self.items.insert(kind, items);
    }
}

#[derive(Debug, Error)]
enum ListError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("child answered with an error: {0}")]
    Rejected(String),
}

pub struct Catalog {
    order: Vec<String>,
    slices: RwLock<HashMap<String, Arc<CatalogSlice>>>,
}

impl Catalog {
    /// `order` is the configured server order used when merging.
    pub fn new(order: impl IntoIterator<Item = String>) -> Self {
        Self {
            order: order.into_iter().collect(),
            slices: RwLock::new(HashMap::new()),
        }
    }

    pub fn slice(&self, server_id: &str) -> Option<Arc<CatalogSlice>> {
        self.slices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(server_id)
            .cloned()
    }

    pub fn remove(&self, server_id: &str) {
        self.slices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(server_id);
    }

    /// Union of every slice for `kind`, grouped by configured server order.
    pub fn merged(&self, kind: CapabilityKind) -> Vec<Value> {
        let slices = self
            .slices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.order
            .iter()
            .filter_map(|server_id| slices.get(server_id))
            .flat_map(|slice| slice.items(kind))
            .map(|item| item.definition.clone())
            .collect()
    }

    /// Re-lists every kind the child advertised and swaps the new slice in.
    /// A failing list leaves that kind empty rather than failing the child.
    /// Refreshes of one child run one at a time.
    pub async fn refresh(&self, session: &ChildSession, namespacing: Namespacing, deadline: Duration) {
        let _serialized = session.refresh_lock().lock().await;
        let capabilities = session.capabilities();
        let mut slice = CatalogSlice::default();

        for kind in CapabilityKind::ALL {
            if capabilities.get(kind.result_key()).is_none() {
                continue;
            }

            match list_all(session, kind, deadline).await {
                Ok(definitions) => {
                    let items = namespace_items(session, namespacing, kind, definitions);
                    debug!(server_id = %session.id(), kind = kind.result_key(), count = items.len(), "catalog listed");
                    slice.insert(kind, items);
                }
                Err(err) => warn!(
                    server_id = %session.id(),
                    method = kind.list_method(),
                    error = %err,
                    "failed to list child capabilities"
                ),
            }
        }

        self.replace_if_ready(session, slice);
    }

    fn replace_if_ready(&self, session: &ChildSession, slice: CatalogSlice) {
        let mut slices = self
            .slices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        // Checked under the write lock so a concurrent exit cannot be undone.
        if session.is_ready() {
            slices.insert(session.id().to_string(), Arc::new(slice));
        } else {
            debug!(server_id = %session.id(), state = %session.state(), "discarding catalog of inactive child");
        }
    }
}

async fn list_all(
    session: &ChildSession,
    kind: CapabilityKind,
    deadline: Duration,
) -> Result<Vec<Value>, ListError> {
    let mut definitions = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.take().map(|cursor| json!({ "cursor": cursor }));
        let response = session.request(kind.list_method(), params, deadline).await?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ListError::Rejected(message.to_string()));
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        if let Some(page) = result.get(kind.result_key()).and_then(Value::as_array) {
            definitions.extend(page.iter().cloned());
        }

        match result.get("nextCursor").and_then(Value::as_str) {
            Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
            _ => return Ok(definitions),
        }
    }

    warn!(server_id = %session.id(), method = kind.list_method(), "list pagination limit reached");
    Ok(definitions)
}

fn namespace_items(
    session: &ChildSession,
    namespacing: Namespacing,
    kind: CapabilityKind,
    definitions: Vec<Value>,
) -> Vec<NamespacedCapability> {
    let descriptor = session.descriptor();
    let key = kind.identity_key();
    let mut seen = HashSet::new();

    definitions
        .into_iter()
        .filter_map(|mut definition| {
            let Some(local_name) = definition.get(key).and_then(Value::as_str).map(str::to_owned)
            else {
                warn!(server_id = %descriptor.id, kind = kind.result_key(), field = key, "skipping item without identity");
                return None;
            };

            let external_name = match kind {
                CapabilityKind::Resource => {
                    namespacing.external_uri(&descriptor.display_name, &local_name)
                }
                CapabilityKind::Tool | CapabilityKind::Prompt => {
                    namespacing.external_name(&descriptor.id, &local_name)
                }
            };

            if !seen.insert(external_name.clone()) {
                warn!(server_id = %descriptor.id, name = %external_name, "skipping duplicate item");
                return None;
            }

            definition[key] = Value::String(external_name.clone());
            Some(NamespacedCapability {
                kind,
                external_name,
                server_id: descriptor.id.clone(),
                local_name,
                definition,
            })
        })
        .collect()
}
