//! Translation of external MCP calls into child-local calls and back

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::{
    catalog::CapabilityKind,
    errors::RouteError,
    mcp::method::McpMethod,
    namespace::{local_uri_from_path, split_qualified_name, split_resource_uri, Namespacing},
    registry::{ChildSession, ServerRegistry},
};

#[derive(Clone)]
pub struct RequestRouter {
    registry: Arc<ServerRegistry>,
}

/// Where one external name or URI lands.
struct Target {
    session: Arc<ChildSession>,
    local: String,
}

impl RequestRouter {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    /// Answers an external list call from the merged catalog.
    pub fn list(&self, kind: CapabilityKind) -> Value {
        json!({ kind.result_key(): self.registry.catalog().merged(kind) })
    }

    /// Forwards a server-bound call and returns the child's response with
    /// local URIs mapped back to external form.
    pub async fn forward(&self, method: &str, params: Option<Value>) -> Result<Value, RouteError> {
        let kind = match McpMethod::from_name(method) {
            McpMethod::Call(kind) => kind,
            McpMethod::Resource(_) => CapabilityKind::Resource,
            _ => return Err(RouteError::InvalidParams("method is not bound to a server")),
        };

        let mut params = params
            .filter(Value::is_object)
            .ok_or(RouteError::InvalidParams("params must be an object"))?;

        let key = kind.identity_key();
        let external = params
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or(match kind {
                CapabilityKind::Resource => RouteError::InvalidParams("params.uri is required"),
                CapabilityKind::Tool | CapabilityKind::Prompt => {
                    RouteError::InvalidParams("params.name is required")
                }
            })?;

        let Target { session, local } = self.resolve(kind, &external)?;
        debug!(server_id = %session.id(), method, external = %external, local = %local, "forwarding call");
        params[key] = Value::String(local);

        let mut response = session
            .request(method, Some(params), self.registry.timeouts().call)
            .await?;
        self.externalize(&session, &mut response);
        Ok(response)
    }

    fn resolve(&self, kind: CapabilityKind, external: &str) -> Result<Target, RouteError> {
        if self.registry.namespacing() == Namespacing::Passthrough {
            let server_id = self
                .registry
                .descriptors()
                .first()
                .map(|descriptor| descriptor.id.clone())
                .ok_or_else(|| RouteError::ServerNotFound(String::new()))?;
            return Ok(Target {
                session: self.registry.lookup(&server_id)?,
                local: external.to_string(),
            });
        }

        match kind {
            CapabilityKind::Resource => self.resolve_resource(external),
            CapabilityKind::Tool | CapabilityKind::Prompt => {
                let (server_id, local) = split_qualified_name(external).ok_or_else(|| {
                    RouteError::invalid_target(external, "expected <server>__<name>")
                })?;
                if self.registry.descriptor(server_id).is_none() {
                    return Err(RouteError::invalid_target(external, "unknown server prefix"));
                }
                Ok(Target {
                    session: self.registry.lookup(server_id)?,
                    local: local.to_string(),
                })
            }
        }
    }

    fn resolve_resource(&self, external: &str) -> Result<Target, RouteError> {
        let (display_name, path) = split_resource_uri(external).ok_or_else(|| {
            RouteError::invalid_target(external, "expected resource://<server>/<path>")
        })?;
        let server_id = self
            .registry
            .server_for_display_name(display_name)
            .ok_or_else(|| RouteError::invalid_target(external, "unknown server name"))?;
        let session = self.registry.lookup(server_id)?;

        let local = self
            .registry
            .catalog()
            .slice(server_id)
            .and_then(|slice| slice.local_uri(external).map(str::to_owned))
            .unwrap_or_else(|| local_uri_from_path(path));

        Ok(Target { session, local })
    }

    fn externalize(&self, session: &ChildSession, response: &mut Value) {
        if self.registry.namespacing() == Namespacing::Passthrough {
            return;
        }

        let rewrite = |uri: &str| self.registry.external_resource_uri(session, uri);
        if let Some(result) = response.get_mut("result") {
            rewrite_uris(result, &rewrite);
        }
        if let Some(data) = response.pointer_mut("/error/data") {
            rewrite_uris(data, &rewrite);
        }
    }
}

/// Rewrites resource URIs where results carry them: `contents[]` of a read,
/// `content[]` blocks of a tool result and the content of prompt messages.
/// Tool-defined data such as `structuredContent` is left alone.
fn rewrite_uris(result: &mut Value, rewrite: &impl Fn(&str) -> String) {
    if let Some(Value::Array(contents)) = result.get_mut("contents") {
        for content in contents {
            rewrite_field(content.get_mut("uri"), rewrite);
        }
    }

    if let Some(Value::Array(blocks)) = result.get_mut("content") {
        for block in blocks {
            rewrite_block(block, rewrite);
        }
    }

    if let Some(Value::Array(messages)) = result.get_mut("messages") {
        for message in messages {
            match message.get_mut("content") {
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        rewrite_block(block, rewrite);
                    }
                }
                Some(block) => rewrite_block(block, rewrite),
                None => {}
            }
        }
    }
}

fn rewrite_block(block: &mut Value, rewrite: &impl Fn(&str) -> String) {
    let pointer = match block.get("type").and_then(Value::as_str) {
        Some("resource_link") => "/uri",
        Some("resource") => "/resource/uri",
        _ => return,
    };
    rewrite_field(block.pointer_mut(pointer), rewrite);
}

fn rewrite_field(field: Option<&mut Value>, rewrite: &impl Fn(&str) -> String) {
    if let Some(field) = field {
        if let Some(uri) = field.as_str() {
            *field = Value::String(rewrite(uri));
        }
    }
}
