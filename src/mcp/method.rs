//! Classification of client method names

use crate::catalog::CapabilityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    Read,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Ping,
    List(CapabilityKind),
    ListResourceTemplates,
    /// `tools/call` or `prompts/get`.
    Call(CapabilityKind),
    Resource(ResourceOperation),
    SetLogLevel,
    Notification(String),
    Unsupported(String),
}

impl McpMethod {
    pub fn from_name(method: &str) -> Self {
        match method {
            "initialize" => Self::Initialize,
            "ping" => Self::Ping,
            "tools/list" => Self::List(CapabilityKind::Tool),
            "resources/list" => Self::List(CapabilityKind::Resource),
            "prompts/list" => Self::List(CapabilityKind::Prompt),
            "resources/templates/list" => Self::ListResourceTemplates,
            "tools/call" => Self::Call(CapabilityKind::Tool),
            "prompts/get" => Self::Call(CapabilityKind::Prompt),
            "resources/read" => Self::Resource(ResourceOperation::Read),
            "resources/subscribe" => Self::Resource(ResourceOperation::Subscribe),
            "resources/unsubscribe" => Self::Resource(ResourceOperation::Unsubscribe),
            "logging/setLevel" => Self::SetLogLevel,
            other if other.starts_with("notifications/") => Self::Notification(other.to_string()),
            other => Self::Unsupported(other.to_string()),
        }
    }
}
