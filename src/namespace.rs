//! Naming rules for capabilities exposed through the aggregator
//!
//! Tools and prompts are exposed as `<serverId>__<localName>`; resources as
//! `resource://<displayName>/<path>`. In passthrough mode (single-server
//! invocations) names and URIs are left exactly as the child reports them.

pub const SEPARATOR: &str = "__";
pub const RESOURCE_SCHEME: &str = "resource://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespacing {
    Prefixed,
    Passthrough,
}

impl Namespacing {
    pub fn external_name(self, server_id: &str, local_name: &str) -> String {
        match self {
            Self::Prefixed => qualify_name(server_id, local_name),
            Self::Passthrough => local_name.to_string(),
        }
    }

    pub fn external_uri(self, display_name: &str, local_uri: &str) -> String {
        match self {
            Self::Prefixed => qualify_resource_uri(display_name, local_uri),
            Self::Passthrough => local_uri.to_string(),
        }
    }
}

pub fn qualify_name(server_id: &str, local_name: &str) -> String {
    format!("{server_id}{SEPARATOR}{local_name}")
}

/// Splits on the first separator. Returns `None` when there is no separator
/// or either side is empty.
pub fn split_qualified_name(external_name: &str) -> Option<(&str, &str)> {
    let (server_id, local_name) = external_name.split_once(SEPARATOR)?;
    if server_id.is_empty() || local_name.is_empty() {
        return None;
    }
    Some((server_id, local_name))
}

pub fn qualify_resource_uri(display_name: &str, local_uri: &str) -> String {
    let path = local_uri.strip_prefix(RESOURCE_SCHEME).unwrap_or(local_uri);
    format!("{RESOURCE_SCHEME}{display_name}/{path}")
}

/// Splits an external resource URI into its display name and path.
pub fn split_resource_uri(external_uri: &str) -> Option<(&str, &str)> {
    let rest = external_uri.strip_prefix(RESOURCE_SCHEME)?;
    let (display_name, path) = rest.split_once('/')?;
    if display_name.is_empty() || path.is_empty() {
        return None;
    }
    Some((display_name, path))
}

/// Inverse of the path encoding used by [`qualify_resource_uri`] for URIs
/// that are not in a child's reverse index.
pub fn local_uri_from_path(path: &str) -> String {
    if path.contains("://") {
        path.to_string()
    } else {
        format!("{RESOURCE_SCHEME}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_split_on_first_separator() {
        let name = qualify_name("fs", "read__file");
        assert_eq!(name, "fs__read__file");
        assert_eq!(split_qualified_name(&name), Some(("fs", "read__file")));
    }

    #[test]
    fn unqualified_names_are_rejected() {
        assert_eq!(split_qualified_name("readFile"), None);
        assert_eq!(split_qualified_name("__readFile"), None);
        assert_eq!(split_qualified_name("fs__"), None);
    }

    #[test]
    fn resource_scheme_is_stripped_when_redundant() {
        assert_eq!(
            qualify_resource_uri("docs", "resource://guides/intro"),
            "resource://docs/guides/intro"
        );
        assert_eq!(
            local_uri_from_path("guides/intro"),
            "resource://guides/intro"
        );
    }

    #[test]
    fn foreign_schemes_are_kept_verbatim() {
        let external = qualify_resource_uri("fs", "file:///tmp/x");
        assert_eq!(external, "resource://fs/file:///tmp/x");

        let (display_name, path) = split_resource_uri(&external).expect("valid external uri");
        assert_eq!(display_name, "fs");
        assert_eq!(local_uri_from_path(path), "file:///tmp/x");
    }

    #[test]
    fn passthrough_leaves_names_untouched() {
        assert_eq!(Namespacing::Passthrough.external_name("fs", "echo"), "echo");
        assert_eq!(
            Namespacing::Passthrough.external_uri("Files", "file:///tmp/x"),
            "file:///tmp/x"
        );
        assert_eq!(Namespacing::Prefixed.external_name("fs", "echo"), "fs__echo");
    }

    #[test]
    fn malformed_resource_uris_are_rejected() {
        assert_eq!(split_resource_uri("file:///tmp/x"), None);
        assert_eq!(split_resource_uri("resource://fs"), None);
        assert_eq!(split_resource_uri("resource:///x"), None);
    }
}
