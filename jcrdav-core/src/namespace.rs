//! Namespace registry cache.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Prefixes every repository defines
pub const BUILTIN_NAMESPACES: [(&str, &str); 5] = [
    ("jcr", "http://www.jcp.org/jcr/1.0"),
    ("nt", "http://www.jcp.org/jcr/nt/1.0"),
    ("mix", "http://www.jcp.org/jcr/mix/1.0"),
    ("xml", "http://www.w3.org/XML/1998/namespace"),
    ("", ""),
];

/// Session-side view of the repository's prefix → uri table
#[derive(Debug)]
pub struct NamespaceRegistry {
    namespaces: BTreeMap<String, String>,
    loaded: bool,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self {
            namespaces: BUILTIN_NAMESPACES
                .iter()
                .map(|(p, u)| (p.to_string(), u.to_string()))
                .collect(),
            loaded: false,
        }
    }
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn ensure_loaded(&mut self, transport: &mut dyn Transport) -> Result<()> {
        if !self.loaded {
            let remote = transport.get_namespaces().await?;
            self.namespaces.extend(remote);
            self.loaded = true;
        }
        Ok(())
    }

    pub async fn prefixes(&mut self, transport: &mut dyn Transport) -> Result<Vec<String>> {
        self.ensure_loaded(transport).await?;
        Ok(self.namespaces.keys().cloned().collect())
    }

    pub async fn uris(&mut self, transport: &mut dyn Transport) -> Result<Vec<String>> {
        self.ensure_loaded(transport).await?;
        Ok(self.namespaces.values().cloned().collect())
    }

    pub async fn uri(&mut self, transport: &mut dyn Transport, prefix: &str) -> Result<String> {
        self.ensure_loaded(transport).await?;
        self.namespaces
            .get(prefix)
            .cloned()
            .ok_or_else(|| Error::Namespace(format!("prefix '{}' is not registered", prefix)))
    }

    pub async fn prefix(&mut self, transport: &mut dyn Transport, uri: &str) -> Result<String> {
        self.ensure_loaded(transport).await?;
        self.namespaces
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| Error::Namespace(format!("uri '{}' is not registered", uri)))
    }

    /// Register `prefix` → `uri`. Re-registering the same mapping is a no-op;
    /// remapping an existing prefix is not supported.
    pub async fn register(&mut self, transport: &mut dyn Transport, prefix: &str, uri: &str) -> Result<()> {
        check_prefix(prefix)?;
        if uri.is_empty() {
            return Err(Error::Namespace("namespace uri must not be empty".to_string()));
        }

        self.ensure_loaded(transport).await?;
        match self.namespaces.get(prefix) {
            Some(existing) if existing == uri => return Ok(()),
            Some(existing) => {
                return Err(Error::Unsupported(format!(
                    "prefix '{}' is already mapped to '{}'",
                    prefix, existing
                )));
            }
            None => {}
        }

        transport.register_namespace(prefix, uri).await?;
        self.namespaces.insert(prefix.to_string(), uri.to_string());
        tracing::info!("Registered namespace {} -> {}", prefix, uri);
        Ok(())
    }

    pub async fn unregister(&mut self, transport: &mut dyn Transport, prefix: &str) -> Result<()> {
        check_prefix(prefix)?;
        transport.unregister_namespace(prefix).await?;
        self.namespaces.remove(prefix);
        Ok(())
    }
}

fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() || BUILTIN_NAMESPACES.iter().any(|(p, _)| *p == prefix) {
        return Err(Error::Namespace(format!("prefix '{}' is reserved", prefix)));
    }
    if prefix.to_ascii_lowercase().starts_with("xml") {
        return Err(Error::Namespace(format!("prefix '{}' must not start with 'xml'", prefix)));
    }
    if prefix.contains(':') || prefix.contains('/') || prefix.chars().any(char::is_whitespace) {
        return Err(Error::Namespace(format!("invalid prefix '{}'", prefix)));
    }
    Ok(())
}
