//! Node type definitions fetched from the server.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, ErrorKind, Result};
use crate::transport::Transport;

/// Summary of a node type definition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeTypeInfo {
    pub name: String,
    pub is_mixin: bool,
    pub is_abstract: bool,
    pub orderable_child_nodes: bool,
    pub primary_item_name: Option<String>,
    /// Declared supertypes
    pub supertypes: Vec<String>,
}

impl NodeTypeInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_supertypes(mut self, supertypes: &[&str]) -> Self {
        self.supertypes = supertypes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn mixin(mut self) -> Self {
        self.is_mixin = true;
        self
    }
}

/// Lazily filled cache of node type definitions
#[derive(Debug, Default)]
pub struct NodeTypeDirectory {
    types: HashMap<String, NodeTypeInfo>,
    all_loaded: bool,
    /// Cleared when the transport cannot serve definitions
    available: bool,
}

impl NodeTypeDirectory {
    pub fn new() -> Self {
        Self {
            available: true,
            ..Default::default()
        }
    }

    /// Definition of `name`, fetched on first use.
    pub async fn get(&mut self, transport: &mut dyn Transport, name: &str) -> Result<NodeTypeInfo> {
        if let Some(info) = self.types.get(name) {
            return Ok(info.clone());
        }
        let fetched = transport.get_node_types(&[name.to_string()]).await?;
        for info in fetched {
            self.types.insert(info.name.clone(), info);
        }
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ItemNotFound(format!("no such node type {}", name)))
    }

    pub async fn all(&mut self, transport: &mut dyn Transport) -> Result<Vec<NodeTypeInfo>> {
        if !self.all_loaded {
            let fetched = transport.get_node_types(&[]).await?;
            for info in fetched {
                self.types.insert(info.name.clone(), info);
            }
            self.all_loaded = true;
        }
        let mut all: Vec<NodeTypeInfo> = self.types.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    pub async fn has(&mut self, transport: &mut dyn Transport, name: &str) -> Result<bool> {
        match self.get(transport, name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// True if a node with the given primary and mixin types is of type
    /// `wanted`, following declared supertypes.
    pub async fn is_node_type(
        &mut self,
        transport: &mut dyn Transport,
        primary: &str,
        mixins: &[String],
        wanted: &str,
    ) -> Result<bool> {
        if primary == wanted || mixins.iter().any(|m| m == wanted) {
            return Ok(true);
        }
        if wanted == "nt:base" {
            return Ok(true);
        }
        if !self.available {
            return Ok(false);
        }

        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(primary.to_string());
        queue.extend(mixins.iter().cloned());
        let mut seen: Vec<String> = Vec::new();

        while let Some(name) = queue.pop_front() {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());

            let info = match self.get(transport, &name).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.kind() == ErrorKind::Capability => {
                    self.available = false;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            if info.supertypes.iter().any(|s| s == wanted) {
                return Ok(true);
            }
            queue.extend(info.supertypes);
        }
        Ok(false)
    }

    /// Register types from CND and drop the cache.
    pub async fn register_cnd(&mut self, transport: &mut dyn Transport, cnd: &str, allow_update: bool) -> Result<()> {
        transport.register_node_types_cnd(cnd, allow_update).await?;
        self.types.clear();
        self.all_loaded = false;
        Ok(())
    }
}
