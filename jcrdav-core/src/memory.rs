//! In-memory transport.
//!
//! A complete [`Transport`] over a process-local repository, used by the
//! integration tests and by offline tooling. Clones share the same
//! repository state, so a test can keep one handle to seed data and inspect
//! request counters while a session owns another.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::binary::BinarySource;
use crate::error::{Error, Result};
use crate::item::{Node, JCR_MIXIN_TYPES, JCR_PRIMARY_TYPE, JCR_UUID, NT_UNSTRUCTURED};
use crate::lock::Lock;
use crate::namespace::BUILTIN_NAMESPACES;
use crate::node_type::NodeTypeInfo;
use crate::observation::{Event, EventType};
use crate::path::{self, ROOT};
use crate::query::Query;
use crate::session::ACTIONS;
use crate::transport::{
    Capabilities, Credentials, DescriptorValue, Descriptors, LockRequest, NodeData, RawRow, Transport,
};
use crate::value::{PropertyType, Value};
use crate::write_log::{PropertySnapshot, WriteLog, WriteOp};

pub const DEFAULT_WORKSPACE: &str = "default";

/// Request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Every call that would have been a round trip
    pub requests: usize,
    /// Single node reads
    pub reads: usize,
    /// Batched multi-node reads
    pub batch_reads: usize,
    /// Flushed write batches
    pub saves: usize,
}

#[derive(Debug, Clone, Default)]
struct StoredNode {
    properties: BTreeMap<String, PropertySnapshot>,
    children: Vec<String>,
}

impl StoredNode {
    fn with_type(primary_type: &str) -> Self {
        let mut node = StoredNode::default();
        node.properties.insert(
            JCR_PRIMARY_TYPE.to_string(),
            PropertySnapshot::single(JCR_PRIMARY_TYPE, Value::Name(primary_type.to_string())),
        );
        node
    }

    fn value(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).and_then(|p| p.values.first())
    }
}

type Tree = BTreeMap<String, StoredNode>;

#[derive(Debug)]
struct Version {
    name: String,
    node_path: String,
    snapshot: StoredNode,
}

#[derive(Debug)]
struct MemoryState {
    workspaces: BTreeMap<String, Tree>,
    namespaces: BTreeMap<String, String>,
    node_types: BTreeMap<String, NodeTypeInfo>,
    descriptors: Descriptors,
    /// `(workspace, path)` → lock
    locks: BTreeMap<(String, String), Lock>,
    /// History path → versions in creation order
    versions: BTreeMap<String, Vec<Version>>,
    events: Vec<Event>,
    query_rows: Vec<RawRow>,
    permissions: BTreeMap<String, Vec<String>>,
    stats: MemoryStats,
    last_batch: Vec<WriteOp>,
    last_query: Option<Query>,
    fail_next_save: Option<String>,
    reject_batch_reads: bool,
}

fn new_tree() -> Tree {
    let mut tree = Tree::new();
    tree.insert(ROOT.to_string(), StoredNode::with_type("rep:root"));
    tree
}

fn builtin_node_types() -> Vec<NodeTypeInfo> {
    let mut types = vec![
        NodeTypeInfo::new("nt:base"),
        NodeTypeInfo::new("nt:unstructured").with_supertypes(&["nt:base"]),
        NodeTypeInfo::new("nt:hierarchyNode").with_supertypes(&["mix:created"]),
        NodeTypeInfo::new("nt:folder").with_supertypes(&["nt:hierarchyNode"]),
        NodeTypeInfo::new("nt:file").with_supertypes(&["nt:hierarchyNode"]),
        NodeTypeInfo::new("nt:resource").with_supertypes(&["mix:mimeType", "mix:lastModified"]),
        NodeTypeInfo::new("rep:root").with_supertypes(&["nt:unstructured"]),
        NodeTypeInfo::new("mix:created").mixin(),
        NodeTypeInfo::new("mix:mimeType").mixin(),
        NodeTypeInfo::new("mix:lastModified").mixin(),
        NodeTypeInfo::new("mix:referenceable").mixin(),
        NodeTypeInfo::new("mix:lockable").mixin(),
        NodeTypeInfo::new("mix:versionable").with_supertypes(&["mix:referenceable"]).mixin(),
    ];
    for t in types.iter_mut() {
        if t.name == "nt:base" || t.name == "nt:hierarchyNode" {
            t.is_abstract = true;
        }
        if t.name == "nt:unstructured" {
            t.orderable_child_nodes = true;
        }
        if t.name == "nt:file" {
            t.primary_item_name = Some("jcr:content".to_string());
        }
        if !t.is_mixin && t.name != "nt:base" && !t.supertypes.iter().any(|s| s.starts_with("nt:")) {
            t.supertypes.push("nt:base".to_string());
        }
    }
    types
}

impl Default for MemoryState {
    fn default() -> Self {
        let mut workspaces = BTreeMap::new();
        workspaces.insert(DEFAULT_WORKSPACE.to_string(), new_tree());

        let mut descriptors = Descriptors::new();
        descriptors.insert(
            "jcr.repository.version".to_string(),
            DescriptorValue::Single("2.4.0".to_string()),
        );
        descriptors.insert(
            "jcr.specification.version".to_string(),
            DescriptorValue::Single("2.0".to_string()),
        );
        descriptors.insert(
            "query.languages".to_string(),
            DescriptorValue::Multiple(vec!["xpath".into(), "sql".into(), "JCR-SQL2".into()]),
        );

        Self {
            workspaces,
            namespaces: BUILTIN_NAMESPACES
                .iter()
                .map(|(p, u)| (p.to_string(), u.to_string()))
                .collect(),
            node_types: builtin_node_types().into_iter().map(|t| (t.name.clone(), t)).collect(),
            descriptors,
            locks: BTreeMap::new(),
            versions: BTreeMap::new(),
            events: Vec::new(),
            query_rows: Vec::new(),
            permissions: BTreeMap::new(),
            stats: MemoryStats::default(),
            last_batch: Vec::new(),
            last_query: None,
            fail_next_save: None,
            reject_batch_reads: false,
        }
    }
}

impl MemoryState {
    fn tree(&self, workspace: &str) -> Result<&Tree> {
        self.workspaces
            .get(workspace)
            .ok_or_else(|| Error::ItemNotFound(format!("no such workspace '{}'", workspace)))
    }

    fn tree_mut(&mut self, workspace: &str) -> Result<&mut Tree> {
        self.workspaces
            .get_mut(workspace)
            .ok_or_else(|| Error::ItemNotFound(format!("no such workspace '{}'", workspace)))
    }

    fn binary_values(&self, workspace: &str, path: &str) -> Result<Vec<Bytes>> {
        let tree = self.tree(workspace)?;
        let property = tree
            .get(path::parent(path))
            .and_then(|n| n.properties.get(path::name(path)))
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        Ok(property
            .values
            .iter()
            .map(|v| match v {
                Value::Binary(b) => b.clone(),
                other => Bytes::from(other.to_jcr_string()),
            })
            .collect())
    }

    /// Lock covering `path`: its own, or a deep lock on an ancestor.
    fn covering_lock(&self, workspace: &str, path: &str) -> Option<&Lock> {
        self.locks.iter().find_map(|((ws, locked), lock)| {
            let covers = locked == path || (lock.deep && path::is_descendant(path, locked));
            (ws == workspace && covers).then_some(lock)
        })
    }
}

/// Transport over an in-process repository
#[derive(Clone)]
pub struct InMemoryTransport {
    state: Arc<RwLock<MemoryState>>,
    capabilities: Capabilities,
    workspace: Option<String>,
    user_id: String,
    closed: bool,
    fetch_depth: u32,
    log: WriteLog,
    user_data: Option<String>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            capabilities: Capabilities::all(),
            workspace: None,
            user_id: String::new(),
            closed: false,
            fetch_depth: 0,
            log: WriteLog::new(),
            user_data: None,
        }
    }

    /// Same repository, advertising only `capabilities`.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    // ---- seeding ----

    pub async fn add_workspace(&self, name: &str) {
        let mut state = self.state.write().await;
        state.workspaces.entry(name.to_string()).or_insert_with(new_tree);
    }

    /// Store a subtree given in the JSON read format. Missing ancestors are
    /// created as `nt:unstructured`; an existing node at `path` is replaced.
    pub async fn seed(&self, workspace: &str, node_path: &str, data: Json) -> Result<()> {
        let node_path = path::normalize(node_path)?;
        let data = match data {
            Json::Object(map) => map,
            other => return Err(Error::protocol(format!("seed data must be an object, got {}", other))),
        };
        let mut state = self.state.write().await;
        let tree = state.tree_mut(workspace)?;

        for ancestor in path::ancestors(&node_path).into_iter().rev() {
            if !tree.contains_key(ancestor) {
                tree.insert(ancestor.to_string(), StoredNode::with_type(NT_UNSTRUCTURED));
                link_child(tree, ancestor);
            }
        }
        remove_subtree(tree, &node_path);
        seed_node(tree, &node_path, &data)?;
        link_child(tree, &node_path);
        Ok(())
    }

    /// Seed into the default workspace.
    pub async fn seed_default(&self, node_path: &str, data: Json) -> Result<()> {
        self.seed(DEFAULT_WORKSPACE, node_path, data).await
    }

    /// Store a binary property with the given values.
    pub async fn seed_binary(&self, property_path: &str, values: Vec<Bytes>, multiple: bool) -> Result<()> {
        let property_path = path::normalize(property_path)?;
        let mut state = self.state.write().await;
        let tree = state.tree_mut(DEFAULT_WORKSPACE)?;
        let node = tree
            .get_mut(path::parent(&property_path))
            .ok_or_else(|| Error::PathNotFound(property_path.clone()))?;
        let name = path::name(&property_path).to_string();
        let values: Vec<Value> = values.into_iter().map(Value::Binary).collect();
        let snapshot = if multiple {
            PropertySnapshot::multiple(name.clone(), PropertyType::Binary, values)
        } else {
            let value = values
                .into_iter()
                .next()
                .ok_or_else(|| Error::ValueFormat("single binary needs one value".to_string()))?;
            PropertySnapshot::single(name.clone(), value)
        };
        node.properties.insert(name, snapshot);
        Ok(())
    }

    pub async fn push_event(&self, event: Event) {
        self.state.write().await.events.push(event);
    }

    /// Rows returned by every query from now on.
    pub async fn set_query_rows(&self, rows: Vec<RawRow>) {
        self.state.write().await.query_rows = rows;
    }

    /// Restrict the actions granted at `path` and below.
    pub async fn set_permissions(&self, path: &str, actions: &[&str]) {
        self.state
            .write()
            .await
            .permissions
            .insert(path.to_string(), actions.iter().map(|a| a.to_string()).collect());
    }

    pub async fn add_node_type(&self, info: NodeTypeInfo) {
        self.state.write().await.node_types.insert(info.name.clone(), info);
    }

    pub async fn set_descriptor(&self, key: &str, value: DescriptorValue) {
        self.state.write().await.descriptors.insert(key.to_string(), value);
    }

    /// Make the next non-empty save fail with an HTTP 500.
    pub async fn fail_next_save(&self, message: &str) {
        self.state.write().await.fail_next_save = Some(message.to_string());
    }

    /// Reject batched reads the way servers with an empty-prefix bug do.
    pub async fn reject_batch_reads(&self, reject: bool) {
        self.state.write().await.reject_batch_reads = reject;
    }

    // ---- inspection ----

    pub async fn stats(&self) -> MemoryStats {
        self.state.read().await.stats
    }

    /// Operations of the last flushed write batch.
    pub async fn last_batch(&self) -> Vec<WriteOp> {
        self.state.read().await.last_batch.clone()
    }

    pub async fn last_query(&self) -> Option<Query> {
        self.state.read().await.last_query.clone()
    }

    pub async fn stored_property(&self, property_path: &str) -> Option<PropertySnapshot> {
        let state = self.state.read().await;
        state
            .workspaces
            .get(DEFAULT_WORKSPACE)?
            .get(path::parent(property_path))?
            .properties
            .get(path::name(property_path))
            .cloned()
    }

    pub async fn stored_children(&self, node_path: &str) -> Option<Vec<String>> {
        let state = self.state.read().await;
        Some(state.workspaces.get(DEFAULT_WORKSPACE)?.get(node_path)?.children.clone())
    }

    pub async fn stored_node_exists(&self, workspace: &str, node_path: &str) -> bool {
        let state = self.state.read().await;
        state
            .workspaces
            .get(workspace)
            .map_or(false, |t| t.contains_key(node_path))
    }

    pub async fn server_locked(&self, node_path: &str) -> bool {
        let state = self.state.read().await;
        state
            .locks
            .contains_key(&(DEFAULT_WORKSPACE.to_string(), node_path.to_string()))
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.read().await.events.clone()
    }

    // ---- internals ----

    fn check_open(&self) -> Result<&str> {
        if self.closed {
            return Err(Error::protocol("closed transport"));
        }
        self.workspace
            .as_deref()
            .ok_or_else(|| Error::protocol("transport is not logged in"))
    }

    /// Open check plus one counted request.
    async fn begin(&self) -> Result<(tokio::sync::RwLockWriteGuard<'_, MemoryState>, String)> {
        let workspace = self.check_open()?.to_string();
        let mut state = self.state.write().await;
        state.stats.requests += 1;
        Ok((state, workspace))
    }

    fn stage(&mut self, op: WriteOp) -> Result<()> {
        self.check_open()?;
        self.log.push(op);
        Ok(())
    }

    fn event(&self, kind: EventType, path: &str, now: chrono::DateTime<Utc>) -> Event {
        let mut event = Event::new(kind).with_path(path).with_date(now);
        event.user_id = Some(self.user_id.clone());
        event.user_data = self.user_data.clone();
        event
    }

    fn events_for(&self, ops: &[WriteOp], tree: &Tree) -> Vec<Event> {
        let now = Utc::now();
        let mut events = Vec::new();
        for op in ops {
            match op {
                WriteOp::AddNode { path, properties } => {
                    let mut event = self.event(EventType::NodeAdded, path, now);
                    if let Some(node) = tree.get(path) {
                        event.identifier = node.value(JCR_UUID).map(Value::to_jcr_string);
                        event.primary_node_type = node.value(JCR_PRIMARY_TYPE).map(Value::to_jcr_string);
                    }
                    events.push(event);
                    for prop in properties {
                        events.push(self.event(EventType::PropertyAdded, &path::join(path, &prop.name), now));
                    }
                }
                WriteOp::SetProperty { path, .. } => {
                    events.push(self.event(EventType::PropertyChanged, path, now));
                }
                WriteOp::RemoveNode { path } => events.push(self.event(EventType::NodeRemoved, path, now)),
                WriteOp::RemoveProperty { path } => {
                    events.push(self.event(EventType::PropertyRemoved, path, now))
                }
                WriteOp::Move { src, dst } => {
                    let mut event = self.event(EventType::NodeMoved, dst, now);
                    event.info.insert("srcAbsPath".to_string(), src.clone());
                    event.info.insert("destAbsPath".to_string(), dst.clone());
                    events.push(event);
                }
                WriteOp::Reorder { parent, child, before } => {
                    let mut event = self.event(EventType::NodeMoved, &path::join(parent, child), now);
                    event.info.insert("srcChildRelPath".to_string(), child.clone());
                    if let Some(before) = before {
                        event.info.insert("destChildRelPath".to_string(), before.clone());
                    }
                    events.push(event);
                }
            }
        }
        if !events.is_empty() {
            events.push(self.event(EventType::Persist, ROOT, now));
        }
        events
    }
}

fn link_child(tree: &mut Tree, node_path: &str) {
    if node_path == ROOT {
        return;
    }
    let name = path::name(node_path).to_string();
    if let Some(parent) = tree.get_mut(path::parent(node_path)) {
        if !parent.children.contains(&name) {
            parent.children.push(name);
        }
    }
}

fn unlink_child(tree: &mut Tree, node_path: &str) {
    let name = path::name(node_path);
    if let Some(parent) = tree.get_mut(path::parent(node_path)) {
        parent.children.retain(|c| c != name);
    }
}

fn remove_subtree(tree: &mut Tree, node_path: &str) {
    tree.retain(|p, _| !path::is_self_or_descendant(p, node_path));
}

fn seed_node(tree: &mut Tree, node_path: &str, data: &NodeData) -> Result<()> {
    let (node, nested) = Node::from_data(node_path, data, 0)?;
    let mut stored = StoredNode::default();
    for prop in node.properties() {
        if prop.is_loaded() {
            stored.properties.insert(prop.name().to_string(), prop.snapshot());
        }
    }
    stored
        .properties
        .entry(JCR_PRIMARY_TYPE.to_string())
        .or_insert_with(|| PropertySnapshot::single(JCR_PRIMARY_TYPE, Value::Name(NT_UNSTRUCTURED.to_string())));
    stored.children = node.child_names().to_vec();
    tree.insert(node_path.to_string(), stored);

    for child in node.child_names() {
        let child_path = path::join(node_path, child);
        match nested.iter().find(|(p, _)| *p == child_path) {
            Some((_, child_data)) => seed_node(tree, &child_path, child_data)?,
            None => {
                tree.insert(child_path, StoredNode::with_type(NT_UNSTRUCTURED));
            }
        }
    }
    Ok(())
}

fn value_json(value: &Value) -> Json {
    match value {
        Value::Long(v) => Json::from(*v),
        Value::Boolean(b) => Json::Bool(*b),
        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(value.to_jcr_string())),
        other => Json::String(other.to_jcr_string()),
    }
}

/// Render a stored subtree in the JSON read format, `depth` levels deep.
fn node_json(tree: &Tree, node_path: &str, depth: u32) -> NodeData {
    let mut data = NodeData::new();
    let node = match tree.get(node_path) {
        Some(node) => node,
        None => return data,
    };

    for prop in node.properties.values() {
        if prop.kind == PropertyType::Binary {
            let lengths: Vec<Json> = prop.values.iter().map(|v| Json::from(v.len() as u64)).collect();
            let hint = if prop.multiple {
                Json::Array(lengths)
            } else {
                lengths.into_iter().next().unwrap_or(Json::from(0u64))
            };
            data.insert(format!(":{}", prop.name), hint);
            continue;
        }

        let values: Vec<Json> = prop.values.iter().map(value_json).collect();
        let json = if prop.multiple {
            Json::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Json::Null)
        };
        data.insert(prop.name.clone(), json);

        let native = matches!(
            prop.kind,
            PropertyType::String | PropertyType::Long | PropertyType::Boolean
        );
        if !native && prop.name != JCR_PRIMARY_TYPE && prop.name != JCR_MIXIN_TYPES {
            data.insert(format!(":{}", prop.name), Json::String(prop.kind.name().to_string()));
        }
    }

    for child in &node.children {
        let child_data = if depth > 0 {
            node_json(tree, &path::join(node_path, child), depth - 1)
        } else {
            NodeData::new()
        };
        data.insert(child.clone(), Json::Object(child_data));
    }
    data
}

fn require_node<'t>(tree: &'t Tree, node_path: &str) -> Result<&'t StoredNode> {
    tree.get(node_path)
        .ok_or_else(|| Error::ItemNotFound(node_path.to_string()))
}

fn move_subtree(tree: &mut Tree, src: &str, dst: &str) -> Result<()> {
    require_node(tree, src)?;
    require_node(tree, path::parent(dst))?;
    if tree.contains_key(dst) {
        return Err(Error::ItemExists(dst.to_string()));
    }
    if path::is_descendant(dst, src) {
        return Err(Error::InvalidItemState(format!("cannot move {} below itself", src)));
    }
    let moved: Vec<String> = tree
        .keys()
        .filter(|p| path::is_self_or_descendant(p, src))
        .cloned()
        .collect();
    for p in moved {
        if let Some(node) = tree.remove(&p) {
            tree.insert(path::rebase(&p, src, dst), node);
        }
    }
    unlink_child(tree, src);
    link_child(tree, dst);
    Ok(())
}

fn apply(tree: &mut Tree, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::AddNode { path: node_path, properties } => {
            require_node(tree, path::parent(node_path))?;
            if tree.contains_key(node_path) {
                return Err(Error::ItemExists(node_path.clone()));
            }
            let mut node = StoredNode::default();
            for prop in properties {
                node.properties.insert(prop.name.clone(), prop.clone());
            }
            tree.insert(node_path.clone(), node);
            link_child(tree, node_path);
        }
        WriteOp::SetProperty { path: prop_path, property } => {
            let node = tree
                .get_mut(path::parent(prop_path))
                .ok_or_else(|| Error::ItemNotFound(path::parent(prop_path).to_string()))?;
            node.properties.insert(property.name.clone(), property.clone());
        }
        WriteOp::RemoveNode { path: node_path } => {
            require_node(tree, node_path)?;
            remove_subtree(tree, node_path);
            unlink_child(tree, node_path);
        }
        WriteOp::RemoveProperty { path: prop_path } => {
            let removed = tree
                .get_mut(path::parent(prop_path))
                .and_then(|n| n.properties.remove(path::name(prop_path)));
            if removed.is_none() {
                return Err(Error::ItemNotFound(prop_path.clone()));
            }
        }
        WriteOp::Move { src, dst } => move_subtree(tree, src, dst)?,
        WriteOp::Reorder { parent, child, before } => {
            let node = tree
                .get_mut(parent.as_str())
                .ok_or_else(|| Error::ItemNotFound(parent.clone()))?;
            let from = node
                .children
                .iter()
                .position(|c| c == child)
                .ok_or_else(|| Error::ItemNotFound(path::join(parent, child)))?;
            let moved = node.children.remove(from);
            match before {
                Some(before) => {
                    let to = node
                        .children
                        .iter()
                        .position(|c| c == before)
                        .ok_or_else(|| Error::ItemNotFound(path::join(parent, before)))?;
                    node.children.insert(to, moved);
                }
                None => node.children.push(moved),
            }
        }
    }
    Ok(())
}

fn history_path(node_path: &str) -> String {
    format!("/jcr:system/jcr:versionStorage{}", node_path)
}

/// Node type header lines of CND text: `[name] > supers option...`
fn parse_cnd(cnd: &str) -> Result<Vec<NodeTypeInfo>> {
    let mut types = Vec::new();
    for line in cnd.lines().map(str::trim) {
        if !line.starts_with('[') {
            continue;
        }
        let close = line
            .find(']')
            .ok_or_else(|| Error::protocol(format!("malformed CND line '{}'", line)))?;
        let mut info = NodeTypeInfo::new(line[1..close].trim());

        let spaced = line[close + 1..].replace(',', " , ").replace('>', " > ");
        let mut tokens = spaced.split_whitespace().peekable();
        if tokens.peek() == Some(&">") {
            tokens.next();
            while let Some(name) = tokens.next() {
                info.supertypes.push(name.to_string());
                if tokens.peek() == Some(&",") {
                    tokens.next();
                } else {
                    break;
                }
            }
        }
        while let Some(word) = tokens.next() {
            match word.to_ascii_lowercase().as_str() {
                "mixin" | "mix" => info.is_mixin = true,
                "abstract" | "abs" | "a" => info.is_abstract = true,
                "orderable" | "ord" | "o" => info.orderable_child_nodes = true,
                "primaryitem" | "!" => info.primary_item_name = tokens.next().map(str::to_string),
                _ => {}
            }
        }
        types.push(info);
    }
    Ok(types)
}

/// Binary source reading straight from a shared in-memory repository
pub struct MemoryBinarySource {
    state: Arc<RwLock<MemoryState>>,
    workspace: String,
}

#[async_trait]
impl BinarySource for MemoryBinarySource {
    async fn fetch(&self, path: &str) -> Result<Vec<Bytes>> {
        let mut state = self.state.write().await;
        state.stats.requests += 1;
        state.binary_values(&self.workspace, path)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn login(&mut self, credentials: &Credentials, workspace: &str) -> Result<()> {
        if self.closed {
            return Err(Error::protocol("closed transport"));
        }
        if let Some(current) = &self.workspace {
            return Err(Error::protocol(format!("already logged in to workspace '{}'", current)));
        }
        let mut state = self.state.write().await;
        state.stats.requests += 1;
        state.tree(workspace)?;
        self.workspace = Some(workspace.to_string());
        self.user_id = credentials.user_id.clone();
        Ok(())
    }

    async fn logout(&mut self) {
        self.closed = true;
        self.log.clear();
    }

    async fn repository_descriptors(&mut self) -> Result<Descriptors> {
        let (state, _) = self.begin().await?;
        Ok(state.descriptors.clone())
    }

    async fn accessible_workspace_names(&mut self) -> Result<Vec<String>> {
        let (state, _) = self.begin().await?;
        Ok(state.workspaces.keys().cloned().collect())
    }

    fn fetch_depth(&self) -> u32 {
        self.fetch_depth
    }

    fn set_fetch_depth(&mut self, depth: u32) {
        self.fetch_depth = depth;
    }

    async fn get_node(&mut self, node_path: &str) -> Result<NodeData> {
        let depth = self.fetch_depth;
        let (mut state, workspace) = self.begin().await?;
        state.stats.reads += 1;
        let tree = state.tree(&workspace)?;
        require_node(tree, node_path)?;
        Ok(node_json(tree, node_path, depth))
    }

    async fn get_nodes(&mut self, paths: &[String]) -> Result<BTreeMap<String, NodeData>> {
        let mut found = BTreeMap::new();
        match paths {
            [] => return Ok(found),
            [single] => {
                match self.get_node(single).await {
                    Ok(data) => {
                        found.insert(single.clone(), data);
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                return Ok(found);
            }
            _ => {}
        }

        let depth = self.fetch_depth;
        let (mut state, workspace) = self.begin().await?;
        if state.reject_batch_reads {
            return Err(Error::BatchReadRejected("Prefix must not be empty".to_string()));
        }
        state.stats.batch_reads += 1;
        let tree = state.tree(&workspace)?;
        for p in paths {
            if tree.contains_key(p) {
                found.insert(p.clone(), node_json(tree, p, depth));
            }
        }
        Ok(found)
    }

    async fn get_node_path_for_identifier(&mut self, uuid: &str) -> Result<String> {
        let (state, workspace) = self.begin().await?;
        state
            .tree(&workspace)?
            .iter()
            .find(|(_, node)| node.value(JCR_UUID).map_or(false, |v| v.to_jcr_string() == uuid))
            .map(|(p, _)| p.clone())
            .ok_or_else(|| Error::ItemNotFound(format!("no node with uuid {}", uuid)))
    }

    async fn get_binary(&mut self, property_path: &str) -> Result<Vec<Bytes>> {
        let (state, workspace) = self.begin().await?;
        state.binary_values(&workspace, property_path)
    }

    fn binary_source(&self) -> Option<Arc<dyn BinarySource>> {
        let workspace = self.workspace.clone()?;
        Some(Arc::new(MemoryBinarySource {
            state: self.state.clone(),
            workspace,
        }))
    }

    async fn get_references(&mut self, node_path: &str, name: Option<&str>, weak: bool) -> Result<Vec<String>> {
        let (state, workspace) = self.begin().await?;
        let tree = state.tree(&workspace)?;
        let uuid = match require_node(tree, node_path)?.value(JCR_UUID) {
            Some(v) => v.to_jcr_string(),
            None => return Ok(Vec::new()),
        };
        let kind = if weak {
            PropertyType::WeakReference
        } else {
            PropertyType::Reference
        };

        let mut refs = Vec::new();
        for (p, node) in tree {
            for prop in node.properties.values() {
                if prop.kind != kind || name.map_or(false, |n| n != prop.name) {
                    continue;
                }
                if prop.values.iter().any(|v| v.to_jcr_string() == uuid) {
                    refs.push(path::join(p, &prop.name));
                }
            }
        }
        Ok(refs)
    }

    async fn get_namespaces(&mut self) -> Result<BTreeMap<String, String>> {
        let (state, _) = self.begin().await?;
        Ok(state.namespaces.clone())
    }

    async fn get_node_types(&mut self, names: &[String]) -> Result<Vec<NodeTypeInfo>> {
        let (state, _) = self.begin().await?;
        Ok(state
            .node_types
            .values()
            .filter(|t| names.is_empty() || names.contains(&t.name))
            .cloned()
            .collect())
    }

    fn store_node(&mut self, node_path: &str, properties: Vec<PropertySnapshot>) -> Result<()> {
        self.stage(WriteOp::AddNode {
            path: node_path.to_string(),
            properties,
        })
    }

    fn store_property(&mut self, property_path: &str, property: PropertySnapshot) -> Result<()> {
        self.stage(WriteOp::SetProperty {
            path: property_path.to_string(),
            property,
        })
    }

    fn delete_node(&mut self, node_path: &str) -> Result<()> {
        self.stage(WriteOp::RemoveNode {
            path: node_path.to_string(),
        })
    }

    fn delete_property(&mut self, property_path: &str) -> Result<()> {
        self.stage(WriteOp::RemoveProperty {
            path: property_path.to_string(),
        })
    }

    fn move_node(&mut self, src: &str, dst: &str) -> Result<()> {
        self.stage(WriteOp::Move {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    fn reorder_nodes(&mut self, parent: &str, reorders: &[(String, Option<String>)]) -> Result<()> {
        for (child, before) in reorders {
            self.stage(WriteOp::Reorder {
                parent: parent.to_string(),
                child: child.clone(),
                before: before.clone(),
            })?;
        }
        Ok(())
    }

    fn discard_writes(&mut self) {
        self.log.clear();
    }

    async fn finish_save(&mut self) -> Result<()> {
        if self.log.is_empty() {
            return Ok(());
        }
        let ops = self.log.drain();
        let (mut state, workspace) = self.begin().await?;
        state.stats.saves += 1;
        state.last_batch = ops.clone();
        if let Some(message) = state.fail_next_save.take() {
            return Err(Error::Http { status: 500, message });
        }

        let mut tree = state.tree(&workspace)?.clone();
        for op in &ops {
            apply(&mut tree, op)?;
        }
        let events = self.events_for(&ops, &tree);
        state.events.extend(events);
        *state.tree_mut(&workspace)? = tree;
        Ok(())
    }

    async fn copy_node(&mut self, src: &str, dst: &str, src_workspace: Option<&str>) -> Result<()> {
        let (mut state, workspace) = self.begin().await?;
        let source = src_workspace.unwrap_or(&workspace).to_string();
        let copied: Vec<(String, StoredNode)> = {
            let tree = state.tree(&source)?;
            require_node(tree, src)?;
            tree.iter()
                .filter(|(p, _)| path::is_self_or_descendant(p, src))
                .map(|(p, n)| (path::rebase(p, src, dst), n.clone()))
                .collect()
        };

        let tree = state.tree_mut(&workspace)?;
        require_node(tree, path::parent(dst))?;
        if tree.contains_key(dst) {
            return Err(Error::ItemExists(dst.to_string()));
        }
        for (p, mut node) in copied {
            if node.properties.contains_key(JCR_UUID) {
                node.properties.insert(
                    JCR_UUID.to_string(),
                    PropertySnapshot::single(JCR_UUID, Value::String(uuid::Uuid::new_v4().to_string())),
                );
            }
            tree.insert(p, node);
        }
        link_child(tree, dst);
        Ok(())
    }

    async fn move_node_immediately(&mut self, src: &str, dst: &str) -> Result<()> {
        let (mut state, workspace) = self.begin().await?;
        move_subtree(state.tree_mut(&workspace)?, src, dst)
    }

    async fn checkin(&mut self, node_path: &str) -> Result<String> {
        let (mut state, workspace) = self.begin().await?;
        let tree = state.tree_mut(&workspace)?;
        let node = tree
            .get_mut(node_path)
            .ok_or_else(|| Error::ItemNotFound(node_path.to_string()))?;
        if matches!(node.value("jcr:isCheckedOut"), Some(Value::Boolean(false))) {
            return Err(Error::InvalidItemState(format!("{} is already checked in", node_path)));
        }
        node.properties.insert(
            "jcr:isCheckedOut".to_string(),
            PropertySnapshot::single("jcr:isCheckedOut", Value::Boolean(false)),
        );
        let snapshot = node.clone();

        let history = history_path(node_path);
        let versions = state.versions.entry(history.clone()).or_default();
        let name = format!("1.{}", versions.len());
        versions.push(Version {
            name: name.clone(),
            node_path: node_path.to_string(),
            snapshot,
        });
        Ok(path::join(&history, &name))
    }

    async fn checkout(&mut self, node_path: &str) -> Result<()> {
        let (mut state, workspace) = self.begin().await?;
        let node = state
            .tree_mut(&workspace)?
            .get_mut(node_path)
            .ok_or_else(|| Error::ItemNotFound(node_path.to_string()))?;
        node.properties.insert(
            "jcr:isCheckedOut".to_string(),
            PropertySnapshot::single("jcr:isCheckedOut", Value::Boolean(true)),
        );
        Ok(())
    }

    async fn restore(&mut self, _remove_existing: bool, version_path: &str, node_path: &str) -> Result<()> {
        let (mut state, workspace) = self.begin().await?;
        let history = path::parent(version_path);
        let name = path::name(version_path);
        let snapshot = state
            .versions
            .get(history)
            .and_then(|versions| versions.iter().find(|v| v.name == name))
            .filter(|v| v.node_path == node_path)
            .map(|v| v.snapshot.clone())
            .ok_or_else(|| Error::ItemNotFound(format!("no version {} of {}", version_path, node_path)))?;

        let node = state
            .tree_mut(&workspace)?
            .get_mut(node_path)
            .ok_or_else(|| Error::ItemNotFound(node_path.to_string()))?;
        node.properties = snapshot.properties;
        Ok(())
    }

    async fn remove_version(&mut self, history: &str, name: &str) -> Result<()> {
        let (mut state, _) = self.begin().await?;
        let versions = state
            .versions
            .get_mut(history)
            .ok_or_else(|| Error::ItemNotFound(history.to_string()))?;
        let before = versions.len();
        versions.retain(|v| v.name != name);
        if versions.len() == before {
            return Err(Error::ItemNotFound(path::join(history, name)));
        }
        Ok(())
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<RawRow>> {
        let (mut state, _) = self.begin().await?;
        state.last_query = Some(query.clone());
        let offset = query.offset().unwrap_or(0) as usize;
        let limit = query.limit().map_or(usize::MAX, |l| l as usize);
        Ok(state.query_rows.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn lock_node(&mut self, node_path: &str, request: &LockRequest) -> Result<Lock> {
        let owner = request.owner.clone().unwrap_or_else(|| self.user_id.clone());
        let (mut state, workspace) = self.begin().await?;
        require_node(state.tree(&workspace)?, node_path)?;
        let conflict = state.covering_lock(&workspace, node_path).is_some()
            || (request.deep
                && state
                    .locks
                    .keys()
                    .any(|(ws, p)| *ws == workspace && path::is_descendant(p, node_path)));
        if conflict {
            return Err(Error::LockConflict(format!("{} is already locked", node_path)));
        }

        let mut lock = Lock::new(node_path).with_timeout(request.timeout);
        lock.token = Some(format!("opaquelocktoken:{}", uuid::Uuid::new_v4()));
        lock.owner = Some(owner.clone());
        lock.deep = request.deep;
        lock.session_scoped = request.session_scoped;

        if let Some(node) = state.tree_mut(&workspace)?.get_mut(node_path) {
            node.properties.insert(
                "jcr:lockOwner".to_string(),
                PropertySnapshot::single("jcr:lockOwner", Value::String(owner)),
            );
            node.properties.insert(
                "jcr:lockIsDeep".to_string(),
                PropertySnapshot::single("jcr:lockIsDeep", Value::Boolean(request.deep)),
            );
        }
        state.locks.insert((workspace, node_path.to_string()), lock.clone());
        Ok(lock)
    }

    async fn is_locked(&mut self, node_path: &str) -> Result<bool> {
        let (state, workspace) = self.begin().await?;
        Ok(state.covering_lock(&workspace, node_path).is_some())
    }

    async fn unlock(&mut self, node_path: &str, token: &str) -> Result<()> {
        let (mut state, workspace) = self.begin().await?;
        let key = (workspace.clone(), node_path.to_string());
        match state.locks.get(&key) {
            Some(lock) if lock.token.as_deref() == Some(token) => {}
            Some(_) => return Err(Error::LockConflict(format!("wrong lock token for {}", node_path))),
            None => return Err(Error::LockConflict(format!("{} is not locked", node_path))),
        }
        state.locks.remove(&key);
        if let Some(node) = state.tree_mut(&workspace)?.get_mut(node_path) {
            node.properties.remove("jcr:lockOwner");
            node.properties.remove("jcr:lockIsDeep");
        }
        Ok(())
    }

    async fn register_namespace(&mut self, prefix: &str, uri: &str) -> Result<()> {
        let (mut state, _) = self.begin().await?;
        state.namespaces.insert(prefix.to_string(), uri.to_string());
        Ok(())
    }

    async fn register_node_types_cnd(&mut self, cnd: &str, allow_update: bool) -> Result<()> {
        let (mut state, _) = self.begin().await?;
        let types = parse_cnd(cnd)?;
        if !allow_update {
            if let Some(existing) = types.iter().find(|t| state.node_types.contains_key(&t.name)) {
                return Err(Error::ItemExists(format!("node type {}", existing.name)));
            }
        }
        for info in types {
            state.node_types.insert(info.name.clone(), info);
        }
        Ok(())
    }

    async fn get_permissions(&mut self, node_path: &str) -> Result<Vec<String>> {
        let (state, _) = self.begin().await?;
        let granted = state
            .permissions
            .iter()
            .filter(|(p, _)| path::is_self_or_descendant(node_path, p))
            .max_by_key(|(p, _)| path::depth(p))
            .map(|(_, actions)| actions.clone())
            .unwrap_or_else(|| ACTIONS.iter().map(|a| a.to_string()).collect());
        Ok(granted)
    }

    async fn get_event_journal(&mut self) -> Result<Vec<Event>> {
        let (state, _) = self.begin().await?;
        Ok(state.events.clone())
    }

    fn set_user_data(&mut self, data: Option<String>) {
        self.user_data = data;
    }

    async fn create_workspace(&mut self, name: &str, src_workspace: Option<&str>) -> Result<()> {
        if src_workspace.is_some() {
            return Err(Error::unsupported("creating a workspace from a source workspace"));
        }
        let (mut state, _) = self.begin().await?;
        if state.workspaces.contains_key(name) {
            return Err(Error::ItemExists(format!("workspace '{}'", name)));
        }
        state.workspaces.insert(name.to_string(), new_tree());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn logged_in() -> InMemoryTransport {
        let mut transport = InMemoryTransport::new();
        transport
            .login(&Credentials::new("admin", "admin"), DEFAULT_WORKSPACE)
            .await
            .unwrap();
        transport
    }

    #[tokio::test]
    async fn test_seed_and_read_with_depth() {
        let mut transport = logged_in().await;
        transport
            .seed_default(
                "/a",
                json!({"jcr:primaryType": "nt:unstructured", "title": "A", "b": {"n": 3}}),
            )
            .await
            .unwrap();

        let data = transport.get_node("/a").await.unwrap();
        assert_eq!(data["title"], json!("A"));
        assert_eq!(data["b"], json!({}));

        transport.set_fetch_depth(1);
        let data = transport.get_node("/a").await.unwrap();
        assert_eq!(data["b"]["n"], json!(3));
        assert_eq!(transport.stats().await.reads, 2);

        let root = transport.get_node("/").await.unwrap();
        assert!(root.contains_key("a"));
    }

    #[tokio::test]
    async fn test_type_hints_in_read_format() {
        let mut transport = logged_in().await;
        transport.seed_default("/a", json!({})).await.unwrap();
        transport
            .store_property(
                "/a/when",
                PropertySnapshot::single("when", Value::parse("2024-01-02T03:04:05.000+00:00", PropertyType::Date).unwrap()),
            )
            .unwrap();
        transport.finish_save().await.unwrap();
        transport
            .seed_binary("/a/data", vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")], true)
            .await
            .unwrap();

        let data = transport.get_node("/a").await.unwrap();
        assert_eq!(data[":when"], json!("Date"));
        assert_eq!(data[":data"], json!([3, 2]));
        assert!(!data.contains_key("data"));
    }

    #[tokio::test]
    async fn test_finish_save_is_atomic() {
        let mut transport = logged_in().await;
        transport.seed_default("/a", json!({})).await.unwrap();

        transport
            .store_property("/a/x", PropertySnapshot::single("x", Value::from("one")))
            .unwrap();
        transport.delete_node("/missing").unwrap();
        assert!(transport.finish_save().await.is_err());
        assert!(transport.stored_property("/a/x").await.is_none());

        // the log was drained
        transport.finish_save().await.unwrap();
        assert_eq!(transport.stats().await.saves, 1);
    }

    #[tokio::test]
    async fn test_batch_reads() {
        let mut transport = logged_in().await;
        transport.seed_default("/a", json!({})).await.unwrap();
        transport.seed_default("/b", json!({})).await.unwrap();

        let before = transport.stats().await.requests;
        assert!(transport.get_nodes(&[]).await.unwrap().is_empty());
        assert_eq!(transport.stats().await.requests, before);

        let found = transport
            .get_nodes(&["/a".to_string(), "/b".to_string(), "/c".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(transport.stats().await.batch_reads, 1);

        transport.reject_batch_reads(true).await;
        let err = transport
            .get_nodes(&["/a".to_string(), "/b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchReadRejected(_)));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_requests() {
        let mut transport = logged_in().await;
        assert!(transport.login(&Credentials::default(), DEFAULT_WORKSPACE).await.is_err());
        transport.logout().await;
        let err = transport.get_node("/").await.unwrap_err();
        assert!(err.to_string().contains("closed transport"));
    }

    #[test]
    fn test_parse_cnd_headers() {
        let types = parse_cnd(
            "<ex = 'http://example.com'>\n[ex:doc] > nt:unstructured, mix:title orderable\n  - title (string)\n[ex:tag] mixin",
        )
        .unwrap();
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].name, "ex:doc");
        assert_eq!(types[0].supertypes, vec!["nt:unstructured", "mix:title"]);
        assert!(types[0].orderable_child_nodes);
        assert!(types[1].is_mixin);
        assert!(types[1].supertypes.is_empty());
    }
}
