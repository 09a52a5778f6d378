//! Per-session item cache and change tracking.
//!
//! The object manager is the arena every live item of a session lives in,
//! keyed by absolute path, with a uuid → path index. It answers reads from
//! the cache when it can, records pending mutations, and on save replays
//! them into the transport's write log in a fixed order:
//!
//! 1. moves and node deletions, in the order they were made
//! 2. property deletions
//! 3. child reorderings
//! 4. node creations, parents before children
//! 5. property changes on persisted nodes

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::binary::{BinaryStream, SessionKey, SessionRegistry};
use crate::config::SessionOptions;
use crate::error::{Error, Result};
use crate::item::{
    ItemState, Node, Property, JCR_MIXIN_TYPES, JCR_PRIMARY_TYPE, JCR_UUID, MIX_REFERENCEABLE,
    NT_UNSTRUCTURED,
};
use crate::path::{self, ROOT};
use crate::transport::{NodeData, Transport};
use crate::value::{PropertyType, Value};
use crate::write_log::PropertySnapshot;

const PROTECTED_PROPERTIES: [&str; 3] = [JCR_PRIMARY_TYPE, JCR_MIXIN_TYPES, JCR_UUID];

/// A pending move or node deletion. Each is recorded in the paths that were
/// current when it was made, so the log stays valid when replayed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Structural {
    Move { src: String, dst: String },
    Remove(String),
}

/// Session-scoped cache of live items
pub struct ObjectManager {
    transport: Box<dyn Transport>,
    options: SessionOptions,
    registry: SessionRegistry,
    session_key: SessionKey,

    nodes: HashMap<String, Node>,
    identifiers: HashMap<String, String>,
    next_instance: u64,

    /// Paths of unsaved nodes in creation order
    new_nodes: Vec<String>,
    removed_properties: BTreeSet<String>,
    structure: Vec<Structural>,
    /// `(parent, child, before)`
    reorders: Vec<(String, String, Option<String>)>,
}

impl ObjectManager {
    pub fn new(
        transport: Box<dyn Transport>,
        options: SessionOptions,
        registry: SessionRegistry,
        session_key: SessionKey,
    ) -> Self {
        Self {
            transport,
            options,
            registry,
            session_key,
            nodes: HashMap::new(),
            identifiers: HashMap::new(),
            next_instance: 1,
            new_nodes: Vec::new(),
            removed_properties: BTreeSet::new(),
            structure: Vec::new(),
            reorders: Vec::new(),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn set_fetch_depth(&mut self, depth: u32) {
        self.options.fetch_depth = depth;
        self.transport.set_fetch_depth(depth);
    }

    /// True if `path` is currently held in the cache.
    pub fn is_cached(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn cached_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn next_instance(&mut self) -> u64 {
        let id = self.next_instance;
        self.next_instance += 1;
        id
    }

    /// Path of a local node as the server still knows it, or `None` when
    /// the server node there was removed or moved away locally.
    fn server_path(&self, local: &str) -> Option<String> {
        let mut current = local.to_string();
        for change in self.structure.iter().rev() {
            match change {
                Structural::Move { src, dst } => {
                    if path::is_self_or_descendant(&current, dst) {
                        current = path::rebase(&current, dst, src);
                    } else if path::is_self_or_descendant(&current, src) {
                        return None;
                    }
                }
                Structural::Remove(removed) => {
                    if path::is_self_or_descendant(&current, removed) {
                        return None;
                    }
                }
            }
        }
        Some(current)
    }

    /// Where a server path ends up after the structural changes from `from`
    /// on have been applied.
    fn follow(&self, remote: &str, from: usize) -> Option<String> {
        let mut current = remote.to_string();
        for change in self.structure.iter().skip(from) {
            match change {
                Structural::Move { src, dst } => {
                    if path::is_self_or_descendant(&current, src) {
                        current = path::rebase(&current, src, dst);
                    }
                }
                Structural::Remove(removed) => {
                    if path::is_self_or_descendant(&current, removed) {
                        return None;
                    }
                }
            }
        }
        Some(current)
    }

    /// True if the server child `name` of `remote` is still the node at
    /// `name` below `local`.
    fn is_server_child(&self, local: &str, remote: &str, name: &str) -> bool {
        self.server_path(&path::join(local, name)).as_deref() == Some(path::join(remote, name).as_str())
    }

    /// Names of children of `parent` that exist only in this session:
    /// unsaved nodes and move destinations.
    fn arrived_children(&self, parent: &str) -> Vec<String> {
        let moved_in = self
            .structure
            .iter()
            .enumerate()
            .filter_map(|(i, change)| match change {
                Structural::Move { dst, .. } => self.follow(dst, i + 1),
                Structural::Remove(_) => None,
            });
        let mut names: Vec<String> = Vec::new();
        for p in self.new_nodes.iter().cloned().chain(moved_in) {
            if path::parent(&p) != parent {
                continue;
            }
            let name = path::name(&p).to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Child list of the node at `local` as the session sees it: server
    /// children still in place, then those added or moved in locally.
    fn visible_children(&self, local: &str, remote: &str, server_children: &[String]) -> Vec<String> {
        let mut names: Vec<String> = server_children
            .iter()
            .filter(|c| self.is_server_child(local, remote, c))
            .cloned()
            .collect();
        for name in self.arrived_children(local) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    // ---- reads ----

    pub async fn node(&mut self, path: &str) -> Result<&Node> {
        let path = path::normalize(path)?;
        if !self.nodes.contains_key(&path) {
            let remote = self
                .server_path(&path)
                .ok_or_else(|| Error::PathNotFound(path.clone()))?;
            self.fetch(&path, &remote).await?;
        }
        self.nodes.get(&path).ok_or_else(|| Error::PathNotFound(path.clone()))
    }

    async fn fetch(&mut self, local: &str, remote: &str) -> Result<()> {
        tracing::debug!("Cache miss for {}", local);
        let data = match self.transport.get_node(remote).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Err(Error::PathNotFound(local.to_string())),
            Err(e) => return Err(e),
        };
        self.cache_data(local, remote, &data)
    }

    /// Cache server data read from `remote` as the node at `local`, with
    /// pending structural changes applied to its child list.
    fn cache_data(&mut self, local: &str, remote: &str, data: &NodeData) -> Result<()> {
        let instance = self.next_instance();
        let (mut node, nested) = Node::from_data(local, data, instance)?;
        let children = self.visible_children(local, remote, node.child_names());
        *node.children_mut() = children;
        if let Some(uuid) = node.identifier() {
            self.identifiers.insert(uuid.to_string(), local.to_string());
        }
        self.nodes.insert(local.to_string(), node);

        for (child_path, child_data) in nested {
            let name = path::name(&child_path).to_string();
            if !self.nodes.contains_key(&child_path) && self.is_server_child(local, remote, &name) {
                let child_remote = path::join(remote, &name);
                self.cache_data(&child_path, &child_remote, &child_data)?;
            }
        }
        Ok(())
    }

    /// Fetch several nodes in one batched read, falling back to single reads
    /// when the server rejects the batch.
    async fn fetch_many(&mut self, paths: &[String]) -> Result<BTreeMap<String, NodeData>> {
        match self.transport.get_nodes(paths).await {
            Ok(found) => Ok(found),
            Err(Error::BatchReadRejected(reason)) => {
                tracing::warn!("Batched read rejected ({}), reading {} nodes one by one", reason, paths.len());
                let mut found = BTreeMap::new();
                for path in paths {
                    match self.transport.get_node(path).await {
                        Ok(data) => {
                            found.insert(path.clone(), data);
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }

    /// Nodes at `paths` that exist, in request order. Cached nodes are served
    /// locally; the rest are read in one batch.
    pub async fn nodes(&mut self, paths: &[String]) -> Result<Vec<&Node>> {
        let mut wanted = Vec::with_capacity(paths.len());
        for p in paths {
            wanted.push(path::normalize(p)?);
        }

        let mut missing: Vec<(String, String)> = Vec::new();
        for p in &wanted {
            if self.nodes.contains_key(p) || missing.iter().any(|(local, _)| local == p) {
                continue;
            }
            if let Some(remote) = self.server_path(p) {
                missing.push((p.clone(), remote));
            }
        }

        if !missing.is_empty() {
            let remotes: Vec<String> = missing.iter().map(|(_, remote)| remote.clone()).collect();
            let found = self.fetch_many(&remotes).await?;
            for (local, remote) in &missing {
                if let Some(data) = found.get(remote) {
                    if !self.nodes.contains_key(local) {
                        self.cache_data(local, remote, data)?;
                    }
                }
            }
        }

        Ok(wanted.iter().filter_map(|p| self.nodes.get(p)).collect())
    }

    pub async fn node_by_identifier(&mut self, uuid: &str) -> Result<&Node> {
        let path = match self.identifiers.get(uuid) {
            Some(path) => path.clone(),
            None => match self.transport.get_node_path_for_identifier(uuid).await {
                Ok(remote) => self
                    .follow(&remote, 0)
                    .ok_or_else(|| Error::ItemNotFound(uuid.to_string()))?,
                Err(e) if e.is_not_found() => return Err(Error::ItemNotFound(uuid.to_string())),
                Err(e) => return Err(e),
            },
        };
        self.node(&path).await
    }

    pub async fn property(&mut self, path: &str) -> Result<&Property> {
        let path = path::normalize(path)?;
        if path == ROOT {
            return Err(Error::PathNotFound(path));
        }
        let name = path::name(&path).to_string();
        let node = match self.node(path::parent(&path)).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Err(Error::PathNotFound(path)),
            Err(e) => return Err(e),
        };
        node.property(&name).ok_or_else(|| Error::PathNotFound(path.clone()))
    }

    pub async fn node_exists(&mut self, path: &str) -> Result<bool> {
        match self.node(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn property_exists(&mut self, path: &str) -> Result<bool> {
        match self.property(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read handles for the values of the binary property at `path`.
    pub async fn binary(&mut self, path: &str) -> Result<Vec<BinaryStream>> {
        let path = path::normalize(path)?;
        let parent = path::parent(&path).to_string();
        let name = path::name(&path).to_string();
        self.property(&path).await?;

        let eager = self.options.eager_binaries;
        let needs_fetch = self
            .nodes
            .get(&parent)
            .and_then(|n| n.property(&name))
            .map_or(false, |p| !p.is_loaded());
        if needs_fetch && eager {
            let values = self.transport.get_binary(&path).await?;
            if let Some(prop) = self.nodes.get_mut(&parent).and_then(|n| n.property_mut(&name)) {
                prop.fill_binary(values);
            }
        }

        let prop = self
            .nodes
            .get_mut(&parent)
            .and_then(|n| n.property_mut(&name))
            .ok_or_else(|| Error::PathNotFound(path.clone()))?;

        let (streams, guard) = if prop.is_loaded() {
            let bytes = prop
                .raw_values()
                .iter()
                .map(|v| match v {
                    Value::Binary(b) => b.clone(),
                    other => Bytes::from(other.to_jcr_string()),
                })
                .collect();
            BinaryStream::loaded(bytes)
        } else {
            let count = prop.lengths().len();
            BinaryStream::deferred(&self.registry, &self.session_key, &path, count)
        };
        prop.hold_streams(guard);
        Ok(streams)
    }

    pub async fn references(&mut self, path: &str, name: Option<&str>, weak: bool) -> Result<Vec<String>> {
        let path = path::normalize(path)?;
        self.node(&path).await?;
        self.transport.get_references(&path, name, weak).await
    }

    // ---- mutations ----

    /// Flip `path` and its cached ancestors from clean to modified.
    fn mark_modified(&mut self, path: &str) {
        let mut chain = vec![path.to_string()];
        chain.extend(path::ancestors(path).into_iter().map(str::to_string));
        for p in chain {
            if let Some(node) = self.nodes.get_mut(&p) {
                if node.state() == ItemState::Clean {
                    node.set_state(ItemState::Modified);
                }
            }
        }
    }

    pub async fn add_node(&mut self, parent: &str, name: &str, primary_type: Option<&str>) -> Result<&Node> {
        let parent = path::normalize(parent)?;
        path::validate_name(name)?;
        let child = path::join(&parent, name);

        let parent_node = self.node(&parent).await?;
        if parent_node.has_node(name) || parent_node.has_property(name) {
            return Err(Error::ItemExists(child));
        }

        let instance = self.next_instance();
        let node = Node::new_local(&child, instance, primary_type.unwrap_or(NT_UNSTRUCTURED));
        self.nodes.insert(child.clone(), node);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children_mut().push(name.to_string());
        }
        self.mark_modified(&parent);
        self.new_nodes.push(child.clone());
        tracing::debug!("Added node {}", child);

        self.nodes.get(&child).ok_or_else(|| Error::PathNotFound(child.clone()))
    }

    /// Set a property, converting every value to `kind` (or to the type of
    /// the first value).
    pub async fn set_property(
        &mut self,
        node_path: &str,
        name: &str,
        values: Vec<Value>,
        multiple: bool,
        kind: Option<PropertyType>,
    ) -> Result<&Property> {
        if PROTECTED_PROPERTIES.contains(&name) {
            return Err(Error::InvalidItemState(format!("{} is a protected property", name)));
        }
        self.write_property(node_path, name, values, multiple, kind).await
    }

    async fn write_property(
        &mut self,
        node_path: &str,
        name: &str,
        values: Vec<Value>,
        multiple: bool,
        kind: Option<PropertyType>,
    ) -> Result<&Property> {
        let node_path = path::normalize(node_path)?;
        path::validate_name(name)?;
        if !multiple && values.len() != 1 {
            return Err(Error::ValueFormat(format!(
                "single-valued property {} needs exactly one value",
                name
            )));
        }

        self.node(&node_path).await?;
        let node = self
            .nodes
            .get_mut(&node_path)
            .ok_or_else(|| Error::PathNotFound(node_path.clone()))?;

        let kind = kind
            .or_else(|| values.first().map(Value::kind))
            .or_else(|| node.property(name).map(Property::kind))
            .unwrap_or(PropertyType::String);
        let converted = values
            .iter()
            .map(|v| v.convert(kind))
            .collect::<Result<Vec<_>>>()?;

        let changed = match node.property_mut(name) {
            Some(prop) => {
                if prop.state() != ItemState::New && prop.is_multiple() != multiple {
                    return Err(Error::ValueFormat(format!(
                        "cannot change the multiplicity of {}",
                        prop.path()
                    )));
                }
                let same = prop.is_loaded()
                    && prop.kind() == kind
                    && prop.is_multiple() == multiple
                    && prop.raw_values() == converted.as_slice();
                if !same {
                    prop.replace(kind, multiple, converted);
                    if prop.state() == ItemState::Clean {
                        prop.set_state(ItemState::Modified);
                    }
                }
                !same
            }
            None => {
                node.insert_property(Property::new(&node_path, name, kind, multiple, converted, ItemState::New));
                true
            }
        };

        if changed {
            node.sync_from_property(name);
            self.removed_properties.remove(&path::join(&node_path, name));
            self.mark_modified(&node_path);
        }

        self.nodes
            .get(&node_path)
            .and_then(|n| n.property(name))
            .ok_or_else(|| Error::PathNotFound(path::join(&node_path, name)))
    }

    /// Add a mixin type. A new node becoming `mix:referenceable` gets a
    /// generated `jcr:uuid`.
    pub async fn add_mixin(&mut self, path: &str, mixin: &str) -> Result<()> {
        let path = path::normalize(path)?;
        let node = self.node(&path).await?;
        if node.has_mixin(mixin) {
            return Ok(());
        }
        let needs_uuid = mixin == MIX_REFERENCEABLE && node.identifier().is_none() && node.is_new();
        let mut mixins: Vec<Value> = node.mixin_types().iter().map(|m| Value::Name(m.clone())).collect();
        mixins.push(Value::Name(mixin.to_string()));

        self.write_property(&path, JCR_MIXIN_TYPES, mixins, true, Some(PropertyType::Name))
            .await?;

        if needs_uuid {
            let uuid = uuid::Uuid::new_v4().to_string();
            self.write_property(&path, JCR_UUID, vec![Value::String(uuid.clone())], false, None)
                .await?;
            self.identifiers.insert(uuid, path);
        }
        Ok(())
    }

    /// Remove the node or property at `path`.
    pub async fn remove_item(&mut self, path: &str) -> Result<()> {
        let path = path::normalize(path)?;
        if path == ROOT {
            return Err(Error::InvalidItemState("cannot remove the root node".to_string()));
        }
        if self.node_exists(&path).await? {
            self.remove_node(&path);
            Ok(())
        } else if self.property_exists(&path).await? {
            self.remove_property(&path)
        } else {
            Err(Error::PathNotFound(path))
        }
    }

    fn remove_node(&mut self, path: &str) {
        let was_new = self.nodes.get(path).map_or(false, Node::is_new);

        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| path::is_self_or_descendant(p, path))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(mut node) = self.nodes.remove(&p) {
                node.set_state(ItemState::Deleted);
            }
        }
        self.identifiers.retain(|_, p| !path::is_self_or_descendant(p, path));
        self.new_nodes.retain(|p| !path::is_self_or_descendant(p, path));
        self.removed_properties.retain(|p| !path::is_descendant(p, path));
        if !was_new {
            self.structure.push(Structural::Remove(path.to_string()));
        }

        let parent = path::parent(path).to_string();
        let name = path::name(path).to_string();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children_mut().retain(|c| c != &name);
        }
        self.reorders.retain(|(p, _, _)| !path::is_self_or_descendant(p, path));
        self.forget_reorders_of(&parent, &name);
        self.mark_modified(&parent);
        tracing::debug!("Removed node {}", path);
    }

    fn remove_property(&mut self, path: &str) -> Result<()> {
        let parent = path::parent(path).to_string();
        let name = path::name(path).to_string();
        if PROTECTED_PROPERTIES.contains(&name.as_str()) {
            return Err(Error::InvalidItemState(format!("{} is a protected property", name)));
        }

        let node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        let mut property = node
            .take_property(&name)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        if !property.is_new() {
            self.removed_properties.insert(path.to_string());
        }
        property.set_state(ItemState::Deleted);
        self.mark_modified(&parent);
        Ok(())
    }

    /// Move a node; the destination must not exist, its parent must.
    pub async fn move_node(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        if src == ROOT || dst == ROOT {
            return Err(Error::InvalidPath("cannot move the root node".to_string()));
        }
        if path::is_self_or_descendant(&dst, &src) {
            return Err(Error::InvalidPath(format!("cannot move {} below itself", src)));
        }

        let src_new = self.node(&src).await?.is_new();
        let dst_parent = path::parent(&dst).to_string();
        let dst_name = path::name(&dst).to_string();
        let target = self.node(&dst_parent).await?;
        if target.has_node(&dst_name) || target.has_property(&dst_name) {
            return Err(Error::ItemExists(dst));
        }

        self.rebase_all(&src, &dst);

        let src_parent = path::parent(&src).to_string();
        let src_name = path::name(&src).to_string();
        if let Some(node) = self.nodes.get_mut(&src_parent) {
            node.children_mut().retain(|c| c != &src_name);
        }
        if let Some(node) = self.nodes.get_mut(&dst_parent) {
            node.children_mut().push(dst_name);
        }
        self.forget_reorders_of(&src_parent, &src_name);
        if !src_new {
            self.structure.push(Structural::Move {
                src: src.clone(),
                dst: dst.clone(),
            });
        }
        self.mark_modified(&src_parent);
        self.mark_modified(&dst_parent);
        tracing::debug!("Moved {} to {}", src, dst);
        Ok(())
    }

    /// Rewrite every cached and pending path below `src` to below `dst`.
    fn rebase_all(&mut self, src: &str, dst: &str) {
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| path::is_self_or_descendant(p, src))
            .cloned()
            .collect();
        for old in moved {
            if let Some(mut node) = self.nodes.remove(&old) {
                let new_path = path::rebase(&old, src, dst);
                node.rebase(&new_path);
                self.nodes.insert(new_path, node);
            }
        }

        let rebase = |p: &String| {
            if path::is_self_or_descendant(p, src) {
                path::rebase(p, src, dst)
            } else {
                p.clone()
            }
        };
        for p in self.identifiers.values_mut() {
            *p = rebase(&*p);
        }
        self.new_nodes = self.new_nodes.iter().map(rebase).collect();
        self.removed_properties = self.removed_properties.iter().map(rebase).collect();
        for (parent, _, _) in self.reorders.iter_mut() {
            *parent = rebase(&*parent);
        }
    }

    /// Forget reorderings that name `name` among the children of `parent`.
    fn forget_reorders_of(&mut self, parent: &str, name: &str) {
        self.reorders
            .retain(|(p, child, before)| !(p == parent && (child == name || before.as_deref() == Some(name))));
    }

    /// Place `child` before `before` (or last) among the children of `parent`.
    pub async fn order_before(&mut self, parent: &str, child: &str, before: Option<&str>) -> Result<()> {
        let parent = path::normalize(parent)?;
        let node = self.node(&parent).await?;
        if !node.has_node(child) {
            return Err(Error::PathNotFound(path::join(&parent, child)));
        }
        if let Some(before) = before {
            if !node.has_node(before) {
                return Err(Error::PathNotFound(path::join(&parent, before)));
            }
            if before == child {
                return Ok(());
            }
        }
        let parent_new = node.is_new();

        if let Some(node) = self.nodes.get_mut(&parent) {
            let children = node.children_mut();
            children.retain(|c| c != child);
            match before.and_then(|b| children.iter().position(|c| c == b)) {
                Some(pos) => children.insert(pos, child.to_string()),
                None => children.push(child.to_string()),
            }
        }
        if !parent_new {
            self.reorders
                .push((parent.clone(), child.to_string(), before.map(str::to_string)));
        }
        self.mark_modified(&parent);
        Ok(())
    }

    // ---- save / refresh ----

    pub fn has_pending_changes(&self) -> bool {
        !self.structure.is_empty()
            || !self.removed_properties.is_empty()
            || !self.reorders.is_empty()
            || !self.new_nodes.is_empty()
            || self.nodes.values().any(|n| n.state() != ItemState::Clean)
    }

    /// True if anything at or below `path` has unsaved changes.
    pub fn has_pending_changes_under(&self, path: &str) -> bool {
        let under = |p: &String| path::is_self_or_descendant(p, path);
        let structural = self.structure.iter().any(|change| match change {
            Structural::Move { src, dst } => under(src) || under(dst),
            Structural::Remove(removed) => under(removed),
        });
        structural
            || self.removed_properties.iter().any(under)
            || self.reorders.iter().any(|(p, _, _)| under(p))
            || self
                .nodes
                .iter()
                .any(|(p, n)| under(p) && n.state() != ItemState::Clean)
    }

    /// Persist all pending changes. On failure no item is marked clean and
    /// nothing pending is forgotten, so the save can be retried.
    pub async fn save(&mut self) -> Result<()> {
        if !self.has_pending_changes() {
            tracing::debug!("Nothing to save");
            return Ok(());
        }

        if let Err(e) = self.stage_writes() {
            self.transport.discard_writes();
            return Err(e);
        }
        self.transport.finish_save().await?;
        self.commit();
        Ok(())
    }

    fn stage_writes(&mut self) -> Result<()> {
        let transport = self.transport.as_mut();

        for change in &self.structure {
            match change {
                Structural::Move { src, dst } => transport.move_node(src, dst)?,
                Structural::Remove(p) => transport.delete_node(p)?,
            }
        }
        for p in &self.removed_properties {
            transport.delete_property(p)?;
        }

        let mut grouped: Vec<(&str, Vec<(String, Option<String>)>)> = Vec::new();
        for (parent, child, before) in &self.reorders {
            match grouped.iter_mut().find(|(p, _)| *p == parent.as_str()) {
                Some((_, batch)) => batch.push((child.clone(), before.clone())),
                None => grouped.push((parent.as_str(), vec![(child.clone(), before.clone())])),
            }
        }
        for (parent, batch) in &grouped {
            transport.reorder_nodes(parent, batch)?;
        }

        let mut created: Vec<&String> = self
            .new_nodes
            .iter()
            .filter(|p| self.nodes.get(*p).map_or(false, Node::is_new))
            .collect();
        created.sort_by_key(|p| path::depth(p));
        for p in created {
            if let Some(node) = self.nodes.get(p) {
                let properties: Vec<PropertySnapshot> = node.properties().map(Property::snapshot).collect();
                transport.store_node(p, properties)?;
            }
        }

        let mut modified: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.state() == ItemState::Modified)
            .collect();
        modified.sort_by(|a, b| a.path().cmp(b.path()));
        for node in modified {
            for prop in node.properties() {
                if matches!(prop.state(), ItemState::New | ItemState::Modified) {
                    transport.store_property(prop.path(), prop.snapshot())?;
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self) {
        let mut count = 0usize;
        for node in self.nodes.values_mut() {
            if matches!(node.state(), ItemState::New | ItemState::Modified) {
                node.set_state(ItemState::Clean);
                count += 1;
            }
            for prop in node.properties_mut() {
                if matches!(prop.state(), ItemState::New | ItemState::Modified) {
                    prop.set_state(ItemState::Clean);
                }
            }
        }
        self.forget_pending();
        tracing::info!("Saved changes to {} nodes", count);
    }

    fn forget_pending(&mut self) {
        self.new_nodes.clear();
        self.removed_properties.clear();
        self.structure.clear();
        self.reorders.clear();
    }

    /// Re-read every cached persisted node. Without `keep_changes` all local
    /// changes are dropped; with it they are reapplied on top of the fresh
    /// server state.
    pub async fn refresh(&mut self, keep_changes: bool) -> Result<()> {
        if !keep_changes {
            self.transport.discard_writes();
            self.forget_pending();
            self.nodes.retain(|_, n| !n.is_new());
            self.identifiers.clear();
        }

        let mut local: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_new())
            .map(|(p, _)| p.clone())
            .collect();
        local.sort();
        if local.is_empty() {
            return Ok(());
        }

        let mut targets: Vec<(String, String)> = Vec::with_capacity(local.len());
        for p in local {
            match self.server_path(&p) {
                Some(remote) => targets.push((p, remote)),
                None => self.evict(&p),
            }
        }
        let remote: Vec<String> = targets.iter().map(|(_, r)| r.clone()).collect();
        let fresh = self.fetch_many(&remote).await?;

        for (local_path, remote_path) in &targets {
            match fresh.get(remote_path) {
                Some(data) => self.refresh_node(local_path, remote_path, data, keep_changes)?,
                None => self.evict(local_path),
            }
        }
        tracing::debug!("Refreshed {} nodes (keep changes: {})", targets.len(), keep_changes);
        Ok(())
    }

    fn refresh_node(&mut self, local: &str, remote: &str, data: &NodeData, keep_changes: bool) -> Result<()> {
        let old = match self.nodes.remove(local) {
            Some(node) => node,
            None => return Ok(()),
        };
        let (mut fresh, _) = Node::from_data(local, data, old.instance_id())?;
        let server_children = fresh.child_names().to_vec();
        let keep_local = keep_changes && old.state() == ItemState::Modified;

        if keep_local {
            for prop in old.properties() {
                if matches!(prop.state(), ItemState::New | ItemState::Modified) {
                    fresh.insert_property(prop.clone());
                }
            }
            for removed in &self.removed_properties {
                if path::parent(removed) == local {
                    fresh.take_property(path::name(removed));
                }
            }
            fresh.set_state(ItemState::Modified);
        }

        let visible = self.visible_children(local, remote, &server_children);
        let children = if keep_local {
            // keep the local order, then append what the server added
            let mut merged: Vec<String> = old
                .child_names()
                .iter()
                .filter(|c| visible.contains(c))
                .cloned()
                .collect();
            for child in visible {
                if !merged.contains(&child) {
                    merged.push(child);
                }
            }
            merged
        } else {
            visible
        };
        *fresh.children_mut() = children;

        if let Some(uuid) = fresh.identifier() {
            self.identifiers.insert(uuid.to_string(), local.to_string());
        }
        self.nodes.insert(local.to_string(), fresh);
        Ok(())
    }

    fn evict(&mut self, path: &str) {
        if let Some(mut node) = self.nodes.remove(path) {
            node.set_state(ItemState::Deleted);
            if let Some(uuid) = node.identifier() {
                self.identifiers.remove(uuid);
            }
        }
    }

    /// Re-read one cached node in place, dropping its local changes. Used
    /// after server-side operations that change node state directly.
    pub(crate) async fn reload(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Ok(());
        }
        let remote = match self.server_path(path) {
            Some(remote) => remote,
            None => {
                self.evict(path);
                return Ok(());
            }
        };
        match self.transport.get_node(&remote).await {
            Ok(data) => self.refresh_node(path, &remote, &data, false),
            Err(e) if e.is_not_found() => {
                self.evict(path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop a cached subtree without recording a deletion, e.g. after a
    /// server-side change made outside the write log.
    pub(crate) fn evict_subtree(&mut self, path: &str) {
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| path::is_self_or_descendant(p, path))
            .cloned()
            .collect();
        for p in doomed {
            self.evict(&p);
        }
    }

    /// Update a cached parent's child list after an immediate workspace
    /// operation.
    pub(crate) fn note_child(&mut self, path: &str, present: bool) {
        let parent = path::parent(path).to_string();
        let name = path::name(path).to_string();
        if let Some(node) = self.nodes.get_mut(&parent) {
            let children = node.children_mut();
            children.retain(|c| c != &name);
            if present {
                children.push(name);
            }
        }
    }

    /// Evict everything and forget pending changes.
    pub fn clear(&mut self) {
        self.transport.discard_writes();
        self.forget_pending();
        self.nodes.clear();
        self.identifiers.clear();
    }
}
