//! Sessions.
//!
//! A [`Session`] is one login to one workspace. It owns the object manager
//! (and through it the transport), the namespace and node type caches and
//! the lock manager. Changes are buffered locally until [`Session::save`].

use tracing::{debug, info};

use crate::binary::{BinaryStream, SessionKey, SessionRegistry};
use crate::config::SessionOptions;
use crate::error::{Error, Result};
use crate::item::{Node, Property};
use crate::lock::{Lock, LockManager};
use crate::namespace::NamespaceRegistry;
use crate::node_type::{NodeTypeDirectory, NodeTypeInfo};
use crate::object_manager::ObjectManager;
use crate::observation::{EventFilter, EventJournal};
use crate::path::{self, ROOT};
use crate::query::{Query, QueryObjectModel, QueryResult};
use crate::transport::{Capabilities, Credentials, Descriptors, LockRequest, Transport};
use crate::value::{PropertyType, Value};

/// Actions understood by [`Session::has_permission`].
pub const ACTIONS: [&str; 4] = ["add_node", "read", "remove", "set_property"];

/// A logged in repository session
pub struct Session {
    key: SessionKey,
    user_id: String,
    workspace: String,
    capabilities: Capabilities,
    objects: ObjectManager,
    namespaces: NamespaceRegistry,
    node_types: NodeTypeDirectory,
    locks: LockManager,
    registry: SessionRegistry,
    live: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("user_id", &self.user_id)
            .field("workspace", &self.workspace)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Log `transport` in to `workspace` and wrap it in a session. The
    /// transport's binary source is registered under a fresh session key.
    pub async fn login(
        mut transport: Box<dyn Transport>,
        credentials: &Credentials,
        workspace: &str,
        options: SessionOptions,
        registry: &SessionRegistry,
    ) -> Result<Session> {
        transport.login(credentials, workspace).await?;
        transport.set_fetch_depth(options.fetch_depth);
        let capabilities = transport.capabilities();

        let key = SessionKey::generate();
        if let Some(source) = transport.binary_source() {
            registry.register(key.clone(), source);
        }
        info!("Logged in as '{}' to workspace '{}'", credentials.user_id, workspace);

        Ok(Session {
            objects: ObjectManager::new(transport, options, registry.clone(), key.clone()),
            key,
            user_id: credentials.user_id.clone(),
            workspace: workspace.to_string(),
            capabilities,
            namespaces: NamespaceRegistry::new(),
            node_types: NodeTypeDirectory::new(),
            locks: LockManager::new(),
            registry: registry.clone(),
            live: true,
        })
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.live {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    pub(crate) fn objects(&mut self) -> &mut ObjectManager {
        &mut self.objects
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace_name(&self) -> &str {
        &self.workspace
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn options(&self) -> &SessionOptions {
        self.objects.options()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub async fn repository_descriptors(&mut self) -> Result<Descriptors> {
        self.ensure_live()?;
        self.objects.transport_mut().repository_descriptors().await
    }

    /// Levels of children fetched along with every node read.
    pub fn set_fetch_depth(&mut self, depth: u32) -> Result<()> {
        self.ensure_live()?;
        self.objects.set_fetch_depth(depth);
        Ok(())
    }

    /// Attach `data` to the events generated by the next saves.
    pub fn set_user_data(&mut self, data: Option<String>) -> Result<()> {
        self.ensure_live()?;
        self.objects.transport_mut().set_user_data(data);
        Ok(())
    }

    // ---- reading ----

    pub async fn root_node(&mut self) -> Result<&Node> {
        self.node(ROOT).await
    }

    pub async fn node(&mut self, path: &str) -> Result<&Node> {
        self.ensure_live()?;
        self.objects.node(path).await
    }

    /// Nodes at `paths` that exist, in request order.
    pub async fn nodes(&mut self, paths: &[String]) -> Result<Vec<&Node>> {
        self.ensure_live()?;
        self.objects.nodes(paths).await
    }

    pub async fn node_by_identifier(&mut self, uuid: &str) -> Result<&Node> {
        self.ensure_live()?;
        self.objects.node_by_identifier(uuid).await
    }

    pub async fn property(&mut self, path: &str) -> Result<&Property> {
        self.ensure_live()?;
        self.objects.property(path).await
    }

    pub async fn item_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.node_exists(path).await? || self.property_exists(path).await?)
    }

    pub async fn node_exists(&mut self, path: &str) -> Result<bool> {
        self.ensure_live()?;
        self.objects.node_exists(path).await
    }

    pub async fn property_exists(&mut self, path: &str) -> Result<bool> {
        self.ensure_live()?;
        self.objects.property_exists(path).await
    }

    /// Read handles for every value of a binary property.
    pub async fn binary(&mut self, path: &str) -> Result<Vec<BinaryStream>> {
        self.ensure_live()?;
        self.objects.binary(path).await
    }

    /// Paths of reference properties pointing at the node, optionally only
    /// those named `name`.
    pub async fn references(&mut self, path: &str, name: Option<&str>) -> Result<Vec<String>> {
        self.ensure_live()?;
        self.objects.references(path, name, false).await
    }

    pub async fn weak_references(&mut self, path: &str, name: Option<&str>) -> Result<Vec<String>> {
        self.ensure_live()?;
        self.objects.references(path, name, true).await
    }

    // ---- writing ----

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.writing, "writing")
    }

    pub async fn add_node(&mut self, parent: &str, name: &str, primary_type: Option<&str>) -> Result<&Node> {
        self.ensure_writable()?;
        self.objects.add_node(parent, name, primary_type).await
    }

    /// Set a single-valued property; the type follows the value.
    pub async fn set_property(&mut self, node: &str, name: &str, value: impl Into<Value>) -> Result<&Property> {
        self.ensure_writable()?;
        self.objects
            .set_property(node, name, vec![value.into()], false, None)
            .await
    }

    /// Set a multi-valued property.
    pub async fn set_property_values(
        &mut self,
        node: &str,
        name: &str,
        values: Vec<Value>,
        kind: Option<PropertyType>,
    ) -> Result<&Property> {
        self.ensure_writable()?;
        self.objects.set_property(node, name, values, true, kind).await
    }

    /// Set a single-valued property, converting the value to `kind`.
    pub async fn set_property_typed(
        &mut self,
        node: &str,
        name: &str,
        value: Value,
        kind: PropertyType,
    ) -> Result<&Property> {
        self.ensure_writable()?;
        self.objects
            .set_property(node, name, vec![value], false, Some(kind))
            .await
    }

    /// Remove a node (with its subtree) or a property.
    pub async fn remove_item(&mut self, path: &str) -> Result<()> {
        self.ensure_writable()?;
        self.objects.remove_item(path).await
    }

    pub async fn move_item(&mut self, src: &str, dst: &str) -> Result<()> {
        self.ensure_writable()?;
        self.objects.move_node(src, dst).await
    }

    /// Place `child` before `before` among the children of `parent`, or last.
    pub async fn order_before(&mut self, parent: &str, child: &str, before: Option<&str>) -> Result<()> {
        self.ensure_writable()?;
        self.objects.order_before(parent, child, before).await
    }

    pub async fn add_mixin(&mut self, path: &str, mixin: &str) -> Result<()> {
        self.ensure_writable()?;
        self.objects.add_mixin(path, mixin).await
    }

    pub async fn save(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.objects.save().await
    }

    pub async fn refresh(&mut self, keep_changes: bool) -> Result<()> {
        self.ensure_live()?;
        self.objects.refresh(keep_changes).await
    }

    pub fn has_pending_changes(&self) -> Result<bool> {
        self.ensure_live()?;
        Ok(self.objects.has_pending_changes())
    }

    // ---- permissions ----

    /// Whether the user may perform every comma separated action at `path`.
    pub async fn has_permission(&mut self, path: &str, actions: &str) -> Result<bool> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.permissions, "permissions")?;
        let path = path::normalize(path)?;

        let mut wanted = Vec::new();
        for action in actions.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if !ACTIONS.contains(&action) {
                return Err(Error::protocol(format!("unknown action '{}'", action)));
            }
            wanted.push(action);
        }

        let granted = self.objects.transport_mut().get_permissions(&path).await?;
        Ok(wanted.iter().all(|a| granted.iter().any(|g| g == a)))
    }

    pub async fn check_permission(&mut self, path: &str, actions: &str) -> Result<()> {
        if self.has_permission(path, actions).await? {
            Ok(())
        } else {
            Err(Error::AccessDenied(format!("'{}' not permitted on {}", actions, path)))
        }
    }

    // ---- namespaces ----

    pub async fn namespace_prefixes(&mut self) -> Result<Vec<String>> {
        self.ensure_live()?;
        self.namespaces.prefixes(self.objects.transport_mut()).await
    }

    pub async fn namespace_uris(&mut self) -> Result<Vec<String>> {
        self.ensure_live()?;
        self.namespaces.uris(self.objects.transport_mut()).await
    }

    pub async fn namespace_uri(&mut self, prefix: &str) -> Result<String> {
        self.ensure_live()?;
        self.namespaces.uri(self.objects.transport_mut(), prefix).await
    }

    pub async fn namespace_prefix(&mut self, uri: &str) -> Result<String> {
        self.ensure_live()?;
        self.namespaces.prefix(self.objects.transport_mut(), uri).await
    }

    pub async fn register_namespace(&mut self, prefix: &str, uri: &str) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.namespace_management, "namespace management")?;
        self.namespaces
            .register(self.objects.transport_mut(), prefix, uri)
            .await
    }

    pub async fn unregister_namespace(&mut self, prefix: &str) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.namespace_management, "namespace management")?;
        self.namespaces.unregister(self.objects.transport_mut(), prefix).await
    }

    // ---- node types ----

    pub async fn node_type(&mut self, name: &str) -> Result<NodeTypeInfo> {
        self.ensure_live()?;
        self.node_types.get(self.objects.transport_mut(), name).await
    }

    pub async fn node_types(&mut self) -> Result<Vec<NodeTypeInfo>> {
        self.ensure_live()?;
        self.node_types.all(self.objects.transport_mut()).await
    }

    pub async fn has_node_type(&mut self, name: &str) -> Result<bool> {
        self.ensure_live()?;
        self.node_types.has(self.objects.transport_mut(), name).await
    }

    /// Whether the node at `path` is of `node_type`, supertypes included.
    pub async fn is_node_type(&mut self, path: &str, node_type: &str) -> Result<bool> {
        self.ensure_live()?;
        let node = self.objects.node(path).await?;
        let primary = node.primary_type().to_string();
        let mixins = node.mixin_types().to_vec();
        self.node_types
            .is_node_type(self.objects.transport_mut(), &primary, &mixins, node_type)
            .await
    }

    pub async fn register_node_types_cnd(&mut self, cnd: &str, allow_update: bool) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.node_type_management, "node type management")?;
        self.node_types
            .register_cnd(self.objects.transport_mut(), cnd, allow_update)
            .await
    }

    // ---- locking ----

    fn ensure_locking(&self) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.locking, "locking")
    }

    /// Lock the node at `path`. Only session-scoped locks are supported;
    /// `timeout` is in seconds, `None` meaning infinite.
    pub async fn lock(
        &mut self,
        path: &str,
        deep: bool,
        session_scoped: bool,
        timeout: Option<u64>,
        owner: Option<&str>,
    ) -> Result<Lock> {
        self.ensure_locking()?;
        let path = path::normalize(path)?;
        let request = LockRequest {
            deep,
            session_scoped,
            timeout,
            owner: owner.map(str::to_string),
        };
        self.locks.lock(&mut self.objects, &path, request).await
    }

    pub async fn unlock(&mut self, path: &str) -> Result<()> {
        self.ensure_locking()?;
        let path = path::normalize(path)?;
        self.locks.unlock(&mut self.objects, &path).await
    }

    pub async fn is_locked(&mut self, path: &str) -> Result<bool> {
        self.ensure_locking()?;
        let path = path::normalize(path)?;
        self.locks.is_locked(&mut self.objects, &path).await
    }

    pub async fn holds_lock(&mut self, path: &str) -> Result<bool> {
        self.ensure_live()?;
        let path = path::normalize(path)?;
        self.locks.holds_lock(&mut self.objects, &path).await
    }

    /// The lock this session took on `path`, if any.
    pub fn get_lock(&self, path: &str) -> Result<&Lock> {
        self.ensure_live()?;
        let path = path::normalize(path)?;
        self.locks
            .get_lock(&path)
            .ok_or_else(|| Error::LockConflict(format!("no lock held on {}", path)))
    }

    pub fn lock_tokens(&self) -> Result<Vec<String>> {
        self.ensure_live()?;
        Ok(self.locks.lock_tokens())
    }

    // ---- query ----

    pub async fn execute(&mut self, query: &Query) -> Result<QueryResult> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.query, "query")?;
        let query = query.resolved()?;
        debug!("Executing {} query: {}", query.language().name(), query.statement());
        let rows = self.objects.transport_mut().query(&query).await?;
        Ok(QueryResult::new(rows))
    }

    pub async fn execute_qom(&mut self, qom: &QueryObjectModel) -> Result<QueryResult> {
        self.execute(&qom.to_query()).await
    }

    // ---- observation ----

    /// Fetch the workspace journal and keep the events `filter` accepts.
    pub async fn event_journal(&mut self, filter: &dyn EventFilter) -> Result<EventJournal> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.observation, "observation")?;
        let events = self.objects.transport_mut().get_event_journal().await?;
        let total = events.len();

        let mut kept = Vec::new();
        for event in events {
            if filter.matches(&event, self).await? {
                kept.push(event);
            }
        }
        debug!("Journal: kept {} of {} events", kept.len(), total);
        Ok(EventJournal::new(kept))
    }

    // ---- workspace ----

    fn ensure_workspace_ops(&self) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities.workspace_management, "workspace management")
    }

    pub async fn accessible_workspace_names(&mut self) -> Result<Vec<String>> {
        self.ensure_live()?;
        self.objects.transport_mut().accessible_workspace_names().await
    }

    /// Copy the subtree at `src` to `dst` immediately, optionally from
    /// another workspace.
    pub async fn copy(&mut self, src: &str, dst: &str, src_workspace: Option<&str>) -> Result<()> {
        self.ensure_workspace_ops()?;
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        if self.objects.node_exists(&dst).await? {
            return Err(Error::ItemExists(dst));
        }
        self.objects.node(path::parent(&dst)).await?;

        self.objects
            .transport_mut()
            .copy_node(&src, &dst, src_workspace)
            .await?;
        self.objects.note_child(&dst, true);
        Ok(())
    }

    /// Cloning between workspaces is not available over this protocol.
    pub async fn clone_from(&mut self, src_workspace: &str, _src: &str, _dst: &str, _remove_existing: bool) -> Result<()> {
        self.ensure_workspace_ops()?;
        Err(Error::unsupported(format!("clone from workspace '{}'", src_workspace)))
    }

    /// Move a subtree on the server right away, bypassing the write log.
    pub async fn move_immediately(&mut self, src: &str, dst: &str) -> Result<()> {
        self.ensure_workspace_ops()?;
        let src = path::normalize(src)?;
        let dst = path::normalize(dst)?;
        if self.objects.has_pending_changes_under(&src) {
            return Err(Error::InvalidItemState(format!("{} has unsaved changes", src)));
        }
        if self.objects.node_exists(&dst).await? {
            return Err(Error::ItemExists(dst));
        }

        self.objects.transport_mut().move_node_immediately(&src, &dst).await?;
        self.objects.evict_subtree(&src);
        self.objects.note_child(&src, false);
        self.objects.note_child(&dst, true);
        Ok(())
    }

    pub async fn create_workspace(&mut self, name: &str, src_workspace: Option<&str>) -> Result<()> {
        self.ensure_workspace_ops()?;
        if src_workspace.is_some() {
            return Err(Error::unsupported("creating a workspace from a source workspace"));
        }
        self.objects.transport_mut().create_workspace(name, None).await?;
        info!("Created workspace '{}'", name);
        Ok(())
    }

    pub async fn delete_workspace(&mut self, name: &str) -> Result<()> {
        self.ensure_workspace_ops()?;
        self.objects.transport_mut().delete_workspace(name).await
    }

    // ---- lifecycle ----

    /// Release locks, drop the registry entry, close the transport and
    /// clear every cached item. Calling it again does nothing.
    pub async fn logout(&mut self) {
        if !self.live {
            return;
        }
        self.locks.logout(&mut self.objects).await;
        self.registry.unregister(&self.key);
        self.objects.transport_mut().logout().await;
        self.objects.clear();
        self.live = false;
        info!("Logged out '{}' from workspace '{}'", self.user_id, self.workspace);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}
