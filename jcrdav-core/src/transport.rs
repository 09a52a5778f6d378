//! Transport abstraction.
//!
//! A transport speaks one wire protocol to one repository workspace. The
//! session only ever talks to the server through this trait. Optional
//! feature groups are advertised through [`Capabilities`]; the default
//! method bodies reject everything a transport does not implement.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::binary::BinarySource;
use crate::error::{Error, Result};
use crate::lock::Lock;
use crate::node_type::NodeTypeInfo;
use crate::observation::Event;
use crate::query::Query;
use crate::write_log::PropertySnapshot;

/// Raw node data as returned by the server (`<path>.<depth>.json`).
pub type NodeData = serde_json::Map<String, serde_json::Value>;

/// Feature groups a transport implements beyond plain reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub writing: bool,
    pub versioning: bool,
    pub locking: bool,
    pub query: bool,
    pub observation: bool,
    pub namespace_management: bool,
    pub node_type_management: bool,
    pub workspace_management: bool,
    pub permissions: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            writing: true,
            versioning: true,
            locking: true,
            query: true,
            observation: true,
            namespace_management: true,
            node_type_management: true,
            workspace_management: true,
            permissions: true,
        }
    }

    pub fn read_only() -> Self {
        Self::default()
    }

    /// Fail with a capability error unless `enabled`.
    pub fn require(enabled: bool, feature: &str) -> Result<()> {
        if enabled {
            Ok(())
        } else {
            Err(Error::Unsupported(format!("transport does not support {}", feature)))
        }
    }
}

/// Login credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub password: String,
    pub attributes: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: password.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// A repository descriptor value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorValue {
    Single(String),
    Multiple(Vec<String>),
}

impl DescriptorValue {
    /// First (or only) value.
    pub fn first(&self) -> Option<&str> {
        match self {
            DescriptorValue::Single(v) => Some(v),
            DescriptorValue::Multiple(v) => v.first().map(String::as_str),
        }
    }
}

pub type Descriptors = BTreeMap<String, DescriptorValue>;

/// One cell of a raw query result row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawColumn {
    /// Column name, possibly `selector.property`
    pub name: String,
    /// Explicit selector, when the server sent one
    pub selector: Option<String>,
    pub value: Option<String>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, selector: Option<&str>, value: Option<&str>) -> Self {
        Self {
            name: name.into(),
            selector: selector.map(str::to_string),
            value: value.map(str::to_string),
        }
    }
}

pub type RawRow = Vec<RawColumn>;

/// Options for a lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub deep: bool,
    pub session_scoped: bool,
    /// Timeout in seconds; `None` asks for an infinite lock
    pub timeout: Option<u64>,
    /// Owner info; transports default it to the login user id
    pub owner: Option<String>,
}

/// Wire protocol client bound to one workspace
#[async_trait]
pub trait Transport: Send {
    /// Feature groups this transport implements
    fn capabilities(&self) -> Capabilities;

    /// Bind to `workspace`. May be called once.
    async fn login(&mut self, credentials: &Credentials, workspace: &str) -> Result<()>;

    /// Close the transport; later requests fail
    async fn logout(&mut self);

    /// Repository descriptors
    async fn repository_descriptors(&mut self) -> Result<Descriptors>;

    /// Names of the workspaces the logged in user may access
    async fn accessible_workspace_names(&mut self) -> Result<Vec<String>>;

    /// Depth of the subtree returned with each node read
    fn fetch_depth(&self) -> u32;

    fn set_fetch_depth(&mut self, depth: u32);

    /// Read one node
    async fn get_node(&mut self, path: &str) -> Result<NodeData>;

    /// Read several nodes; missing paths are absent from the result
    async fn get_nodes(&mut self, paths: &[String]) -> Result<BTreeMap<String, NodeData>>;

    /// Resolve a uuid to the node path in this workspace
    async fn get_node_path_for_identifier(&mut self, uuid: &str) -> Result<String>;

    /// Read every value of a binary property
    async fn get_binary(&mut self, path: &str) -> Result<Vec<Bytes>>;

    /// Shareable handle serving this transport's binaries out of band
    fn binary_source(&self) -> Option<Arc<dyn BinarySource>>;

    /// Paths of the (weak) reference properties pointing at `path`
    async fn get_references(&mut self, path: &str, name: Option<&str>, weak: bool) -> Result<Vec<String>>;

    /// Registered prefix → uri mappings
    async fn get_namespaces(&mut self) -> Result<BTreeMap<String, String>>;

    /// Node type definitions; empty `names` means all
    async fn get_node_types(&mut self, names: &[String]) -> Result<Vec<NodeTypeInfo>>;

    /// Stage creation of a node with its initial properties
    fn store_node(&mut self, _path: &str, _properties: Vec<PropertySnapshot>) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    /// Stage setting a property
    fn store_property(&mut self, _path: &str, _property: PropertySnapshot) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    fn delete_node(&mut self, _path: &str) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    fn delete_property(&mut self, _path: &str) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    /// Stage a move inside the workspace
    fn move_node(&mut self, _src: &str, _dst: &str) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    /// Stage child reorderings of `parent`: `(child, before)` pairs, `None`
    /// meaning last
    fn reorder_nodes(&mut self, _parent: &str, _reorders: &[(String, Option<String>)]) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    /// Forget every staged write
    fn discard_writes(&mut self) {}

    /// Flush staged writes as one request; a no-op when nothing is staged
    async fn finish_save(&mut self) -> Result<()> {
        Err(Error::unsupported("writing"))
    }

    /// Copy a subtree immediately, optionally from another workspace
    async fn copy_node(&mut self, _src: &str, _dst: &str, _src_workspace: Option<&str>) -> Result<()> {
        Err(Error::unsupported("workspace copy"))
    }

    /// Move a subtree immediately
    async fn move_node_immediately(&mut self, _src: &str, _dst: &str) -> Result<()> {
        Err(Error::unsupported("workspace move"))
    }

    /// Check in a node; returns the path of the created version
    async fn checkin(&mut self, _path: &str) -> Result<String> {
        Err(Error::unsupported("versioning"))
    }

    async fn checkout(&mut self, _path: &str) -> Result<()> {
        Err(Error::unsupported("versioning"))
    }

    /// Restore the node at `path` to the version at `version_path`
    async fn restore(&mut self, _remove_existing: bool, _version_path: &str, _path: &str) -> Result<()> {
        Err(Error::unsupported("versioning"))
    }

    /// Remove version `name` from the history at `history_path`
    async fn remove_version(&mut self, _history_path: &str, _name: &str) -> Result<()> {
        Err(Error::unsupported("versioning"))
    }

    /// Run a query and return its raw rows
    async fn query(&mut self, _query: &Query) -> Result<Vec<RawRow>> {
        Err(Error::unsupported("query"))
    }

    async fn lock_node(&mut self, _path: &str, _request: &LockRequest) -> Result<Lock> {
        Err(Error::unsupported("locking"))
    }

    /// Ask the server whether `path` is locked
    async fn is_locked(&mut self, _path: &str) -> Result<bool> {
        Err(Error::unsupported("locking"))
    }

    async fn unlock(&mut self, _path: &str, _token: &str) -> Result<()> {
        Err(Error::unsupported("locking"))
    }

    async fn register_namespace(&mut self, _prefix: &str, _uri: &str) -> Result<()> {
        Err(Error::unsupported("namespace registration"))
    }

    async fn unregister_namespace(&mut self, _prefix: &str) -> Result<()> {
        Err(Error::unsupported("namespace unregistration"))
    }

    /// Register node types from CND text
    async fn register_node_types_cnd(&mut self, _cnd: &str, _allow_update: bool) -> Result<()> {
        Err(Error::unsupported("node type registration"))
    }

    /// Actions the current user may perform at `path`
    async fn get_permissions(&mut self, _path: &str) -> Result<Vec<String>> {
        Err(Error::unsupported("permissions"))
    }

    /// Full event journal of the workspace
    async fn get_event_journal(&mut self) -> Result<Vec<Event>> {
        Err(Error::unsupported("observation"))
    }

    /// Data attached to events generated by this transport's writes
    fn set_user_data(&mut self, _data: Option<String>) {}

    async fn create_workspace(&mut self, _name: &str, _src_workspace: Option<&str>) -> Result<()> {
        Err(Error::unsupported("workspace creation"))
    }

    async fn delete_workspace(&mut self, _name: &str) -> Result<()> {
        Err(Error::unsupported("workspace deletion"))
    }
}

/// Minimum server version accepted at login.
pub const MIN_SERVER_VERSION: &str = "2.3.6";

/// Compare dotted versions numerically, ignoring non-numeric suffixes
/// (`2.4.0-SNAPSHOT` ≥ `2.3.6`).
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.')
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    }

    let have = parts(version);
    let want = parts(minimum);
    for i in 0..have.len().max(want.len()) {
        let a = have.get(i).copied().unwrap_or(0);
        let b = want.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}
