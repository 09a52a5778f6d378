//! Davex protocol client.
//!
//! Speaks the Jackrabbit "Davex" remoting protocol: node reads are JSON
//! documents at `<workspace>/jcr:root<path>.<depth>.json`, writes are
//! batched into one diff POST, and everything else is plain or extended
//! WebDAV (PROPFIND, REPORT, LOCK, CHECKIN, SEARCH, ...).

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use jcrdav_core::error::{Error, Result};
use jcrdav_core::node_type::NodeTypeInfo;
use jcrdav_core::query::Query;
use jcrdav_core::transport::{
    version_at_least, Capabilities, Credentials, DescriptorValue, Descriptors, LockRequest, NodeData, RawColumn,
    RawRow, Transport, MIN_SERVER_VERSION,
};
use jcrdav_core::write_log::{PropertySnapshot, WriteLog, WriteOp};
use jcrdav_core::{BinarySource, Event, Lock};

use crate::binary::{fetch_binary, DavexBinaries};
use crate::config::DavexConfig;
use crate::diff::{DiffEncoder, WriteEncoder};
use crate::journal;
use crate::request::{
    decode, encode_path, encode_segment, href_path, strip_base, Connection, DavRequest, FORM_CONTENT_TYPE,
};
use crate::xml;

/// Descriptor holding the server's version
pub const VERSION_DESCRIPTOR: &str = "jcr.repository.version";

/// Query string selecting the event journal of a workspace
const JOURNAL_QUERY: &str = "?type=journal";

/// Lock timeouts the server reports for locks that never expire
const INFINITE_LOCK_TIMEOUTS: [u64; 2] = [2_147_483, 2_147_482];

/// Answer marking a server that cannot serve batched reads
const BATCH_READ_REJECTION: &str = "Prefix must not be empty";

/// Privileges the server may grant
const PRIVILEGES: [&str; 4] = ["add_node", "read", "remove", "set_property"];

/// Transport talking Davex to one workspace of a remote repository
pub struct DavexClient {
    connection: Connection,
    /// Server entry point, always ending in `/`
    server_uri: String,
    check_login_on_server: bool,
    workspace: Option<String>,
    user_id: String,
    descriptors: Option<Descriptors>,
    fetch_depth: u32,
    writes: WriteLog,
    encoder: Box<dyn WriteEncoder>,
    closed: bool,
}

impl DavexClient {
    pub fn new(config: &DavexConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::protocol(format!("Failed to create HTTP client: {}", e)))?;

        let mut connection = Connection::new(http);
        connection.default_headers = config.default_headers.clone();
        connection.send_expect = config.send_expect;
        connection.user_data = config.user_data.clone();

        let mut server_uri = config.server_uri.clone();
        if !server_uri.ends_with('/') {
            server_uri.push('/');
        }

        Ok(Self {
            connection,
            server_uri,
            check_login_on_server: config.check_login_on_server,
            workspace: None,
            user_id: String::new(),
            descriptors: None,
            fetch_depth: config.session.fetch_depth,
            writes: WriteLog::new(),
            encoder: Box::new(DiffEncoder::new()),
            closed: false,
        })
    }

    /// Replace the encoder used to flush staged writes
    pub fn with_encoder(mut self, encoder: Box<dyn WriteEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    /// Writes staged since the last flush
    pub fn pending_writes(&self) -> &[WriteOp] {
        self.writes.ops()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::protocol("closed transport"))
        } else {
            Ok(())
        }
    }

    fn workspace_name(&self) -> Result<&str> {
        self.ensure_open()?;
        self.workspace
            .as_deref()
            .ok_or_else(|| Error::protocol("transport is not logged in"))
    }

    /// `<server>/<workspace>`
    fn workspace_uri(&self) -> Result<String> {
        Ok(format!("{}{}", self.server_uri, encode_segment(self.workspace_name()?)))
    }

    /// `<server>/<workspace>/jcr:root`
    fn workspace_root(&self) -> Result<String> {
        Ok(format!("{}/jcr:root", self.workspace_uri()?))
    }

    fn item_url(&self, path: &str) -> Result<String> {
        Ok(format!("{}{}", self.workspace_root()?, encode_path(path)))
    }

    /// Repository path of an href pointing into this workspace
    fn path_of_href(&self, href: &str) -> Result<String> {
        let root = self.workspace_root()?;
        let decoded = decode(href);
        strip_base(&decoded, &root)
            .map(href_path)
            .ok_or_else(|| Error::protocol(format!("'{}' is not in workspace {}", decoded, root)))
    }

    async fn check_login(&mut self, workspace: &str) -> Result<()> {
        let url = self.workspace_uri()?;
        let reply = self
            .connection
            .send(DavRequest::new("PROPFIND", url).depth("0").xml(xml::propfind("dcr:workspaceName")?))
            .await?;
        let dom = reply.dom()?;
        let answered = dom.find("workspaceName").map(|e| e.text().trim());
        if answered != Some(workspace) {
            return Err(Error::protocol(format!(
                "Wrong workspace in answer from server: expected '{}', got {:?}",
                workspace, answered
            )));
        }

        let descriptors = self.repository_descriptors().await?;
        let version = descriptors
            .get(VERSION_DESCRIPTOR)
            .and_then(DescriptorValue::first)
            .ok_or_else(|| Error::unsupported("server does not report its repository version"))?;
        if !version_at_least(version, MIN_SERVER_VERSION) {
            return Err(Error::unsupported(format!(
                "server version {} is older than the required {}",
                version, MIN_SERVER_VERSION
            )));
        }
        Ok(())
    }

    fn stage(&mut self, op: WriteOp) -> Result<()> {
        self.ensure_open()?;
        self.writes.push(op);
        Ok(())
    }
}

/// Parse a lock timeout header value; `None` means infinite
fn parse_lock_timeout(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("infinite") {
        return None;
    }
    let seconds = text.strip_prefix("Second-")?.parse::<u64>().ok()?;
    if INFINITE_LOCK_TIMEOUTS.contains(&seconds) {
        None
    } else {
        Some(seconds)
    }
}

fn parse_node_type(element: &xml::Element) -> Option<NodeTypeInfo> {
    let flag = |name: &str| element.attribute(name) == Some("true");
    Some(NodeTypeInfo {
        name: element.attribute("name")?.to_string(),
        is_mixin: flag("isMixin"),
        is_abstract: flag("isAbstract"),
        orderable_child_nodes: flag("hasOrderableChildNodes"),
        primary_item_name: element
            .attribute("primaryItemName")
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        supertypes: element
            .child("supertypes")
            .map(|s| s.children_named("supertype").map(|t| t.text().to_string()).collect())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl Transport for DavexClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    async fn login(&mut self, credentials: &Credentials, workspace: &str) -> Result<()> {
        self.ensure_open()?;
        if self.workspace.is_some() {
            return Err(Error::protocol("transport is already logged in"));
        }
        self.connection.credentials = Some(credentials.clone());
        self.workspace = Some(workspace.to_string());

        if self.check_login_on_server {
            if let Err(e) = self.check_login(workspace).await {
                self.workspace = None;
                self.connection.credentials = None;
                return Err(e);
            }
        }
        self.user_id = credentials.user_id.clone();
        info!("Davex login to {}{} as '{}'", self.server_uri, workspace, credentials.user_id);
        Ok(())
    }

    async fn logout(&mut self) {
        if !self.closed {
            info!("Davex logout from {}", self.server_uri);
        }
        self.closed = true;
        self.writes.clear();
    }

    async fn repository_descriptors(&mut self) -> Result<Descriptors> {
        self.ensure_open()?;
        if let Some(descriptors) = &self.descriptors {
            return Ok(descriptors.clone());
        }

        let reply = self
            .connection
            .send(DavRequest::new("REPORT", self.server_uri.clone()).xml(xml::empty_report("repositorydescriptors")?))
            .await?;
        let dom = reply.dom()?;
        if dom.local_name() != "repositorydescriptors-report" {
            return Err(Error::protocol(format!("unexpected descriptors answer: {}", dom.name)));
        }

        let mut descriptors = Descriptors::new();
        for descriptor in dom.descendants("descriptor") {
            let Some(key) = descriptor.child_text("descriptorkey") else {
                continue;
            };
            let mut values: Vec<String> = descriptor
                .children_named("descriptorvalue")
                .map(|v| v.text().to_string())
                .collect();
            let value = if values.len() == 1 {
                DescriptorValue::Single(values.remove(0))
            } else {
                DescriptorValue::Multiple(values)
            };
            descriptors.insert(key.to_string(), value);
        }
        self.descriptors = Some(descriptors.clone());
        Ok(descriptors)
    }

    async fn accessible_workspace_names(&mut self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let reply = self
            .connection
            .send(
                DavRequest::new("PROPFIND", self.server_uri.clone())
                    .depth("1")
                    .xml(xml::propfind("D:workspace")?),
            )
            .await?;
        let dom = reply.dom()?;

        let mut names = Vec::new();
        for workspace in dom.descendants("workspace") {
            let href = workspace.find("href").map_or(workspace.text(), |h| h.text());
            let decoded = decode(href.trim());
            let rest = strip_base(&decoded, &self.server_uri).unwrap_or(&decoded);
            let name = rest.trim_matches('/');
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn fetch_depth(&self) -> u32 {
        self.fetch_depth
    }

    fn set_fetch_depth(&mut self, depth: u32) {
        self.fetch_depth = depth;
    }

    async fn get_node(&mut self, path: &str) -> Result<NodeData> {
        let url = format!("{}.{}.json", self.item_url(path)?, self.fetch_depth);
        let reply = self.connection.send_raw(DavRequest::new("GET", url)).await?;
        if reply.status == 404 {
            return Err(Error::ItemNotFound(path.to_string()));
        }
        let reply = reply.error_for_status(path)?;
        match reply.json()? {
            serde_json::Value::Object(data) => Ok(data),
            other => Err(Error::protocol(format!("node {} is not a JSON object: {}", path, other))),
        }
    }

    async fn get_nodes(&mut self, paths: &[String]) -> Result<BTreeMap<String, NodeData>> {
        let mut found = BTreeMap::new();
        match paths {
            [] => return Ok(found),
            [path] => {
                match self.get_node(path).await {
                    Ok(data) => {
                        found.insert(path.clone(), data);
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                return Ok(found);
            }
            _ => {}
        }

        let url = format!("{}/.{}.json", self.workspace_root()?, self.fetch_depth);
        let body = paths
            .iter()
            .map(|p| format!("{}={}", urlencoding::encode(":include"), urlencoding::encode(p)))
            .collect::<Vec<_>>()
            .join("&");
        let reply = self
            .connection
            .send_raw(DavRequest::new("POST", url).body(FORM_CONTENT_TYPE, body))
            .await?;
        if reply.status == 403 && reply.text().contains(BATCH_READ_REJECTION) {
            return Err(Error::BatchReadRejected(BATCH_READ_REJECTION.to_string()));
        }
        let reply = reply.error_for_status("batched node read")?;

        if let Some(nodes) = reply.json()?.get("nodes").and_then(|n| n.as_object()) {
            for (path, data) in nodes {
                if let Some(data) = data.as_object() {
                    found.insert(path.clone(), data.clone());
                }
            }
        }
        debug!("Batched read of {} paths returned {} nodes", paths.len(), found.len());
        Ok(found)
    }

    async fn get_node_path_for_identifier(&mut self, uuid: &str) -> Result<String> {
        let url = self.workspace_uri()?;
        let reply = self
            .connection
            .send(DavRequest::new("REPORT", url).xml(xml::href_report("locate-by-uuid", uuid)?))
            .await?;
        let dom = reply.dom()?;
        let hrefs = dom.descendants("href");
        if hrefs.len() != 1 {
            return Err(Error::protocol(format!(
                "expected one href locating {}, got {}",
                uuid,
                hrefs.len()
            )));
        }
        self.path_of_href(hrefs[0].text().trim())
    }

    async fn get_binary(&mut self, path: &str) -> Result<Vec<Bytes>> {
        let url = self.item_url(path)?;
        fetch_binary(&self.connection, url).await
    }

    fn binary_source(&self) -> Option<Arc<dyn BinarySource>> {
        let root = self.workspace_root().ok()?;
        Some(Arc::new(DavexBinaries::new(self.connection.clone(), root)))
    }

    async fn get_references(&mut self, path: &str, name: Option<&str>, weak: bool) -> Result<Vec<String>> {
        let (property, element) = if weak {
            ("dcr:weakreferences", "weakreferences")
        } else {
            ("dcr:references", "references")
        };
        let url = self.item_url(path)?;
        let reply = self
            .connection
            .send(DavRequest::new("PROPFIND", url).depth("0").xml(xml::propfind(property)?))
            .await?;
        let dom = reply.dom()?;
        let root = self.workspace_root()?;

        let mut references = Vec::new();
        if let Some(container) = dom.find(element) {
            for href in container.descendants("href") {
                let decoded = decode(href.text().trim());
                let reference = strip_base(&decoded, &root).unwrap_or(&decoded).to_string();
                let matches = name.map_or(true, |n| reference.rsplit('/').next() == Some(n));
                if matches {
                    references.push(reference);
                }
            }
        }
        Ok(references)
    }

    async fn get_namespaces(&mut self) -> Result<BTreeMap<String, String>> {
        let url = self.workspace_uri()?;
        let reply = self
            .connection
            .send(DavRequest::new("REPORT", url).xml(xml::empty_report("registerednamespaces")?))
            .await?;
        let dom = reply.dom()?;

        let mut namespaces = BTreeMap::new();
        for namespace in dom.descendants("namespace") {
            let prefix = namespace.child_text("prefix").unwrap_or_default();
            let uri = namespace.child_text("uri").unwrap_or_default();
            namespaces.insert(prefix.to_string(), uri.to_string());
        }
        Ok(namespaces)
    }

    async fn get_node_types(&mut self, names: &[String]) -> Result<Vec<NodeTypeInfo>> {
        let url = self.workspace_root()?;
        let reply = self
            .connection
            .send(DavRequest::new("REPORT", url).xml(xml::node_types_report(names)?))
            .await?;
        let dom = reply.dom()?;
        Ok(dom.descendants("nodeType").into_iter().filter_map(parse_node_type).collect())
    }

    fn store_node(&mut self, path: &str, properties: Vec<PropertySnapshot>) -> Result<()> {
        self.stage(WriteOp::AddNode {
            path: path.to_string(),
            properties,
        })
    }

    fn store_property(&mut self, path: &str, property: PropertySnapshot) -> Result<()> {
        self.stage(WriteOp::SetProperty {
            path: path.to_string(),
            property,
        })
    }

    fn delete_node(&mut self, path: &str) -> Result<()> {
        self.stage(WriteOp::RemoveNode { path: path.to_string() })
    }

    fn delete_property(&mut self, path: &str) -> Result<()> {
        self.stage(WriteOp::RemoveProperty { path: path.to_string() })
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
        self.writes.clear();
    }

    async fn finish_save(&mut self) -> Result<()> {
        let ops = self.writes.drain();
        let Some(encoded) = self.encoder.encode(&ops)? else {
            return Ok(());
        };
        let url = format!("{}/", self.workspace_root()?);
        self.connection
            .send(DavRequest::new("POST", url).body(encoded.content_type, encoded.body))
            .await?;
        info!("Saved {} operations", ops.len());
        Ok(())
    }

    async fn copy_node(&mut self, src: &str, dst: &str, src_workspace: Option<&str>) -> Result<()> {
        let source = match src_workspace {
            Some(workspace) => format!(
                "{}{}/jcr:root{}",
                self.server_uri,
                encode_segment(workspace),
                encode_path(src)
            ),
            None => self.item_url(src)?,
        };
        let destination = self.item_url(dst)?;
        self.connection
            .send(
                DavRequest::new("COPY", source)
                    .depth("infinity")
                    .header("Destination", destination),
            )
            .await?;
        Ok(())
    }

    async fn move_node_immediately(&mut self, src: &str, dst: &str) -> Result<()> {
        let source = self.item_url(src)?;
        let destination = self.item_url(dst)?;
        self.connection
            .send(
                DavRequest::new("MOVE", source)
                    .depth("infinity")
                    .header("Destination", destination),
            )
            .await?;
        Ok(())
    }

    async fn checkin(&mut self, path: &str) -> Result<String> {
        let url = self.item_url(path)?;
        let reply = self.connection.send_raw(DavRequest::new("CHECKIN", url)).await?;
        if reply.status == 405 {
            return Err(Error::unsupported(format!("checkin is not supported on {}", path)));
        }
        let reply = reply.error_for_status(path)?;
        let location = reply
            .location
            .as_deref()
            .ok_or_else(|| Error::protocol(format!("checkin of {} returned no version location", path)))?;
        self.path_of_href(location)
    }

    async fn checkout(&mut self, path: &str) -> Result<()> {
        let url = self.item_url(path)?;
        let reply = self.connection.send_raw(DavRequest::new("CHECKOUT", url)).await?;
        if reply.status == 405 {
            return Err(Error::unsupported(format!("checkout is not supported on {}", path)));
        }
        reply.error_for_status(path)?;
        Ok(())
    }

    async fn restore(&mut self, remove_existing: bool, version_path: &str, path: &str) -> Result<()> {
        let url = self.item_url(path)?;
        let version = self.item_url(version_path)?;
        self.connection
            .send(DavRequest::new("UPDATE", url).xml(xml::restore(&version, remove_existing)?))
            .await?;
        Ok(())
    }

    async fn remove_version(&mut self, history_path: &str, name: &str) -> Result<()> {
        let url = self.item_url(&format!("{}/{}", history_path.trim_end_matches('/'), name))?;
        self.connection.send(DavRequest::new("DELETE", url)).await?;
        Ok(())
    }

    async fn query(&mut self, query: &Query) -> Result<Vec<RawRow>> {
        let url = format!("{}/", self.workspace_root()?);
        let reply = self
            .connection
            .send(DavRequest::new("SEARCH", url).xml(xml::search_request(query)?))
            .await?;
        let dom = reply.dom()?;

        let rows = dom
            .descendants("response")
            .into_iter()
            .map(|response| {
                response
                    .descendants("column")
                    .into_iter()
                    .filter_map(|column| {
                        let name = column.child_text("name")?;
                        Some(RawColumn {
                            name: name.to_string(),
                            selector: column
                                .child_text("selectorName")
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                            value: column.child_text("value").map(|v| v.replace("_x0020_", " ")),
                        })
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }

    async fn lock_node(&mut self, path: &str, request: &LockRequest) -> Result<Lock> {
        let owner = request.owner.clone().unwrap_or_else(|| self.user_id.clone());
        let timeout = match request.timeout {
            Some(seconds) => format!("Second-{}", seconds),
            None => "Second-infinite".to_string(),
        };
        let url = self.item_url(path)?;
        let reply = self
            .connection
            .send_raw(
                DavRequest::new("LOCK", url)
                    .header("Timeout", timeout)
                    .depth(if request.deep { "infinity" } else { "0" })
                    .xml(xml::lock_info(request, &owner)?),
            )
            .await?;
        if reply.status == 412 {
            return Err(Error::LockConflict(format!("Unable to lock {}", path)));
        }
        let dom = reply.error_for_status(path)?.dom()?;
        let active = dom
            .find("activelock")
            .ok_or_else(|| Error::protocol(format!("lock answer for {} has no activelock", path)))?;

        let timeout = active.child_text("timeout").and_then(parse_lock_timeout);
        let mut lock = Lock::new(path).with_timeout(timeout);
        lock.session_scoped = active.find("exclusive-session-scoped").is_some();
        lock.deep = active
            .child_text("depth")
            .map_or(false, |d| d.trim().eq_ignore_ascii_case("infinity"));
        lock.owner = active
            .child("owner")
            .map(|o| o.find("href").map_or(o.text(), |h| h.text()).trim().to_string())
            .filter(|o| !o.is_empty());
        lock.token = active
            .child("locktoken")
            .and_then(|t| t.find("href"))
            .map(|h| h.text().trim().to_string());
        Ok(lock)
    }

    async fn is_locked(&mut self, path: &str) -> Result<bool> {
        let url = self.item_url(path)?;
        let reply = self
            .connection
            .send(DavRequest::new("PROPFIND", url).depth("0").xml(xml::propfind("D:lockdiscovery")?))
            .await?;
        let dom = reply.dom()?;
        Ok(dom.find("lockdiscovery").map_or(false, |d| !d.children.is_empty()))
    }

    async fn unlock(&mut self, path: &str, token: &str) -> Result<()> {
        let url = self.item_url(path)?;
        let reply = self
            .connection
            .send_raw(DavRequest::new("UNLOCK", url).header("Lock-Token", format!("<{}>", token)))
            .await?;
        if reply.status == 412 {
            return Err(Error::LockConflict(format!("Unable to unlock {}", path)));
        }
        reply.error_for_status(path)?;
        Ok(())
    }

    async fn register_namespace(&mut self, prefix: &str, uri: &str) -> Result<()> {
        let mut namespaces = self.get_namespaces().await?;
        match namespaces.get(prefix) {
            Some(existing) if existing == uri => return Ok(()),
            Some(existing) => {
                return Err(Error::Namespace(format!(
                    "prefix '{}' is already mapped to {}",
                    prefix, existing
                )))
            }
            None => {}
        }
        namespaces.insert(prefix.to_string(), uri.to_string());

        let url = self.workspace_uri()?;
        self.connection
            .send(DavRequest::new("PROPPATCH", url).xml(xml::register_namespaces(&namespaces)?))
            .await?;
        Ok(())
    }

    async fn register_node_types_cnd(&mut self, cnd: &str, allow_update: bool) -> Result<()> {
        let url = self.workspace_uri()?;
        self.connection
            .send(DavRequest::new("PROPPATCH", url).xml(xml::register_cnd(cnd, allow_update)?))
            .await?;
        Ok(())
    }

    async fn get_permissions(&mut self, path: &str) -> Result<Vec<String>> {
        let url = self.workspace_uri()?;
        let target = self.item_url(path)?;
        let reply = self
            .connection
            .send(DavRequest::new("REPORT", url).xml(xml::href_report("privileges", &target)?))
            .await?;
        let dom = reply.dom()?;
        let set = dom
            .find("current-user-privilege-set")
            .ok_or_else(|| Error::protocol(format!("no privilege set for {}", path)))?;

        let mut granted = Vec::new();
        for privilege in set.children_named("privilege") {
            let Some(action) = privilege.children.first().map(|p| p.local_name()) else {
                continue;
            };
            if !PRIVILEGES.contains(&action) {
                return Err(Error::protocol(format!("invalid privilege '{}'", action)));
            }
            granted.push(action.to_string());
        }
        Ok(granted)
    }

    async fn get_event_journal(&mut self) -> Result<Vec<Event>> {
        let url = format!("{}{}", self.workspace_uri()?, JOURNAL_QUERY);
        let reply = self.connection.send(DavRequest::new("GET", url)).await?;
        let encoded_root = self.workspace_root()?.replace("jcr:root", "jcr%3aroot");
        journal::parse_feed(&reply.text(), &encoded_root)
    }

    fn set_user_data(&mut self, data: Option<String>) {
        self.connection.user_data = data;
    }

    async fn create_workspace(&mut self, name: &str, src_workspace: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        if src_workspace.is_some() {
            return Err(Error::unsupported("creating a workspace from a source workspace"));
        }
        let url = format!("{}{}", self.server_uri, encode_segment(name));
        self.connection.send(DavRequest::new("MKWORKSPACE", url)).await?;
        Ok(())
    }
}
