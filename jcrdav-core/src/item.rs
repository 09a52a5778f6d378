//! Nodes and properties as held by the object manager.
//!
//! Items live in the object manager's arena and change state only through
//! its operations. References handed out by the session borrow from the
//! arena; clones are detached snapshots that never update.

use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::binary::StreamGuard;
use crate::error::{Error, Result};
use crate::path;
use crate::transport::NodeData;
use crate::value::{PropertyType, Value};
use crate::write_log::PropertySnapshot;

pub const JCR_PRIMARY_TYPE: &str = "jcr:primaryType";
pub const JCR_MIXIN_TYPES: &str = "jcr:mixinTypes";
pub const JCR_UUID: &str = "jcr:uuid";
pub const NT_UNSTRUCTURED: &str = "nt:unstructured";
pub const MIX_REFERENCEABLE: &str = "mix:referenceable";

/// Lifecycle state of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Created locally, not yet saved
    New,
    /// In sync with the server as of the last read or save
    Clean,
    /// Persisted, with unsaved local changes
    Modified,
    /// Removed; evicted from the arena
    Deleted,
}

/// A property of a node
#[derive(Debug)]
pub struct Property {
    path: String,
    name: String,
    state: ItemState,
    kind: PropertyType,
    multiple: bool,
    values: Vec<Value>,
    /// Byte lengths of binary values as reported by the read response
    lengths: Vec<u64>,
    loaded: bool,
    streams: Vec<StreamGuard>,
}

impl Clone for Property {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            name: self.name.clone(),
            state: self.state,
            kind: self.kind,
            multiple: self.multiple,
            values: self.values.clone(),
            lengths: self.lengths.clone(),
            loaded: self.loaded,
            streams: Vec::new(),
        }
    }
}

impl Property {
    pub(crate) fn new(
        parent: &str,
        name: &str,
        kind: PropertyType,
        multiple: bool,
        values: Vec<Value>,
        state: ItemState,
    ) -> Self {
        let lengths = values.iter().map(|v| v.len() as u64).collect();
        Self {
            path: path::join(parent, name),
            name: name.to_string(),
            state,
            kind,
            multiple,
            values,
            lengths,
            loaded: true,
            streams: Vec::new(),
        }
    }

    /// A binary property whose values have not been transferred yet.
    pub(crate) fn deferred_binary(parent: &str, name: &str, multiple: bool, lengths: Vec<u64>) -> Self {
        Self {
            path: path::join(parent, name),
            name: name.to_string(),
            state: ItemState::Clean,
            kind: PropertyType::Binary,
            multiple,
            values: Vec::new(),
            lengths,
            loaded: false,
            streams: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_path(&self) -> &str {
        path::parent(&self.path)
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == ItemState::New
    }

    pub fn is_modified(&self) -> bool {
        self.state == ItemState::Modified
    }

    pub fn kind(&self) -> PropertyType {
        self.kind
    }

    pub fn is_multiple(&self) -> bool {
        self.multiple
    }

    /// False for binaries whose bytes still live on the server.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// All values. Deferred binaries must be read through
    /// [`Session::binary`](crate::Session::binary).
    pub fn values(&self) -> Result<&[Value]> {
        if !self.loaded {
            return Err(Error::InvalidItemState(format!(
                "binary values of {} are not loaded",
                self.path
            )));
        }
        Ok(&self.values)
    }

    /// The single value of a non-multiple property.
    pub fn value(&self) -> Result<&Value> {
        if self.multiple {
            return Err(Error::ValueFormat(format!("{} is multi-valued", self.path)));
        }
        self.values()?
            .first()
            .ok_or_else(|| Error::ValueFormat(format!("{} has no value", self.path)))
    }

    pub fn string(&self) -> Result<String> {
        Ok(self.value()?.to_jcr_string())
    }

    pub fn long(&self) -> Result<i64> {
        self.value()?.as_long()
    }

    pub fn double(&self) -> Result<f64> {
        self.value()?.as_double()
    }

    pub fn boolean(&self) -> Result<bool> {
        self.value()?.as_bool()
    }

    pub fn date(&self) -> Result<chrono::DateTime<chrono::FixedOffset>> {
        self.value()?.as_date()
    }

    pub fn strings(&self) -> Result<Vec<String>> {
        Ok(self.values()?.iter().map(Value::to_jcr_string).collect())
    }

    /// Byte length of each value, without loading binaries.
    pub fn lengths(&self) -> Vec<u64> {
        if !self.loaded {
            return self.lengths.clone();
        }
        self.values.iter().map(|v| v.len() as u64).collect()
    }

    /// Length of the single value.
    pub fn length(&self) -> Result<u64> {
        if self.multiple {
            return Err(Error::ValueFormat(format!("{} is multi-valued", self.path)));
        }
        self.lengths()
            .first()
            .copied()
            .ok_or_else(|| Error::ValueFormat(format!("{} has no value", self.path)))
    }

    pub fn snapshot(&self) -> PropertySnapshot {
        PropertySnapshot {
            name: self.name.clone(),
            kind: self.kind,
            multiple: self.multiple,
            values: self.values.clone(),
        }
    }

    pub(crate) fn set_state(&mut self, state: ItemState) {
        self.state = state;
    }

    pub(crate) fn replace(&mut self, kind: PropertyType, multiple: bool, values: Vec<Value>) {
        self.kind = kind;
        self.multiple = multiple;
        self.lengths = values.iter().map(|v| v.len() as u64).collect();
        self.values = values;
        self.loaded = true;
        self.streams.clear();
    }

    /// Store fetched binary bytes without changing the state.
    pub(crate) fn fill_binary(&mut self, values: Vec<bytes::Bytes>) {
        self.lengths = values.iter().map(|b| b.len() as u64).collect();
        self.values = values.into_iter().map(Value::Binary).collect();
        self.loaded = true;
    }

    pub(crate) fn hold_streams(&mut self, guard: StreamGuard) {
        self.streams.retain(StreamGuard::is_held);
        self.streams.push(guard);
    }

    pub(crate) fn rebase(&mut self, parent: &str) {
        self.path = path::join(parent, &self.name);
    }

    pub(crate) fn raw_values(&self) -> &[Value] {
        &self.values
    }
}

/// A node in the repository tree
#[derive(Debug, Clone)]
pub struct Node {
    path: String,
    instance: u64,
    state: ItemState,
    primary_type: String,
    mixins: Vec<String>,
    identifier: Option<String>,
    properties: BTreeMap<String, Property>,
    children: Vec<String>,
}

impl Node {
    /// A freshly created local node.
    pub(crate) fn new_local(path: &str, instance: u64, primary_type: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            JCR_PRIMARY_TYPE.to_string(),
            Property::new(
                path,
                JCR_PRIMARY_TYPE,
                PropertyType::Name,
                false,
                vec![Value::Name(primary_type.to_string())],
                ItemState::New,
            ),
        );
        Self {
            path: path.to_string(),
            instance,
            state: ItemState::New,
            primary_type: primary_type.to_string(),
            mixins: Vec::new(),
            identifier: None,
            properties,
            children: Vec::new(),
        }
    }

    /// Build a clean node from server data. Returns the node and the data of
    /// nested children included by the fetch depth.
    pub(crate) fn from_data(path: &str, data: &NodeData, instance: u64) -> Result<(Node, Vec<(String, NodeData)>)> {
        let mut properties = BTreeMap::new();
        let mut children = Vec::new();
        let mut nested = Vec::new();

        for (key, json) in data {
            if key.starts_with(':') {
                // binary lengths travel only as `:name` hints
                let name = &key[1..];
                if let Some(lengths) = binary_lengths(json) {
                    let multiple = json.is_array();
                    properties.insert(
                        name.to_string(),
                        Property::deferred_binary(path, name, multiple, lengths),
                    );
                }
                continue;
            }

            if let Json::Object(child) = json {
                children.push(key.clone());
                if !child.is_empty() {
                    nested.push((path::join(path, key), child.clone()));
                }
                continue;
            }

            let hint = data
                .get(&format!(":{}", key))
                .and_then(Json::as_str)
                .map(PropertyType::from_name)
                .transpose()?;
            let property = parse_property(path, key, json, hint)?;
            properties.insert(key.clone(), property);
        }

        let primary_type = properties
            .get(JCR_PRIMARY_TYPE)
            .and_then(|p| p.values.first())
            .map(Value::to_jcr_string)
            .unwrap_or_else(|| NT_UNSTRUCTURED.to_string());
        let mixins = properties
            .get(JCR_MIXIN_TYPES)
            .map(|p| p.values.iter().map(Value::to_jcr_string).collect())
            .unwrap_or_default();
        let identifier = properties
            .get(JCR_UUID)
            .and_then(|p| p.values.first())
            .map(Value::to_jcr_string);

        let node = Node {
            path: path.to_string(),
            instance,
            state: ItemState::Clean,
            primary_type,
            mixins,
            identifier,
            properties,
            children,
        };
        Ok((node, nested))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        path::name(&self.path)
    }

    pub fn parent_path(&self) -> &str {
        path::parent(&self.path)
    }

    pub fn depth(&self) -> usize {
        path::depth(&self.path)
    }

    /// Arena instance id; stable for a path until refresh or logout.
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == ItemState::New
    }

    pub fn is_modified(&self) -> bool {
        self.state == ItemState::Modified
    }

    pub fn primary_type(&self) -> &str {
        &self.primary_type
    }

    pub fn mixin_types(&self) -> &[String] {
        &self.mixins
    }

    pub fn has_mixin(&self, mixin: &str) -> bool {
        self.mixins.iter().any(|m| m == mixin)
    }

    /// The node's uuid, if referenceable.
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    pub fn property_names(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    /// Child node names in document order.
    pub fn child_names(&self) -> &[String] {
        &self.children
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.children.iter().any(|c| c == name)
    }

    pub fn has_nodes(&self) -> bool {
        !self.children.is_empty()
    }

    /// Absolute paths of the children.
    pub fn child_paths(&self) -> Vec<String> {
        self.children.iter().map(|c| path::join(&self.path, c)).collect()
    }

    pub(crate) fn set_state(&mut self, state: ItemState) {
        self.state = state;
    }

    pub(crate) fn set_instance(&mut self, instance: u64) {
        self.instance = instance;
    }

    pub(crate) fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.get_mut(name)
    }

    pub(crate) fn properties_mut(&mut self) -> impl Iterator<Item = &mut Property> {
        self.properties.values_mut()
    }

    pub(crate) fn insert_property(&mut self, property: Property) {
        match property.name() {
            JCR_MIXIN_TYPES => {
                self.mixins = property.values.iter().map(Value::to_jcr_string).collect();
            }
            JCR_UUID => {
                self.identifier = property.values.first().map(Value::to_jcr_string);
            }
            _ => {}
        }
        self.properties.insert(property.name.clone(), property);
    }

    pub(crate) fn take_property(&mut self, name: &str) -> Option<Property> {
        let removed = self.properties.remove(name);
        match name {
            JCR_MIXIN_TYPES => self.mixins.clear(),
            JCR_UUID => self.identifier = None,
            _ => {}
        }
        removed
    }

    pub(crate) fn sync_from_property(&mut self, name: &str) {
        let values: Vec<String> = self
            .properties
            .get(name)
            .map(|p| p.values.iter().map(Value::to_jcr_string).collect())
            .unwrap_or_default();
        match name {
            JCR_MIXIN_TYPES => self.mixins = values,
            JCR_UUID => self.identifier = values.into_iter().next(),
            _ => {}
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<String> {
        &mut self.children
    }

    /// Move the node (and its properties' paths) to `new_path`.
    pub(crate) fn rebase(&mut self, new_path: &str) {
        self.path = new_path.to_string();
        for property in self.properties.values_mut() {
            property.rebase(new_path);
        }
    }
}

fn binary_lengths(json: &Json) -> Option<Vec<u64>> {
    match json {
        Json::Number(n) => n.as_u64().map(|v| vec![v]),
        Json::Array(items) if items.iter().all(Json::is_number) && !items.is_empty() => {
            Some(items.iter().filter_map(Json::as_u64).collect())
        }
        _ => None,
    }
}

fn parse_property(parent: &str, name: &str, json: &Json, hint: Option<PropertyType>) -> Result<Property> {
    let (multiple, items): (bool, Vec<&Json>) = match json {
        Json::Array(items) => (true, items.iter().collect()),
        other => (false, vec![other]),
    };

    let kind = match (name, hint) {
        (JCR_PRIMARY_TYPE, _) | (JCR_MIXIN_TYPES, _) => PropertyType::Name,
        (_, Some(kind)) => kind,
        _ => items.first().map(|v| infer_type(v)).unwrap_or(PropertyType::String),
    };

    let mut values = Vec::with_capacity(items.len());
    for item in items {
        values.push(json_to_value(item, kind)?);
    }
    Ok(Property::new(parent, name, kind, multiple, values, ItemState::Clean))
}

fn infer_type(json: &Json) -> PropertyType {
    match json {
        Json::Bool(_) => PropertyType::Boolean,
        Json::Number(n) if n.is_i64() || n.is_u64() => PropertyType::Long,
        Json::Number(_) => PropertyType::Double,
        _ => PropertyType::String,
    }
}

fn json_to_value(json: &Json, kind: PropertyType) -> Result<Value> {
    let raw = match json {
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(v) => Value::Long(v),
            None => Value::Double(n.as_f64().unwrap_or_default()),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Null => Value::String(String::new()),
        other => {
            return Err(Error::Protocol(format!("unexpected property value {}", other)));
        }
    };
    raw.convert(kind)
}
