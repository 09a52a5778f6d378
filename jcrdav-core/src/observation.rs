//! Journal-based observation.
//!
//! The server keeps a journal of workspace changes. A session fetches it on
//! demand and filters the events client-side through composable async
//! [`EventFilter`]s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::path;
use crate::session::Session;

/// Kind of change an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyRemoved,
    PropertyChanged,
    NodeMoved,
    Persist,
}

/// Mask matching every event type.
pub const ALL_EVENT_TYPES: u32 = 0x7f;

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::NodeAdded,
        EventType::NodeRemoved,
        EventType::PropertyAdded,
        EventType::PropertyRemoved,
        EventType::PropertyChanged,
        EventType::NodeMoved,
        EventType::Persist,
    ];

    /// Bit used in event type masks.
    pub fn code(self) -> u32 {
        match self {
            EventType::NodeAdded => 0x1,
            EventType::NodeRemoved => 0x2,
            EventType::PropertyAdded => 0x4,
            EventType::PropertyRemoved => 0x8,
            EventType::PropertyChanged => 0x10,
            EventType::NodeMoved => 0x20,
            EventType::Persist => 0x40,
        }
    }

    /// Element name used in journal feeds.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventType::NodeAdded => "nodeadded",
            EventType::NodeRemoved => "noderemoved",
            EventType::PropertyAdded => "propertyadded",
            EventType::PropertyRemoved => "propertyremoved",
            EventType::PropertyChanged => "propertychanged",
            EventType::NodeMoved => "nodemoved",
            EventType::Persist => "persist",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.wire_name().eq_ignore_ascii_case(name))
    }

    pub fn is_property_event(self) -> bool {
        matches!(
            self,
            EventType::PropertyAdded | EventType::PropertyRemoved | EventType::PropertyChanged
        )
    }
}

/// A change recorded in the journal
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventType,
    pub path: Option<String>,
    pub identifier: Option<String>,
    pub user_id: Option<String>,
    pub user_data: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub info: BTreeMap<String, String>,
    pub primary_node_type: Option<String>,
    pub mixin_node_types: Vec<String>,
}

impl Event {
    pub fn new(kind: EventType) -> Self {
        Self {
            kind,
            path: None,
            identifier: None,
            user_id: None,
            user_data: None,
            date: None,
            info: BTreeMap::new(),
            primary_node_type: None,
            mixin_node_types: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Path of the node the event is about: the item itself for node events,
    /// its parent for property events.
    pub fn node_path(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        if self.kind.is_property_event() {
            Some(path::parent(path))
        } else {
            Some(path)
        }
    }
}

/// Predicate over journal events
#[async_trait]
pub trait EventFilter: Send + Sync {
    /// Whether `event` passes the filter; may consult the session
    async fn matches(&self, event: &Event, session: &mut Session) -> Result<bool>;
}

/// Accepts every event
pub struct AcceptAll;

#[async_trait]
impl EventFilter for AcceptAll {
    async fn matches(&self, _event: &Event, _session: &mut Session) -> Result<bool> {
        Ok(true)
    }
}

/// Matches events whose type is in a mask of [`EventType::code`] bits
pub struct EventTypeFilter {
    mask: u32,
}

impl EventTypeFilter {
    pub fn new(mask: u32) -> Self {
        Self { mask }
    }

    pub fn of(types: &[EventType]) -> Self {
        Self::new(types.iter().fold(0, |mask, t| mask | t.code()))
    }
}

#[async_trait]
impl EventFilter for EventTypeFilter {
    async fn matches(&self, event: &Event, _session: &mut Session) -> Result<bool> {
        Ok(self.mask & event.kind.code() != 0)
    }
}

/// Matches events whose associated parent node (the parent of the event
/// path) is `path`, or lies below it when `deep`
pub struct PathFilter {
    path: String,
    deep: bool,
}

impl PathFilter {
    pub fn new(path: impl Into<String>, deep: bool) -> Self {
        Self { path: path.into(), deep }
    }
}

#[async_trait]
impl EventFilter for PathFilter {
    async fn matches(&self, event: &Event, _session: &mut Session) -> Result<bool> {
        let parent = match event.path.as_deref() {
            Some(p) => path::parent(p),
            None => return Ok(false),
        };
        if self.deep {
            Ok(path::is_self_or_descendant(parent, &self.path))
        } else {
            Ok(parent == self.path)
        }
    }
}

/// Matches events at or below the current path of any of a set of nodes
/// given by uuid. The uuids are resolved once, when the filter is built.
pub struct UuidFilter {
    paths: Vec<String>,
}

impl UuidFilter {
    /// Resolve `uuids` through the session; unknown uuids are skipped.
    pub async fn new(session: &mut Session, uuids: &[String]) -> Result<Self> {
        let mut paths = Vec::new();
        for uuid in uuids {
            match session.node_by_identifier(uuid).await {
                Ok(node) => paths.push(node.path().to_string()),
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Skipping unknown uuid {} in event filter", uuid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

#[async_trait]
impl EventFilter for UuidFilter {
    async fn matches(&self, event: &Event, _session: &mut Session) -> Result<bool> {
        let event_path = match event.path.as_deref() {
            Some(p) => p,
            None => return Ok(false),
        };
        Ok(self
            .paths
            .iter()
            .any(|p| path::is_self_or_descendant(event_path, p)))
    }
}

/// Matches events whose node is of one of the given node types (supertypes
/// included), as the node exists when the filter runs
pub struct NodeTypeFilter {
    types: Vec<String>,
}

impl NodeTypeFilter {
    pub fn new(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[async_trait]
impl EventFilter for NodeTypeFilter {
    async fn matches(&self, event: &Event, session: &mut Session) -> Result<bool> {
        let node_path = match event.node_path() {
            Some(p) => p.to_string(),
            None => return Ok(false),
        };
        if !session.node_exists(&node_path).await? {
            return Ok(false);
        }
        for node_type in &self.types {
            if session.is_node_type(&node_path, node_type).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Matches when every inner filter matches
pub struct AllOf {
    filters: Vec<Box<dyn EventFilter>>,
}

impl AllOf {
    pub fn new(filters: Vec<Box<dyn EventFilter>>) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl EventFilter for AllOf {
    async fn matches(&self, event: &Event, session: &mut Session) -> Result<bool> {
        for filter in &self.filters {
            if !filter.matches(event, session).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Buffered, forward-only view over filtered journal events
#[derive(Debug, Clone, Default)]
pub struct EventJournal {
    events: Vec<Event>,
    position: usize,
}

impl EventJournal {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, position: 0 }
    }

    /// Skip every remaining event dated before `date`.
    pub fn skip_to(&mut self, date: DateTime<Utc>) {
        while let Some(event) = self.events.get(self.position) {
            match event.date {
                Some(d) if d < date => self.position += 1,
                None => self.position += 1,
                _ => break,
            }
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }
}

impl Iterator for EventJournal {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let event = self.events.get(self.position).cloned()?;
        self.position += 1;
        Some(event)
    }
}
