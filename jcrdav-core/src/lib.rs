//! jcrdav core library
//!
//! Client-side model of a hierarchical content repository:
//! - Items (nodes and properties) with lifecycle state
//! - Per-session object cache with batched, ordered saves
//! - Transport abstraction over the wire protocol
//! - Locking, versioning, queries and journal-based observation
//! - In-memory transport for tests and offline use

pub mod binary;
pub mod config;
pub mod error;
pub mod item;
pub mod lock;
pub mod memory;
pub mod namespace;
pub mod node_type;
pub mod object_manager;
pub mod observation;
pub mod path;
pub mod query;
pub mod session;
pub mod transport;
pub mod value;
mod version;
pub mod write_log;

pub use binary::{BinarySource, BinaryStream, SessionKey, SessionRegistry};
pub use config::SessionOptions;
pub use error::{Error, ErrorKind, Result};
pub use item::{ItemState, Node, Property};
pub use lock::Lock;
pub use memory::InMemoryTransport;
pub use node_type::NodeTypeInfo;
pub use observation::{
    AcceptAll, AllOf, Event, EventFilter, EventJournal, EventType, EventTypeFilter, NodeTypeFilter, PathFilter,
    UuidFilter,
};
pub use query::qom::QueryObjectModel;
pub use query::{Query, QueryLanguage, QueryResult, Row, RowIterator};
pub use session::Session;
pub use transport::{Capabilities, Credentials, DescriptorValue, Descriptors, LockRequest, NodeData, Transport};
pub use value::{PropertyType, Value};
pub use write_log::{PropertySnapshot, WriteLog, WriteOp};
