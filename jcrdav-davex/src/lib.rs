//! Davex transport for jcrdav
//!
//! Connects a [`jcrdav_core::Session`] to a Jackrabbit-compatible server
//! over the Davex remoting protocol:
//! - JSON node reads, single and batched
//! - Diff-encoded saves with multipart value parts
//! - WebDAV locking, versioning, search and namespace/node type management
//! - Event journal feeds for observation

pub mod binary;
pub mod client;
pub mod config;
pub mod diff;
mod journal;
mod request;
pub mod xml;

pub use binary::DavexBinaries;
pub use client::DavexClient;
pub use config::DavexConfig;
pub use diff::{DiffEncoder, EncodedSave, WriteEncoder};

use jcrdav_core::{Result, Session, SessionRegistry};

/// Open a session as described by `config`
pub async fn connect(config: &DavexConfig, registry: &SessionRegistry) -> Result<Session> {
    let client = DavexClient::new(config)?;
    Session::login(
        Box::new(client),
        &config.credentials(),
        &config.workspace,
        config.session.clone(),
        registry,
    )
    .await
}
