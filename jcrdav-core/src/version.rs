//! Version operations on a session.

use tracing::info;

use crate::error::{Error, Result};
use crate::path;
use crate::session::Session;
use crate::transport::Capabilities;

impl Session {
    fn ensure_versioning(&self) -> Result<()> {
        self.ensure_live()?;
        Capabilities::require(self.capabilities().versioning, "versioning")
    }

    /// Check in the node at `path`; returns the path of the new version.
    pub async fn checkin(&mut self, path: &str) -> Result<String> {
        self.ensure_versioning()?;
        let path = path::normalize(path)?;
        let objects = self.objects();
        objects.node(&path).await?;
        if objects.has_pending_changes_under(&path) {
            return Err(Error::InvalidItemState(format!("{} has unsaved changes", path)));
        }

        let version = objects.transport_mut().checkin(&path).await?;
        objects.reload(&path).await?;
        info!("Checked in {} as {}", path, version);
        Ok(version)
    }

    pub async fn checkout(&mut self, path: &str) -> Result<()> {
        self.ensure_versioning()?;
        let path = path::normalize(path)?;
        let objects = self.objects();
        objects.node(&path).await?;
        objects.transport_mut().checkout(&path).await?;
        objects.reload(&path).await
    }

    /// Checked out unless the node says otherwise; nodes that are not
    /// versionable are always checked out.
    pub async fn is_checked_out(&mut self, path: &str) -> Result<bool> {
        self.ensure_live()?;
        let node = self.objects().node(path).await?;
        match node.property("jcr:isCheckedOut") {
            Some(prop) => prop.boolean(),
            None => Ok(true),
        }
    }

    /// Restore the node at `path` to the version at `version_path`.
    pub async fn restore(&mut self, remove_existing: bool, version_path: &str, path: &str) -> Result<()> {
        self.ensure_versioning()?;
        let path = path::normalize(path)?;
        let objects = self.objects();
        if objects.has_pending_changes() {
            return Err(Error::InvalidItemState(
                "cannot restore while the session has unsaved changes".to_string(),
            ));
        }

        objects
            .transport_mut()
            .restore(remove_existing, version_path, &path)
            .await?;
        objects.evict_subtree(&path);
        info!("Restored {} to {}", path, version_path);
        Ok(())
    }

    /// Remove version `name` from the version history at `history_path`.
    pub async fn remove_version(&mut self, history_path: &str, name: &str) -> Result<()> {
        self.ensure_versioning()?;
        let history_path = path::normalize(history_path)?;
        let objects = self.objects();
        objects.transport_mut().remove_version(&history_path, name).await?;
        let version = path::join(&history_path, name);
        objects.evict_subtree(&version);
        objects.note_child(&version, false);
        Ok(())
    }
}
