//! Connection configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use jcrdav_core::{Credentials, SessionOptions};

/// Everything needed to open a session against a Davex server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DavexConfig {
    /// Server entry point, e.g. `http://localhost:8080/server/`
    pub server_uri: String,
    pub workspace: String,
    pub user: String,
    pub password: String,
    /// Verify the workspace and server version at login
    pub check_login_on_server: bool,
    pub timeout_secs: u64,
    /// Headers added to every request
    pub default_headers: BTreeMap<String, String>,
    /// Send `Expect: 100-continue` with request bodies
    pub send_expect: bool,
    /// Data attached to events caused by this session's writes
    pub user_data: Option<String>,
    pub session: SessionOptions,
}

impl Default for DavexConfig {
    fn default() -> Self {
        Self {
            server_uri: "http://localhost:8080/server/".to_string(),
            workspace: "default".to_string(),
            user: "admin".to_string(),
            password: "admin".to_string(),
            check_login_on_server: true,
            timeout_secs: 300,
            default_headers: BTreeMap::new(),
            send_expect: false,
            user_data: None,
            session: SessionOptions::default(),
        }
    }
}

impl DavexConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DavexConfig = toml::from_str(content).context("Invalid TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.server_uri.starts_with("http://") || self.server_uri.starts_with("https://")) {
            anyhow::bail!("server_uri must be an http(s) URL, got '{}'", self.server_uri);
        }
        if self.workspace.is_empty() {
            anyhow::bail!("workspace must not be empty");
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }
}
