//! Session options.

use serde::{Deserialize, Serialize};

/// Tunables of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Levels of children returned with every node read
    pub fetch_depth: u32,
    /// Read binary values into memory instead of handing out deferred streams
    pub eager_binaries: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            fetch_depth: 0,
            eager_binaries: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let options: SessionOptions = serde_json::from_str(r#"{"fetch_depth": 2}"#).unwrap();
        assert_eq!(options.fetch_depth, 2);
        assert!(!options.eager_binaries);
        assert_eq!(SessionOptions::default().fetch_depth, 0);
    }
}
