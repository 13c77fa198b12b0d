//! The dmsg-HTTP server list carried inside boot parameters.
//!
//! Collaborators hand over a JSON file describing the dmsg infrastructure a
//! node should use; the record stores it re-serialized as one compact JSON
//! string so whitespace in the source file never inflates the fixed-size
//! boot-param region.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Addresses of the dmsg-HTTP infrastructure services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmsgHttpServers {
    #[serde(default)]
    pub dmsg_servers: Vec<String>,
    #[serde(default)]
    pub dmsg_discovery: String,
    #[serde(default)]
    pub transport_discovery: String,
    #[serde(default)]
    pub address_resolver: String,
    #[serde(default)]
    pub route_finder: String,
    #[serde(default)]
    pub uptime_tracker: String,
    #[serde(default)]
    pub service_discovery: String,
}

impl DmsgHttpServers {
    /// Load the server list from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading dmsg-HTTP server list '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing dmsg-HTTP server list '{}'", path.display()))
    }

    /// The compact JSON string stored in [`BootParams::dmsghttp_json`].
    ///
    /// [`BootParams::dmsghttp_json`]: crate::bootparams::BootParams
    pub fn to_compact_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing dmsg-HTTP server list")
    }

    /// Load a JSON file and normalize it to its compact form in one step.
    pub fn load_compact_json(path: &Path) -> Result<String> {
        Self::load(path)?.to_compact_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_normalizes_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dmsghttp.json");
        fs::write(
            &path,
            "{\n  \"dmsg_servers\": [\"dmsg.example.com\"],\n  \"dmsg_discovery\": \"disc.example.com\"\n}\n",
        )
        .unwrap();

        let compact = DmsgHttpServers::load_compact_json(&path).unwrap();
        assert!(!compact.contains('\n'));
        let back: DmsgHttpServers = serde_json::from_str(&compact).unwrap();
        assert_eq!(back.dmsg_servers, vec!["dmsg.example.com".to_string()]);
        assert_eq!(back.dmsg_discovery, "disc.example.com");
    }
}
