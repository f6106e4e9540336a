use std::path::Path;

use serde::Deserialize;

use crate::error::{ImageError, Result};

/// File name of the configuration document on the boot partition.
pub const CONFIG_FILE: &str = "fruit.json";

/// The configuration document read from a boot partition.
///
/// Only `public-key` is interpreted. Images receive the file's bytes unchanged, never
/// a re-serialized copy.
#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    #[serde(rename = "public-key", default)]
    public_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BootConfig {
    pub fn parse(raw: &[u8], path: &Path) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| ImageError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Read and parse the document, returning the raw bytes alongside it.
    pub async fn load(path: &Path) -> Result<(Vec<u8>, Self)> {
        let raw = tokio::fs::read(path).await.map_err(|e| ImageError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config = Self::parse(&raw, path)?;
        Ok((raw, config))
    }

    /// The configured public key, if it is present and not blank.
    pub fn public_key(&self) -> Option<&str> {
        self.public_key
            .as_deref()
            .map(str::trim)
            .filter(|pk| !pk.is_empty())
    }
}
