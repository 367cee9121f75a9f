//! Content catalog — maps plan content references to message text.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{ChannelError, ConfigError};

/// Message bodies keyed by content reference, loaded from a flat JSON object:
///
/// ```json
/// { "intro_nudge_30m": "Still there? ...", "payment_nudge_1h": "..." }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContentCatalog {
    entries: HashMap<String, String>,
}

impl ContentCatalog {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let entries: HashMap<String, String> = serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseError(format!("content catalog: {e}")))?;
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(path = %path.display(), entries = catalog.len(), "Content catalog loaded");
        Ok(catalog)
    }

    pub fn insert(&mut self, content_ref: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(content_ref.into(), text.into());
    }

    /// Text for `content_ref`; unknown references are a delivery error.
    pub fn resolve(&self, content_ref: &str) -> Result<&str, ChannelError> {
        self.entries
            .get(content_ref)
            .map(String::as_str)
            .ok_or_else(|| ChannelError::UnknownContent(content_ref.to_string()))
    }

    /// Plan references that have no text in this catalog.
    pub fn missing<'a>(&self, refs: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        refs.into_iter()
            .filter(|r| !self.entries.contains_key(*r))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
