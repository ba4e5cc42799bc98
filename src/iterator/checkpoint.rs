//! Key/value checkpoint store for iterator state.

use crate::error::{AutotuneError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Saved state of an iterator tree.
///
/// Every iterator writes under its own prefix, so a checkpoint of a whole
/// pipeline is a flat map of `prefix.key` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    entries: BTreeMap<String, serde_json::Value>,
}

fn full_key(prefix: &str, key: &str) -> String {
    format!("{}.{}", prefix, key)
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Serialize>(&mut self, prefix: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.entries.insert(full_key(prefix, key), value);
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&self, prefix: &str, key: &str) -> Result<T> {
        let key = full_key(prefix, key);
        let value = self
            .entries
            .get(&key)
            .ok_or_else(|| AutotuneError::Checkpoint(format!("missing key '{}'", key)))?;
        serde_json::from_value(value.clone()).map_err(|e| {
            AutotuneError::Checkpoint(format!("malformed value for '{}': {}", key, e))
        })
    }

    pub fn contains(&self, prefix: &str, key: &str) -> bool {
        self.entries.contains_key(&full_key(prefix, key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AutotuneError::Checkpoint(format!("Failed to parse checkpoint: {}", e)))
    }
}
