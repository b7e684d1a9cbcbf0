// Shared across test binaries; not every binary touches every helper.
#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use procyon::{Cache, CacheError};

/// In-memory cache double mirroring the adapter's semantics: `set` stores a
/// string, `hmset` replaces the whole hash. Can be told to fail to exercise
/// best-effort paths.
#[derive(Debug, Default)]
pub struct RecordingCache {
    pub strings: HashMap<String, String>,
    pub hashes: HashMap<String, HashMap<String, String>>,
    pub set_calls: usize,
    pub hmset_calls: usize,
    pub fail: bool,
}

impl RecordingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self, key: &str) -> Option<&HashMap<String, String>> {
        self.hashes.get(key)
    }

    fn induced_failure() -> CacheError {
        CacheError::Serialize(serde_json::from_str::<()>("induced failure").unwrap_err())
    }
}

#[async_trait]
impl Cache for RecordingCache {
    async fn set(&mut self, key: &str, value: &str) -> Result<(), CacheError> {
        self.set_calls += 1;
        if self.fail {
            return Err(Self::induced_failure());
        }
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hmset(&mut self, key: &str, pairs: &[(String, String)]) -> Result<(), CacheError> {
        self.hmset_calls += 1;
        if self.fail {
            return Err(Self::induced_failure());
        }
        self.hashes
            .insert(key.to_string(), pairs.iter().cloned().collect());
        Ok(())
    }
}
