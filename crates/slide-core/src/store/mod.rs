//! Key-value persistence for refs.
//!
//! Persisted refs store their schema-encoded value under one key each. The
//! store is an injected service so tests and hosts can pick their backend.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Process-local key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remove a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}
