//! Typed, namespaced views over a [`KvStore`].
//!
//! Keys are `"{prefix}:{namespace}:{id}"`, optionally followed by
//! `":{field}"`, so task status, task error and embedding entries never
//! collide.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use glance_storage::records::{blob_to_f32, f32_to_blob};

use crate::error::QueryError;
use crate::kv::KvStore;
use crate::task::TaskState;

/// Values that can live in the cache.
pub trait CacheValue: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Option<Self>;
}

impl CacheValue for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl CacheValue for TaskState {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().and_then(TaskState::parse)
    }
}

/// A query embedding, stored as little-endian f32 bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(pub Vec<f32>);

impl CacheValue for Embedding {
    fn to_bytes(&self) -> Vec<u8> {
        f32_to_blob(&self.0)
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(Embedding(blob_to_f32(bytes)))
    }
}

/// One namespace of a shared store, holding values of type `V`.
pub struct TypedCache<V> {
    store: Arc<dyn KvStore>,
    prefix: String,
    namespace: &'static str,
    field: Option<&'static str>,
    ttl: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> TypedCache<V> {
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        namespace: &'static str,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            namespace,
            field: None,
            ttl,
            _value: PhantomData,
        }
    }

    /// Append `":{field}"` to every key.
    pub fn with_field(mut self, field: &'static str) -> Self {
        self.field = Some(field);
        self
    }

    pub fn key(&self, id: &str) -> String {
        match self.field {
            Some(field) => format!("{}:{}:{}:{}", self.prefix, self.namespace, id, field),
            None => format!("{}:{}:{}", self.prefix, self.namespace, id),
        }
    }

    /// Stored value, or `None` when missing, expired or undecodable.
    pub fn get(&self, id: &str) -> Result<Option<V>, QueryError> {
        Ok(self
            .store
            .get(&self.key(id))?
            .and_then(|bytes| V::from_bytes(&bytes)))
    }

    pub fn set(&self, id: &str, value: &V) -> Result<(), QueryError> {
        self.store.set(&self.key(id), value.to_bytes(), self.ttl)
    }

    pub fn delete(&self, id: &str) -> Result<(), QueryError> {
        self.store.delete(&self.key(id))
    }
}

/// Lowercase hex SHA-256 of `bytes`; the embedding cache key.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
