//! In-memory document store with nested-tree path semantics.
//!
//! Mirrors the path model of a realtime document database closely enough
//! for tests and single-node runs: documents live in one JSON tree, `get`
//! on an interior path returns the subtree, and `conditional_create` is
//! atomic under the tree's write lock.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::DocumentStore;
use crate::common::errors::{StoreError, StoreResult};

/// Single-process `DocumentStore` backed by one JSON tree
#[derive(Debug, Default)]
pub struct InMemoryStore {
    root: RwLock<Value>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Value::Object(Map::new())),
        }
    }
}

fn split_path(path: &str) -> StoreResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(*segment)?;
    }
    Some(node)
}

/// Walk to the parent of the final segment, creating objects on the way
fn lookup_parent_mut<'a>(
    root: &'a mut Value,
    segments: &[&str],
) -> StoreResult<&'a mut Map<String, Value>> {
    let mut node = root;
    for segment in &segments[..segments.len() - 1] {
        let map = node
            .as_object_mut()
            .ok_or_else(|| StoreError::Backend(format!("path collides with a leaf at '{}'", segment)))?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| StoreError::Backend("path collides with a leaf document".to_string()))
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let segments = split_path(path)?;
        let root = self.root.read().await;
        Ok(lookup(&root, &segments).cloned())
    }

    async fn set(&self, path: &str, doc: Value) -> StoreResult<()> {
        let segments = split_path(path)?;
        let mut root = self.root.write().await;
        let parent = lookup_parent_mut(&mut root, &segments)?;
        parent.insert(segments[segments.len() - 1].to_string(), doc);
        Ok(())
    }

    async fn conditional_create(&self, path: &str, doc: Value) -> StoreResult<bool> {
        let segments = split_path(path)?;
        let mut root = self.root.write().await;
        let parent = lookup_parent_mut(&mut root, &segments)?;
        let key = segments[segments.len() - 1];
        if parent.contains_key(key) {
            return Ok(false);
        }
        parent.insert(key.to_string(), doc);
        Ok(true)
    }
}
