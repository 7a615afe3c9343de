//! What this node serves to others: local search and local actions
//!
//! The coordinator only depends on the [`LocalSearch`] and [`ActionHandler`]
//! traits. [`KeywordIndex`] is a small in-memory implementation used by the
//! standalone server and in tests.

use crate::cache::normalize_text;
use crate::error::{Error, Result};
use crate::types::SearchItem;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Search over data held by this node
#[async_trait]
pub trait LocalSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        options: &Map<String, Value>,
    ) -> Result<Vec<SearchItem>>;
}

/// Handler for one named action
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value>;
}

#[async_trait]
impl<F, Fut> ActionHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, params: Value) -> Result<Value> {
        (self)(params).await
    }
}

/// Named local action handlers
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<BTreeMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        debug!("Registered local action '{}'", name);
        self.handlers.write().insert(name, handler);
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub async fn execute(&self, action: &str, params: Value) -> Result<Value> {
        let handler = self
            .handlers
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("unknown action '{}'", action)))?;
        handler.handle(params).await
    }
}

/// A document held by [`KeywordIndex`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// In-memory keyword index. Scores a document by the fraction of distinct
/// query terms it contains.
#[derive(Default)]
pub struct KeywordIndex {
    docs: RwLock<Vec<Document>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document, returning whether it replaced one
    pub fn upsert(&self, doc: Document) -> bool {
        let mut docs = self.docs.write();
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => {
                *existing = doc;
                true
            }
            None => {
                docs.push(doc);
                false
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut docs = self.docs.write();
        let before = docs.len();
        docs.retain(|d| d.id != id);
        docs.len() != before
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `index_document` and `delete_document` actions backed by this
    /// index. They are each other's compensators in a transaction.
    pub fn register_actions(self: &Arc<Self>, actions: &ActionRegistry) {
        let index = Arc::clone(self);
        actions.register(
            "index_document",
            Arc::new(move |params: Value| {
                let index = Arc::clone(&index);
                async move {
                    let doc: Document = serde_json::from_value(params)
                        .map_err(|e| Error::InvalidRequest(format!("invalid document: {}", e)))?;
                    let id = doc.id.clone();
                    let replaced = index.upsert(doc);
                    Ok::<Value, Error>(json!({ "id": id, "replaced": replaced }))
                }
            }),
        );

        let index = Arc::clone(self);
        actions.register(
            "delete_document",
            Arc::new(move |params: Value| {
                let index = Arc::clone(&index);
                async move {
                    let id = params
                        .get("id")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| Error::InvalidRequest("missing 'id'".into()))?;
                    Ok::<Value, Error>(json!({ "id": id, "deleted": index.remove(id) }))
                }
            }),
        );
    }
}

#[async_trait]
impl LocalSearch for KeywordIndex {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        _options: &Map<String, Value>,
    ) -> Result<Vec<SearchItem>> {
        let normalized = normalize_text(query);
        let terms: HashSet<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.docs.read();
        let mut hits: Vec<SearchItem> = docs
            .iter()
            .filter_map(|doc| {
                let content = normalize_text(&doc.content);
                let words: HashSet<&str> = content.split(' ').collect();
                let matched = terms.iter().filter(|t| words.contains(*t)).count();
                if matched == 0 {
                    return None;
                }
                Some(SearchItem {
                    id: doc.id.clone(),
                    content: doc.content.clone(),
                    score: matched as f32 / terms.len() as f32,
                    metadata: doc.metadata.clone(),
                    source_node: None,
                })
            })
            .collect();

        // Stable sort keeps insertion order among equal scores
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }
}
