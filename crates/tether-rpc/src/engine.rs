//! In-memory document engine served over the transport.
//!
//! Documents are JSON objects with a string `id`, grouped by collection (the
//! request's `collection`, or `"default"`). State lives in memory; the
//! [`Persistence`] impl snapshots it to a JSON file and reloads it at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_core::{CallArgs, EngineError, HandlerResult, MethodRegistry, Persistence};
use tokio::sync::RwLock;
use tracing::{debug, info};

const DEFAULT_COLLECTION: &str = "default";
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of the store.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    collections: BTreeMap<String, Vec<Value>>,
}

/// Collections of JSON documents, in insertion order.
pub struct DocumentStore {
    collections: RwLock<BTreeMap<String, Vec<Value>>>,
    data_file: Option<PathBuf>,
    next_id: AtomicU64,
}

impl DocumentStore {
    pub fn new(data_file: Option<PathBuf>) -> Self {
        Self {
            collections: RwLock::new(BTreeMap::new()),
            data_file,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn data_file(&self) -> Option<&Path> {
        self.data_file.as_deref()
    }

    fn generate_id(&self, taken: &impl Fn(&str) -> bool) -> String {
        loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let id = format!("doc-{}", n);
            if !taken(&id) {
                return id;
            }
        }
    }

    /// Add one document, assigning an `id` if it has none.
    pub async fn insert(&self, collection: &str, doc: Value) -> Result<Value, EngineError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let doc = self.prepare(doc, |id| position(docs, id).is_some())?;
        docs.push(doc.clone());
        Ok(doc)
    }

    /// Add several documents. All are validated before any is stored.
    pub async fn insert_many(&self, collection: &str, batch: Vec<Value>) -> Result<Vec<String>, EngineError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();

        let existing: &[Value] = docs;
        let mut staged: Vec<Value> = Vec::with_capacity(batch.len());
        for doc in batch {
            let prepared = self.prepare(doc, |id| {
                position(existing, id).is_some() || position(&staged, id).is_some()
            })?;
            staged.push(prepared);
        }

        let ids = staged.iter().filter_map(doc_id).map(str::to_string).collect();
        docs.extend(staged);
        Ok(ids)
    }

    fn prepare(&self, doc: Value, taken: impl Fn(&str) -> bool) -> Result<Value, EngineError> {
        let Value::Object(mut fields) = doc else {
            return Err(EngineError::invalid_params("document must be an object"));
        };
        match fields.get("id") {
            None | Some(Value::Null) => {
                fields.insert("id".to_string(), Value::String(self.generate_id(&taken)));
            }
            Some(Value::String(id)) => {
                if taken(id) {
                    return Err(EngineError::invalid_params(format!("duplicate id '{}'", id)));
                }
            }
            Some(_) => return Err(EngineError::invalid_params("document id must be a string")),
        }
        Ok(Value::Object(fields))
    }

    /// Merge `patch` into the document's top-level fields. The id never changes.
    pub async fn update(&self, collection: &str, id: &str, patch: &Map<String, Value>) -> Result<Value, EngineError> {
        let mut collections = self.collections.write().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| {
                let index = position(docs, id)?;
                docs.get_mut(index)
            })
            .ok_or_else(|| EngineError::NotFound(format!("document '{}' in '{}'", id, collection)))?;

        if let Value::Object(fields) = doc {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(doc.clone())
    }

    pub async fn remove(&self, collection: &str, id: &str) -> bool {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return false;
        };
        match position(docs, id) {
            Some(index) => {
                docs.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empty a collection. Returns how many documents were dropped.
    pub async fn clear(&self, collection: &str) -> usize {
        let mut collections = self.collections.write().await;
        collections.remove(collection).map_or(0, |docs| docs.len())
    }

    pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
        let collections = self.collections.read().await;
        let docs = collections.get(collection)?;
        position(docs, id).map(|i| docs[i].clone())
    }

    pub async fn count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, Vec::len)
    }

    /// Documents accepted by `keep`, in insertion order.
    pub async fn find<F>(&self, collection: &str, keep: F) -> Vec<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| keep(d)).cloned().collect())
            .unwrap_or_default()
    }

    /// Rank documents by how many distinct query terms their `text` contains.
    ///
    /// Each hit is the document plus a `_score` field. Ties keep insertion
    /// order; documents sharing no term are left out.
    pub async fn search<F>(&self, collection: &str, query: &str, top_k: Option<usize>, keep: F) -> Vec<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Vec::new();
        };

        let mut hits: Vec<(usize, &Value)> = docs
            .iter()
            .filter(|d| keep(d))
            .filter_map(|doc| {
                let text = doc.get("text").and_then(Value::as_str)?;
                let score = tokenize(text).intersection(&terms).count();
                (score > 0).then_some((score, doc))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        if let Some(k) = top_k {
            hits.truncate(k);
        }

        hits.into_iter()
            .map(|(score, doc)| {
                let mut doc = doc.clone();
                if let Value::Object(fields) = &mut doc {
                    fields.insert("_score".to_string(), Value::from(score));
                }
                doc
            })
            .collect()
    }

    async fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            collections: self.collections.read().await.clone(),
        }
    }
}

#[async_trait]
impl Persistence for DocumentStore {
    async fn initialize(&self) -> Result<(), EngineError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        if !tokio::fs::try_exists(path).await? {
            info!("No snapshot at {}, starting empty", path.display());
            return Ok(());
        }

        let bytes = tokio::fs::read(path).await?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Other(format!("corrupt snapshot {}: {}", path.display(), e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Other(format!(
                "snapshot {} has version {}, expected {}",
                path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            )));
        }

        let total: usize = snapshot.collections.values().map(Vec::len).sum();
        *self.collections.write().await = snapshot.collections;
        info!(
            "Loaded {} documents from {} (saved {})",
            total,
            path.display(),
            snapshot.saved_at
        );
        Ok(())
    }

    async fn save_to_storage(&self) -> Result<(), EngineError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };

        let snapshot = self.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a crash never leaves a half-written snapshot.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}

fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("id").and_then(Value::as_str)
}

fn position(docs: &[Value], id: &str) -> Option<usize> {
    docs.iter().position(|d| doc_id(d) == Some(id))
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn collection_of(args: &CallArgs) -> String {
    args.collection().unwrap_or(DEFAULT_COLLECTION).to_string()
}

// Handlers. Each takes the shared store plus the call's arguments.

async fn insert(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let doc = args.require(0)?.clone();
    store.insert(&collection_of(&args), doc).await
}

async fn insert_many(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let batch = args
        .require(0)?
        .as_array()
        .cloned()
        .ok_or_else(|| EngineError::invalid_params("insertMany expects an array"))?;
    let ids = store.insert_many(&collection_of(&args), batch).await?;
    Ok(serde_json::json!({ "inserted": ids.len(), "ids": ids }))
}

async fn update(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let id = args.str(0)?;
    let patch = args
        .require(1)?
        .as_object()
        .ok_or_else(|| EngineError::invalid_params("update expects a patch object"))?;
    store.update(&collection_of(&args), id, patch).await
}

async fn remove(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let removed = store.remove(&collection_of(&args), args.str(0)?).await;
    Ok(serde_json::json!({ "removed": removed }))
}

async fn clear(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let removed = store.clear(&collection_of(&args)).await;
    Ok(serde_json::json!({ "removed": removed }))
}

async fn get(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    Ok(store
        .get(&collection_of(&args), args.str(0)?)
        .await
        .unwrap_or(Value::Null))
}

async fn count(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    Ok(Value::from(store.count(&collection_of(&args)).await))
}

async fn find(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let predicate = args.predicate(0);
    let docs = store
        .find(&collection_of(&args), |doc| predicate.map_or(true, |p| p.matches(doc)))
        .await;
    Ok(Value::Array(docs))
}

async fn search(store: Arc<DocumentStore>, args: CallArgs) -> HandlerResult {
    let query = args.str(0)?;
    let top_k = match args.options(1).and_then(|o| o.get("topK")) {
        None | Some(Value::Null) => None,
        Some(k) => Some(
            k.as_u64()
                .ok_or_else(|| EngineError::invalid_params("topK must be a non-negative integer"))?
                as usize,
        ),
    };
    let filter = args.option_predicate(1, "filter");

    let hits = store
        .search(&collection_of(&args), query, top_k, |doc| {
            filter.map_or(true, |p| p.matches(doc))
        })
        .await;
    Ok(Value::Array(hits))
}

/// Adapt a store handler to the registry's `Fn(CallArgs)` shape.
fn bind<F, Fut>(store: &Arc<DocumentStore>, handler: F) -> impl Fn(CallArgs) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<DocumentStore>, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let store = store.clone();
    move |args| handler(store.clone(), args)
}

/// The engine's method table.
pub fn registry(store: &Arc<DocumentStore>) -> tether_core::Result<MethodRegistry> {
    MethodRegistry::builder()
        .mutating("insert", bind(store, insert))
        .mutating("insertMany", bind(store, insert_many))
        .mutating("update", bind(store, update))
        .mutating("remove", bind(store, remove))
        .mutating("clear", bind(store, clear))
        .method("get", bind(store, get))
        .method("count", bind(store, count))
        .method("find", bind(store, find))
        .method("search", bind(store, search))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tether_core::server::Param;
    use tether_core::Predicate;

    fn args(values: Vec<Value>) -> CallArgs {
        CallArgs::from_values(values)
    }

    async fn call(store: &Arc<DocumentStore>, method: &str, args: CallArgs) -> HandlerResult {
        let registry = registry(store).unwrap();
        let handler = registry.get(method).unwrap();
        handler(args).await
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_rejects_duplicates() {
        let store = Arc::new(DocumentStore::new(None));

        let doc = call(&store, "insert", args(vec![json!({"text": "a"})])).await.unwrap();
        assert!(doc["id"].as_str().unwrap().starts_with("doc-"));

        call(&store, "insert", args(vec![json!({"id": "x", "text": "b"})])).await.unwrap();
        let err = call(&store, "insert", args(vec![json!({"id": "x"})])).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams { .. }));

        assert_eq!(call(&store, "count", args(vec![])).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let store = Arc::new(DocumentStore::new(None));
        let err = call(
            &store,
            "insertMany",
            args(vec![json!([{"id": "a"}, {"id": "a"}])]),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(store.count(DEFAULT_COLLECTION).await, 0);

        let result = call(&store, "insertMany", args(vec![json!([{"id": "a"}, {}])]))
            .await
            .unwrap();
        assert_eq!(result["inserted"], json!(2));
    }

    #[tokio::test]
    async fn test_update_remove_clear() {
        let store = Arc::new(DocumentStore::new(None));
        store.insert("c", json!({"id": "a", "n": 1})).await.unwrap();
        store.insert("c", json!({"id": "b", "n": 2})).await.unwrap();

        let scoped = |values| CallArgs::new(values_to_params(values), Some("c".to_string()));

        let updated = call(&store, "update", scoped(vec![json!("a"), json!({"n": 5, "id": "zzz"})]))
            .await
            .unwrap();
        assert_eq!(updated, json!({"id": "a", "n": 5}));

        let missing = call(&store, "update", scoped(vec![json!("nope"), json!({})])).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));

        assert_eq!(
            call(&store, "remove", scoped(vec![json!("b")])).await.unwrap(),
            json!({"removed": true})
        );
        assert_eq!(call(&store, "get", scoped(vec![json!("b")])).await.unwrap(), Value::Null);
        assert_eq!(
            call(&store, "clear", scoped(vec![])).await.unwrap(),
            json!({"removed": 1})
        );
    }

    fn values_to_params(values: Vec<Value>) -> Vec<Param> {
        values.into_iter().map(Param::Value).collect()
    }

    #[tokio::test]
    async fn test_search_scores_term_overlap() {
        let store = Arc::new(DocumentStore::new(None));
        for (id, text) in [
            ("a", "hello there"),
            ("b", "Hello, world!"),
            ("c", "unrelated"),
            ("d", "world says hello"),
        ] {
            store.insert("docs", json!({"id": id, "text": text})).await.unwrap();
        }

        let hits = store.search("docs", "hello world", None, |_| true).await;
        let ids: Vec<&str> = hits.iter().map(|h| h["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "d", "a"]);
        assert_eq!(hits[0]["_score"], json!(2));

        let top = store.search("docs", "hello world", Some(1), |_| true).await;
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_search_with_option_filter() {
        let store = Arc::new(DocumentStore::new(None));
        store.insert("default", json!({"id": "a", "text": "hello", "lang": "en"})).await.unwrap();
        store.insert("default", json!({"id": "b", "text": "hello", "lang": "fr"})).await.unwrap();

        let mut fields = Map::new();
        fields.insert("topK".into(), json!(5));
        let mut predicates = BTreeMap::new();
        predicates.insert(
            "filter".to_string(),
            Arc::new(Predicate::compile("d => d.lang == 'fr'").unwrap()),
        );
        let search_args = CallArgs::new(
            vec![Param::Value(json!("hello")), Param::Options { fields, predicates }],
            None,
        );

        let hits = call(&store, "search", search_args).await.unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(hits[0]["id"], json!("b"));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = DocumentStore::new(Some(path.clone()));
        store.initialize().await.unwrap();
        store.insert("docs", json!({"id": "a", "text": "kept"})).await.unwrap();
        store.save_to_storage().await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reloaded = DocumentStore::new(Some(path));
        reloaded.initialize().await.unwrap();
        assert_eq!(
            reloaded.get("docs", "a").await,
            Some(json!({"id": "a", "text": "kept"}))
        );
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_fails_initialize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = DocumentStore::new(Some(path));
        assert!(store.initialize().await.is_err());
    }
}
