//! Hybrid search store client (§4.11): schema provisioning and chunk
//! persistence against a Weaviate-compatible vector database. The indexer
//! (§4.8) only ever calls `upsert_chunk`; schema lifecycle is owned entirely
//! by the schema manager at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum HybridStoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("store returned an error: {0}")]
    Store(String),
}

impl From<reqwest::Error> for HybridStoreError {
    fn from(e: reqwest::Error) -> Self {
        HybridStoreError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Schema types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DistanceMetric {
    Cosine,
}

/// HNSW vector index parameters for one collection (§4.11 step 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexParams {
    pub distance: DistanceMetric,
    pub ef: u32,
    pub ef_construction: u32,
    pub max_connections: u32,
    /// Below this many vectors, the store may use a flat index instead of
    /// HNSW; purely a hint the store is free to honor or ignore.
    pub flat_search_cutoff: u32,
}

impl Default for VectorIndexParams {
    fn default() -> Self {
        Self {
            distance: DistanceMetric::Cosine,
            ef: 100,
            ef_construction: 128,
            max_connections: 64,
            flat_search_cutoff: 10_000,
        }
    }
}

/// Desired or observed shape of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub properties: Vec<String>,
    pub vector_dimensions: u32,
    pub index: VectorIndexParams,
}

impl CollectionSchema {
    /// Whether `other` can serve as a drop-in replacement for `self` without
    /// a migration — i.e. no dimension, distance, or HNSW parameter change.
    /// New properties alone don't require a migration (§4.11 step 2).
    pub fn compatible_with(&self, other: &CollectionSchema) -> bool {
        self.vector_dimensions == other.vector_dimensions && self.index == other.index
    }
}

/// A single chunk ready to be written to the store (§4.8 step 4).
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub collection: String,
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub properties: serde_json::Value,
}

// ---------------------------------------------------------------------------
// HybridSearchStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HybridSearchStore: Send + Sync {
    async fn get_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, HybridStoreError>;
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), HybridStoreError>;
    async fn drop_collection(&self, collection: &str) -> Result<(), HybridStoreError>;
    /// Write one chunk. Keyed by `(collection, chunk_id)` so repeated calls
    /// for the same chunk overwrite rather than duplicate (§4.8: "Writes
    /// must be idempotent").
    async fn upsert_chunk(&self, record: VectorRecord) -> Result<(), HybridStoreError>;
}

/// Deterministic object id derived from `(collection, chunk_id)` so repeated
/// upserts of the same chunk hit the same Weaviate object rather than
/// accumulating duplicates.
fn object_id(collection: &str, chunk_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{collection}:{chunk_id}").as_bytes())
}

// ---------------------------------------------------------------------------
// WeaviateStore — REST client
// ---------------------------------------------------------------------------

pub struct WeaviateStore {
    base_url: String,
    client: reqwest::Client,
}

impl WeaviateStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HybridSearchStore for WeaviateStore {
    async fn get_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, HybridStoreError> {
        let url = format!("{}/v1/schema/{}", self.base_url, collection);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(HybridStoreError::Store(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        let body: WeaviateClassResponse = resp.json().await?;
        Ok(Some(body.into()))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), HybridStoreError> {
        let url = format!("{}/v1/schema", self.base_url);
        let payload = WeaviateClassRequest::from(schema);
        let resp = self.client.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(HybridStoreError::Store(format!(
                "POST {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), HybridStoreError> {
        let url = format!("{}/v1/schema/{}", self.base_url, collection);
        let resp = self.client.delete(&url).send().await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(HybridStoreError::Store(format!(
                "DELETE {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn upsert_chunk(&self, record: VectorRecord) -> Result<(), HybridStoreError> {
        let id = object_id(&record.collection, &record.chunk_id);
        let url = format!("{}/v1/objects/{}", self.base_url, id);
        let payload = serde_json::json!({
            "class": record.collection,
            "id": id,
            "vector": record.vector,
            "properties": record.properties,
        });
        let resp = self.client.put(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(HybridStoreError::Store(format!(
                "PUT {} returned {}",
                url,
                resp.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WeaviateClassRequest {
    class: String,
    properties: Vec<WeaviatePropertyRequest>,
    #[serde(rename = "vectorIndexConfig")]
    vector_index_config: WeaviateVectorIndexConfig,
}

#[derive(Debug, Serialize)]
struct WeaviatePropertyRequest {
    name: String,
    #[serde(rename = "dataType")]
    data_type: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WeaviateVectorIndexConfig {
    distance: String,
    ef: u32,
    #[serde(rename = "efConstruction")]
    ef_construction: u32,
    #[serde(rename = "maxConnections")]
    max_connections: u32,
}

impl From<&CollectionSchema> for WeaviateClassRequest {
    fn from(schema: &CollectionSchema) -> Self {
        Self {
            class: schema.name.clone(),
            properties: schema
                .properties
                .iter()
                .map(|p| WeaviatePropertyRequest {
                    name: p.clone(),
                    data_type: vec!["text".to_string()],
                })
                .collect(),
            vector_index_config: WeaviateVectorIndexConfig {
                distance: "cosine".to_string(),
                ef: schema.index.ef,
                ef_construction: schema.index.ef_construction,
                max_connections: schema.index.max_connections,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct WeaviateClassResponse {
    class: String,
    #[serde(default)]
    properties: Vec<WeaviatePropertyResponse>,
    #[serde(rename = "vectorIndexConfig", default)]
    vector_index_config: Option<WeaviateVectorIndexConfig>,
}

#[derive(Debug, Deserialize)]
struct WeaviatePropertyResponse {
    name: String,
}

impl From<WeaviateClassResponse> for CollectionSchema {
    fn from(resp: WeaviateClassResponse) -> Self {
        let index = resp
            .vector_index_config
            .map(|c| VectorIndexParams {
                distance: DistanceMetric::Cosine,
                ef: c.ef,
                ef_construction: c.ef_construction,
                max_connections: c.max_connections,
                flat_search_cutoff: VectorIndexParams::default().flat_search_cutoff,
            })
            .unwrap_or_default();
        Self {
            name: resp.class,
            properties: resp.properties.into_iter().map(|p| p.name).collect(),
            vector_dimensions: 0,
            index,
        }
    }
}

// ---------------------------------------------------------------------------
// MockHybridStore — in-memory, for daemon tests and key-less dev runs
// ---------------------------------------------------------------------------

pub struct MockHybridStore {
    schemas: tokio::sync::Mutex<std::collections::HashMap<String, CollectionSchema>>,
    chunks: tokio::sync::Mutex<std::collections::HashMap<(String, String), VectorRecord>>,
}

impl MockHybridStore {
    pub fn new() -> Self {
        Self {
            schemas: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            chunks: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub async fn chunk_count(&self) -> usize {
        self.chunks.lock().await.len()
    }
}

impl Default for MockHybridStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HybridSearchStore for MockHybridStore {
    async fn get_schema(&self, collection: &str) -> Result<Option<CollectionSchema>, HybridStoreError> {
        Ok(self.schemas.lock().await.get(collection).cloned())
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), HybridStoreError> {
        self.schemas.lock().await.insert(schema.name.clone(), schema.clone());
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), HybridStoreError> {
        self.schemas.lock().await.remove(collection);
        self.chunks.lock().await.retain(|(c, _), _| c != collection);
        Ok(())
    }

    async fn upsert_chunk(&self, record: VectorRecord) -> Result<(), HybridStoreError> {
        let key = (record.collection.clone(), record.chunk_id.clone());
        self.chunks.lock().await.insert(key, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(dims: u32) -> CollectionSchema {
        CollectionSchema {
            name: "IssueTracker".into(),
            properties: vec!["text".into(), "sourceKey".into()],
            vector_dimensions: dims,
            index: VectorIndexParams::default(),
        }
    }

    #[test]
    fn schema_compatible_when_dimensions_and_index_match() {
        assert!(schema(768).compatible_with(&schema(768)));
    }

    #[test]
    fn schema_incompatible_on_dimension_change() {
        assert!(!schema(768).compatible_with(&schema(1536)));
    }

    #[test]
    fn schema_incompatible_on_hnsw_param_change() {
        let mut other = schema(768);
        other.index.ef_construction += 1;
        assert!(!schema(768).compatible_with(&other));
    }

    #[test]
    fn object_id_is_deterministic_per_chunk() {
        let a = object_id("IssueTracker", "chunk-1");
        let b = object_id("IssueTracker", "chunk-1");
        let c = object_id("IssueTracker", "chunk-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn mock_store_round_trips_schema_and_chunks() {
        let store = MockHybridStore::new();
        assert!(store.get_schema("IssueTracker").await.unwrap().is_none());

        store.create_collection(&schema(768)).await.unwrap();
        assert!(store.get_schema("IssueTracker").await.unwrap().is_some());

        store
            .upsert_chunk(VectorRecord {
                collection: "IssueTracker".into(),
                chunk_id: "chunk-1".into(),
                vector: vec![0.1, 0.2],
                properties: serde_json::json!({"text": "hello"}),
            })
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await, 1);

        // Re-upsert of the same chunk id overwrites rather than duplicates.
        store
            .upsert_chunk(VectorRecord {
                collection: "IssueTracker".into(),
                chunk_id: "chunk-1".into(),
                vector: vec![0.3, 0.4],
                properties: serde_json::json!({"text": "updated"}),
            })
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await, 1);

        store.drop_collection("IssueTracker").await.unwrap();
        assert!(store.get_schema("IssueTracker").await.unwrap().is_none());
        assert_eq!(store.chunk_count().await, 0);
    }
}
