//! Hybrid Search Schema Manager (§4.11): runs once at startup, before the
//! poller or indexer start writing, to make sure every collection the
//! indexer needs exists and matches the vector index parameters this build
//! expects.

use jervis_core::hybrid_store::{CollectionSchema, HybridSearchStore, VectorIndexParams};
use jervis_harness::shutdown::ShutdownSignal;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("store error: {0}")]
    Store(#[from] jervis_core::hybrid_store::HybridStoreError),
    #[error("collection {collection} is incompatible with the desired schema and auto-migration is disabled")]
    IncompatibleSchemaMigrationDisabled { collection: String },
    #[error("schema migration for {collection} aborted")]
    MigrationAborted { collection: String },
}

/// The properties and vector params every source-kind collection uses
/// (§4.8 step 4 writes these, §4.11 provisions them).
fn desired_schemas(vector_dimensions: u32) -> Vec<CollectionSchema> {
    let index = VectorIndexParams::default();
    ["IssueChunk", "WikiChunk", "EmailChunk", "GitChunk"]
        .into_iter()
        .map(|name| CollectionSchema {
            name: name.to_string(),
            properties: vec![
                "artifactId".to_string(),
                "clientId".to_string(),
                "sourceKey".to_string(),
                "text".to_string(),
            ],
            vector_dimensions,
            index: index.clone(),
        })
        .collect()
}

pub struct SchemaManager {
    store: std::sync::Arc<dyn HybridSearchStore>,
    vector_dimensions: u32,
    auto_migrate: bool,
    countdown: std::time::Duration,
    abort: ShutdownSignal,
}

impl SchemaManager {
    pub fn new(
        store: std::sync::Arc<dyn HybridSearchStore>,
        vector_dimensions: u32,
        auto_migrate: bool,
        countdown: std::time::Duration,
    ) -> Self {
        Self {
            store,
            vector_dimensions,
            auto_migrate,
            countdown,
            abort: ShutdownSignal::new(),
        }
    }

    /// The handle an operator (or a `Ctrl-C` watcher) calls to abort a
    /// pending migration before its countdown elapses.
    pub fn abort_handle(&self) -> ShutdownSignal {
        self.abort.clone()
    }

    /// Reconcile every desired collection against the store's current
    /// schema. Missing collections are created outright; incompatible ones
    /// are migrated (drop + recreate) only if auto-migration is enabled,
    /// after waiting out the abort countdown; otherwise startup fails with a
    /// clear error naming the offending collection.
    pub async fn reconcile(&self) -> Result<(), SchemaError> {
        for desired in desired_schemas(self.vector_dimensions) {
            match self.store.get_schema(&desired.name).await? {
                None => {
                    tracing::info!(collection = %desired.name, "creating missing collection");
                    self.store.create_collection(&desired).await?;
                }
                Some(existing) if desired.compatible_with(&existing) => {
                    tracing::debug!(collection = %desired.name, "schema already compatible");
                }
                Some(_) if self.auto_migrate => {
                    tracing::warn!(
                        collection = %desired.name,
                        countdown_secs = self.countdown.as_secs(),
                        "incompatible schema detected, migrating after countdown"
                    );
                    if !self.wait_for_abort_window().await {
                        return Err(SchemaError::MigrationAborted {
                            collection: desired.name,
                        });
                    }
                    self.store.drop_collection(&desired.name).await?;
                    self.store.create_collection(&desired).await?;
                }
                Some(_) => {
                    return Err(SchemaError::IncompatibleSchemaMigrationDisabled {
                        collection: desired.name,
                    });
                }
            }
        }
        Ok(())
    }

    /// Waits out the countdown, returning `false` if `abort_handle().trigger()`
    /// fires first.
    async fn wait_for_abort_window(&self) -> bool {
        let mut abort_rx = self.abort.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.countdown) => true,
            _ = abort_rx.recv() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::hybrid_store::MockHybridStore;
    use std::time::Duration;

    #[tokio::test]
    async fn creates_missing_collections() {
        let store = std::sync::Arc::new(MockHybridStore::new());
        let manager = SchemaManager::new(store.clone(), 8, false, Duration::from_millis(1));
        manager.reconcile().await.unwrap();

        assert!(store.get_schema("IssueChunk").await.unwrap().is_some());
        assert!(store.get_schema("GitChunk").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fails_startup_on_incompatible_schema_when_auto_migrate_disabled() {
        let store = std::sync::Arc::new(MockHybridStore::new());
        let stale = CollectionSchema {
            name: "IssueChunk".to_string(),
            properties: vec!["text".to_string()],
            vector_dimensions: 4,
            index: VectorIndexParams::default(),
        };
        store.create_collection(&stale).await.unwrap();

        let manager = SchemaManager::new(store, 8, false, Duration::from_millis(1));
        let err = manager.reconcile().await.unwrap_err();
        assert!(matches!(err, SchemaError::IncompatibleSchemaMigrationDisabled { .. }));
    }

    #[tokio::test]
    async fn aborting_during_countdown_skips_the_migration() {
        let store = std::sync::Arc::new(MockHybridStore::new());
        let stale = CollectionSchema {
            name: "IssueChunk".to_string(),
            properties: vec!["text".to_string()],
            vector_dimensions: 4,
            index: VectorIndexParams::default(),
        };
        store.create_collection(&stale).await.unwrap();

        let manager = SchemaManager::new(store, 8, true, Duration::from_secs(30));
        let abort = manager.abort_handle();
        let reconcile = tokio::spawn(async move { manager.reconcile().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abort.trigger();

        let err = reconcile.await.unwrap().unwrap_err();
        assert!(matches!(err, SchemaError::MigrationAborted { .. }));
    }

    #[tokio::test]
    async fn migrates_incompatible_schema_when_auto_migrate_enabled() {
        let store = std::sync::Arc::new(MockHybridStore::new());
        let stale = CollectionSchema {
            name: "IssueChunk".to_string(),
            properties: vec!["text".to_string()],
            vector_dimensions: 4,
            index: VectorIndexParams::default(),
        };
        store.create_collection(&stale).await.unwrap();

        let manager = SchemaManager::new(store.clone(), 8, true, Duration::from_millis(1));
        manager.reconcile().await.unwrap();

        let migrated = store.get_schema("IssueChunk").await.unwrap().unwrap();
        assert_eq!(migrated.vector_dimensions, 8);
    }
}
