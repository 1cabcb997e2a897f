//! Continuous Indexer (§4.8): the only writer into the hybrid search store.
//! Drains `NEW` artifacts from the staging store, normalizes and chunks
//! their content, embeds each chunk, and writes the result idempotently. The
//! indexer never calls a source API — it only reads what the poller already
//! staged.

use std::sync::Arc;
use std::time::Duration;

use jervis_core::hybrid_store::{HybridSearchStore, VectorRecord};
use jervis_core::staging::StagingStore;
use jervis_core::text::{chunk_by_tokens, normalize_text};
use jervis_core::types::{ArtifactState, LinkVerdict, SourceKind, StagedArtifact};
use jervis_harness::security::{build_review_task, LinkSafetyEvaluator, LinkSafetyQualifier};
use jervis_harness::shutdown::ShutdownSignal;
use jervis_intelligence::embedding::{EmbeddingKind, Embedder};
use tracing::{error, info, warn};

/// Default context window model budget; kept conservative so the 90% safety
/// margin leaves headroom even for the smallest configured model.
const DEFAULT_MODEL_CONTEXT_TOKENS: usize = 8192;
const SAFETY_MARGIN: f64 = 0.9;
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_secs(30);
const BATCH_SIZE: i64 = 20;

/// Crude URL scan over chunk text: whitespace-delimited tokens starting with
/// a scheme. Good enough for the link-safety pass; the indexer doesn't need
/// a full HTML/markdown parser to find candidate links.
fn find_urls(text: &str) -> Vec<&str> {
    text.split_whitespace()
        .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
        .map(|tok| tok.trim_end_matches(['.', ',', ')', ']', '"', '\'']))
        .collect()
}

fn embedding_kind_for(source: &SourceKind) -> EmbeddingKind {
    match source {
        SourceKind::Git => EmbeddingKind::Code,
        SourceKind::IssueTracker | SourceKind::Wiki | SourceKind::Email => EmbeddingKind::Text,
    }
}

/// Pull the text worth indexing out of an artifact's `full_content`,
/// matching the field names each handler actually writes (github/issues.rs,
/// mail.rs, wiki.rs, git_remote.rs) rather than a generic `"text"` key no
/// producer emits.
fn extract_text(artifact: &StagedArtifact) -> String {
    let content = &artifact.full_content;
    let str_field = |key: &str| content.get(key).and_then(|v| v.as_str()).unwrap_or_default();

    match artifact.source {
        SourceKind::IssueTracker => {
            let comments = content
                .get("comments")
                .and_then(|v| v.as_array())
                .map(|comments| {
                    comments
                        .iter()
                        .filter_map(|c| c.get("body").and_then(|b| b.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                })
                .unwrap_or_default();
            format!("{}\n\n{}\n\n{comments}", str_field("title"), str_field("body"))
        }
        SourceKind::Email => format!("{}\n\n{}", str_field("text_body"), str_field("html_body")),
        SourceKind::Wiki => format!("{}\n\n{}", str_field("title"), str_field("body")),
        SourceKind::Git => format!("{}\n\n{}", str_field("message"), str_field("diff")),
    }
}

fn collection_for(source: &SourceKind) -> &'static str {
    match source {
        SourceKind::IssueTracker => "IssueChunk",
        SourceKind::Wiki => "WikiChunk",
        SourceKind::Email => "EmailChunk",
        SourceKind::Git => "GitChunk",
    }
}

pub struct ContinuousIndexer {
    store: Arc<StagingStore>,
    hybrid_store: Arc<dyn HybridSearchStore>,
    embedder: Arc<dyn Embedder>,
}

impl ContinuousIndexer {
    pub fn new(
        store: Arc<StagingStore>,
        hybrid_store: Arc<dyn HybridSearchStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            hybrid_store,
            embedder,
        }
    }

    async fn scan_links(&self, artifact: &StagedArtifact, text: &str) {
        let qualifier = match self.store.list_enabled_patterns().await {
            Ok(patterns) => LinkSafetyQualifier::new(&patterns),
            Err(e) => {
                warn!(error = %e, "failed to load learned link patterns, skipping link scan");
                return;
            }
        };
        let evaluator = LinkSafetyEvaluator::new(&self.store, qualifier);

        for url in find_urls(text) {
            match evaluator.evaluate(url, artifact.client_id, text).await {
                Ok(classification) if classification.verdict == LinkVerdict::Uncertain => {
                    let task = build_review_task(url, text, artifact.client_id, artifact.project_id);
                    if let Err(e) = self.store.upsert_task(&task).await {
                        error!(url, error = %e, "failed to raise link safety review task");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(url, error = %e, "link safety evaluation failed"),
            }
        }
    }

    /// Index one artifact: normalize, chunk, embed, write, mark terminal
    /// state. Returns `Ok(true)` if this call actually claimed and processed
    /// the artifact (`false` if another worker won the claim race).
    async fn index_one(&self, artifact: StagedArtifact) -> anyhow::Result<bool> {
        if !self.store.claim_for_indexing(artifact.id).await? {
            return Ok(false);
        }

        let raw_text = extract_text(&artifact);
        let normalized = normalize_text(&raw_text);
        self.scan_links(&artifact, &normalized).await;

        let chunks = chunk_by_tokens(&normalized, DEFAULT_MODEL_CONTEXT_TOKENS, SAFETY_MARGIN);
        let collection = collection_for(&artifact.source);
        let kind = embedding_kind_for(&artifact.source);

        for (i, chunk) in chunks.iter().enumerate() {
            let vector = match self.embedder.embed(chunk, kind).await {
                Ok(v) => v,
                Err(e) => {
                    self.store.mark_failed(artifact.id, e.to_string()).await?;
                    return Ok(true);
                }
            };
            let chunk_id = format!("{}:{i}", artifact.id);
            let record = VectorRecord {
                collection: collection.to_string(),
                chunk_id: chunk_id.clone(),
                vector,
                properties: serde_json::json!({
                    "artifactId": artifact.id.to_string(),
                    "clientId": artifact.client_id.to_string(),
                    "sourceKey": artifact.source_key,
                    "text": chunk,
                }),
            };
            if let Err(e) = self.hybrid_store.upsert_chunk(record).await {
                self.store.mark_failed(artifact.id, e.to_string()).await?;
                return Ok(true);
            }
        }

        self.store
            .mark_indexed(artifact.id, chunks.len() as u32, Some(format!("{}:0", artifact.id)))
            .await?;
        Ok(true)
    }

    /// Drain one batch of `NEW` artifacts. Returns the number actually
    /// claimed and processed (an empty result means the queue was empty, or
    /// every candidate lost its claim race to another worker).
    pub async fn run_once(&self) -> usize {
        let artifacts = match self.store.list_new_artifacts(BATCH_SIZE).await {
            Ok(a) => a,
            Err(e) => {
                error!(error = %e, "failed to list new artifacts");
                return 0;
            }
        };

        let mut processed = 0;
        for artifact in artifacts {
            let id = artifact.id;
            match self.index_one(artifact).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(artifact = %id, error = %e, "indexing failed");
                    if let Err(mark_err) = self.store.mark_failed(id, e.to_string()).await {
                        error!(artifact = %id, error = %mark_err, "failed to record indexing failure");
                    }
                }
            }
        }
        processed
    }

    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            let processed = self.run_once().await;
            if processed > 0 {
                info!(processed, "indexed batch");
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(EMPTY_QUEUE_BACKOFF) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

/// Snapshot of artifact counts by state, used by the supervisor's KPI loop.
pub async fn count_by_state(store: &StagingStore, state: ArtifactState) -> u64 {
    store.count_artifacts_by_state(state).await.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::hybrid_store::MockHybridStore;
    use jervis_intelligence::embedding::MockEmbedder;
    use uuid::Uuid;

    /// Mirrors the `full_content` shape `github/issues.rs::issue_to_artifact`
    /// actually writes, not a generic `"text"` key no handler emits.
    fn sample_artifact(body: &str) -> StagedArtifact {
        StagedArtifact::new(
            SourceKind::IssueTracker,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
            "ISSUE-1",
            serde_json::json!({
                "number": 1,
                "title": "sample issue",
                "body": body,
                "comments": [{"author": "alice", "body": "a reply"}],
            }),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn indexes_a_new_artifact_and_marks_it_indexed() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let hybrid = Arc::new(MockHybridStore::new());
        let embedder = Arc::new(MockEmbedder::new());
        let indexer = ContinuousIndexer::new(store.clone(), hybrid.clone(), embedder);

        let artifact = sample_artifact("hello world, this is staged content");
        store.upsert_if_newer(&artifact).await.unwrap();

        let processed = indexer.run_once().await;
        assert_eq!(processed, 1);

        let remaining = store.list_new_artifacts(10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn second_claim_attempt_is_a_no_op() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let hybrid = Arc::new(MockHybridStore::new());
        let embedder = Arc::new(MockEmbedder::new());
        let indexer = ContinuousIndexer::new(store.clone(), hybrid, embedder);

        let artifact = sample_artifact("some text");
        let id = artifact.id;
        store.upsert_if_newer(&artifact).await.unwrap();
        store.claim_for_indexing(id).await.unwrap();

        let processed = indexer.index_one(artifact).await.unwrap();
        assert!(!processed);
    }

    #[test]
    fn finds_urls_in_text() {
        let text = "see https://example.com/docs and also http://foo.test/bar.";
        let urls = find_urls(text);
        assert_eq!(urls, vec!["https://example.com/docs", "http://foo.test/bar"]);
    }

    #[test]
    fn extract_text_pulls_title_body_and_comments_for_issues() {
        let artifact = sample_artifact("issue body text");
        let text = extract_text(&artifact);
        assert!(text.contains("sample issue"));
        assert!(text.contains("issue body text"));
        assert!(text.contains("a reply"));
    }

    #[test]
    fn extract_text_pulls_text_and_html_body_for_email() {
        let artifact = StagedArtifact::new(
            SourceKind::Email,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
            "msg-1",
            serde_json::json!({"text_body": "plain text", "html_body": "<p>rich</p>"}),
            chrono::Utc::now(),
        );
        let text = extract_text(&artifact);
        assert!(text.contains("plain text"));
        assert!(text.contains("<p>rich</p>"));
    }

    #[test]
    fn extract_text_pulls_title_and_body_for_wiki() {
        let artifact = StagedArtifact::new(
            SourceKind::Wiki,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
            "space/page-1",
            serde_json::json!({"title": "Page Title", "body": "page content"}),
            chrono::Utc::now(),
        );
        let text = extract_text(&artifact);
        assert!(text.contains("Page Title"));
        assert!(text.contains("page content"));
    }

    #[test]
    fn extract_text_pulls_message_and_diff_for_git() {
        let artifact = StagedArtifact::new(
            SourceKind::Git,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
            "abc123",
            serde_json::json!({"message": "fix bug", "diff": "- old\n+ new"}),
            chrono::Utc::now(),
        );
        let text = extract_text(&artifact);
        assert!(text.contains("fix bug"));
        assert!(text.contains("- old"));
    }
}
