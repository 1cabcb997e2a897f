use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jervis_core::config::Config;
use jervis_core::hybrid_store::{HybridSearchStore, MockHybridStore, WeaviateStore};
use jervis_core::staging::StagingStore;
use jervis_harness::shutdown::ShutdownSignal;
use jervis_integrations::git_remote::GitPollingHandler;
use jervis_integrations::github::handler::GitHubIssueHandler;
use jervis_integrations::handler::PollingHandler;
use jervis_integrations::mail::{ImapPollingHandler, Pop3PollingHandler};
use jervis_integrations::wiki::WikiPollingHandler;
use jervis_intelligence::api_profiles::{ApiProfile, FailoverLlmProvider, ProfileRegistry, ProviderKind};
use jervis_intelligence::embedding::{Embedder, HttpEmbedder, MockEmbedder};
use jervis_intelligence::llm::{LlmProvider, LocalProvider, MockProvider};
use tracing::info;

use crate::indexer::ContinuousIndexer;
use crate::kpi::KpiCollector;
use crate::patrol::{log_report, PatrolRunner};
use crate::poller::CentralPoller;
use crate::schema_manager::SchemaManager;
use crate::task_engine::{
    ExecutionLoop, HttpOrchestratorGateway, LlmTaskQualifier, OrchestratorGateway,
    OrchestratorPollLoop, QualificationLoop,
};

/// Supervises the daemon's independent background loops: the patrol sweep,
/// KPI collection, and the three legs of the background task engine.
///
/// Each loop runs on its own `tokio::select!` against a shared
/// `ShutdownSignal`, so `shutdown()` drains every loop without the
/// Supervisor itself needing to track individual join handles beyond
/// waiting on them at teardown.
pub struct Supervisor {
    config: Config,
    store: Arc<StagingStore>,
    shutdown: ShutdownSignal,
}

impl Supervisor {
    /// Open (or create) the staging database from config and build a
    /// supervisor around it.
    pub async fn new(config: Config) -> Result<Self> {
        let store = StagingStore::new(&config.staging.database_path)
            .await
            .context("failed to open staging store")?;
        Ok(Self {
            config,
            store: Arc::new(store),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn with_store(config: Config, store: Arc<StagingStore>) -> Self {
        Self {
            config,
            store,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn store(&self) -> &Arc<StagingStore> {
        &self.store
    }

    /// Build the qualifier/orchestrator LLM provider from config.
    ///
    /// Every configured remote provider becomes a profile in a
    /// [`ProfileRegistry`]; the returned [`FailoverLlmProvider`] tries them
    /// in priority order and fails over to the next on error or rate limit
    /// (§4.10). Falls back to a local server or a no-op mock when no
    /// provider key is configured so the daemon still starts in a
    /// development environment.
    fn build_provider(&self) -> Arc<dyn LlmProvider> {
        let mut registry = ProfileRegistry::new();

        if let Some(env_var) = &self.config.providers.anthropic_key_env {
            let mut profile = ApiProfile::new("anthropic", ProviderKind::Anthropic);
            profile.api_key_env = env_var.clone();
            profile.priority = 0;
            registry.add_profile(profile);
        }
        if let Some(env_var) = &self.config.providers.openai_key_env {
            let mut profile = ApiProfile::new("openai", ProviderKind::OpenAi);
            profile.api_key_env = env_var.clone();
            profile.priority = 1;
            registry.add_profile(profile);
        }

        if !registry.ordered_candidates().is_empty() {
            return Arc::new(FailoverLlmProvider::new(registry));
        }
        if let Some(base_url) = &self.config.providers.local_base_url {
            return Arc::new(LocalProvider::new(base_url, None));
        }
        Arc::new(MockProvider::new())
    }

    /// Build the hybrid search store client. Mirrors
    /// [`Supervisor::build_provider`]'s fallback: no configured provider key
    /// means a key-less development run, so skip standing up a real
    /// Weaviate client and use the in-memory mock instead.
    fn has_configured_provider(&self) -> bool {
        self.config.providers.anthropic_key_env.is_some() || self.config.providers.openai_key_env.is_some()
    }

    fn build_hybrid_store(&self) -> (Arc<dyn HybridSearchStore>, u32) {
        if self.has_configured_provider() {
            (Arc::new(WeaviateStore::new(self.config.weaviate.base_url.clone())), 1536)
        } else {
            (Arc::new(MockHybridStore::new()), 8)
        }
    }

    fn build_embedder(&self) -> Arc<dyn Embedder> {
        if let Some(env_var) = &self.config.providers.openai_key_env {
            let key = std::env::var(env_var).ok();
            Arc::new(HttpEmbedder::new("https://api.openai.com", key))
        } else {
            Arc::new(MockEmbedder::new())
        }
    }

    fn build_poll_handlers(&self) -> Vec<Box<dyn PollingHandler>> {
        let workspace_root = self
            .config
            .general
            .workspace_root
            .clone()
            .unwrap_or_else(|| "~/.jervis/repos".to_string());
        vec![
            Box::new(GitHubIssueHandler),
            Box::new(WikiPollingHandler),
            Box::new(ImapPollingHandler),
            Box::new(Pop3PollingHandler),
            Box::new(GitPollingHandler::new(workspace_root)),
        ]
    }

    fn build_gateway(&self) -> Arc<dyn OrchestratorGateway> {
        let base_url = self
            .config
            .providers
            .planner_base_url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());
        Arc::new(HttpOrchestratorGateway::new(base_url))
    }

    /// Run every managed loop until the shutdown signal fires. Blocks until
    /// all loops have returned.
    pub async fn run(&self) -> Result<()> {
        info!(
            staging_db = %self.config.staging.database_path,
            "supervisor starting"
        );

        let provider = self.build_provider();
        let gateway = self.build_gateway();
        let qualifier_model = self
            .config
            .qualifier
            .model
            .clone()
            .unwrap_or_else(|| "claude-haiku-4-5".to_string());

        let (hybrid_store, vector_dimensions) = self.build_hybrid_store();
        let schema_manager = SchemaManager::new(
            hybrid_store.clone(),
            vector_dimensions,
            self.config.weaviate.auto_migrate.enabled,
            Duration::from_secs(self.config.weaviate.auto_migrate.countdown_seconds),
        );
        schema_manager
            .reconcile()
            .await
            .context("hybrid search schema reconciliation failed")?;

        let indexer = ContinuousIndexer::new(self.store.clone(), hybrid_store, self.build_embedder());
        let poller = CentralPoller::new(
            self.store.clone(),
            self.build_poll_handlers(),
            self.config.polling.max_concurrent_polls,
            Duration::from_millis(self.config.polling.http_interval_ms),
            Duration::from_millis(self.config.polling.imap_interval_ms),
            Duration::from_millis(self.config.polling.pop3_interval_ms),
        );

        let qualification_loop = QualificationLoop::new(
            self.store.clone(),
            Arc::new(LlmTaskQualifier::new(provider, qualifier_model)),
            self.config.background.qualification_concurrency,
            Duration::from_millis(self.config.qualifier.initial_backoff_ms),
            Duration::from_millis(self.config.qualifier.max_backoff_ms),
        );
        let execution_loop = ExecutionLoop::new(self.store.clone(), gateway.clone());
        let poll_loop = OrchestratorPollLoop::new(self.store.clone(), gateway);

        let patrol_runner = PatrolRunner::new(self.config.background.stale_threshold_secs);
        let store_for_patrol = self.store.clone();
        let shutdown_for_patrol = self.shutdown.clone();
        let wait_interval = Duration::from_secs(self.config.background.wait_interval_secs);

        let patrol_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(wait_interval);
            let mut shutdown_rx = shutdown_for_patrol.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match patrol_runner.run_patrol(&store_for_patrol).await {
                            Ok(report) => log_report(&report),
                            Err(e) => tracing::error!(error = %e, "patrol sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let kpi_store = self.store.clone();
        let shutdown_for_kpi = self.shutdown.clone();
        let kpi_handle = tokio::spawn(async move {
            let collector = KpiCollector::new();
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            let mut shutdown_rx = shutdown_for_kpi.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = collector.collect_snapshot(&kpi_store).await {
                            tracing::error!(error = %e, "kpi collection failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let poller_handle = {
            let shutdown = self.shutdown.clone();
            let startup_delay = Duration::from_millis(self.config.polling.startup_delay_ms);
            tokio::spawn(async move { poller.run(startup_delay, shutdown).await })
        };
        let indexer_handle = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { indexer.run(shutdown).await })
        };

        let qualification_handle = {
            let shutdown = self.shutdown.clone();
            let interval = Duration::from_millis(self.config.polling.polling_interval_ms);
            tokio::spawn(async move { qualification_loop.run(interval, shutdown).await })
        };
        let execution_handle = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { execution_loop.run(Duration::from_secs(2), shutdown).await })
        };
        let poll_handle = {
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move { poll_loop.run(Duration::from_secs(5), shutdown).await })
        };

        let _ = tokio::join!(
            patrol_handle,
            kpi_handle,
            poller_handle,
            indexer_handle,
            qualification_handle,
            execution_handle,
            poll_handle,
        );

        info!("supervisor stopped");
        Ok(())
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervisor_runs_until_shutdown() {
        let config = Config::default();
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let supervisor = Supervisor::with_store(config, store);
        let handle = supervisor.shutdown_handle();

        let run_task = tokio::spawn(async move { supervisor.run().await });
        handle.trigger();
        run_task.await.unwrap().unwrap();
    }
}
