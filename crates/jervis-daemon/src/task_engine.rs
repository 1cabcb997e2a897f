//! Background Task Engine: the state machine driving a `Task` from
//! `READY_FOR_QUALIFICATION` through qualification, GPU execution, and
//! orchestrator hand-off to a terminal state.
//!
//! Three independent loops share the staging store as their only
//! coordination point:
//! - [`QualificationLoop`] drains `READY_FOR_QUALIFICATION` tasks through a
//!   [`TaskQualifier`], deciding whether a task needs a GPU execution pass at
//!   all or can resolve trivially.
//! - [`ExecutionLoop`] claims exactly one task at a time via
//!   `next_for_execution` (foreground first, then oldest background) and
//!   dispatches it to the [`OrchestratorGateway`].
//! - [`OrchestratorPollLoop`] polls in-flight `PYTHON_ORCHESTRATING` tasks for
//!   completion without tripping the planner circuit breaker on a single
//!   transient outage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Task, TaskMemory, TaskState};
use jervis_harness::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use jervis_harness::shutdown::ShutdownSignal;
use jervis_intelligence::llm::{LlmConfig, LlmMessage, LlmProvider};
use thiserror::Error;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Qualifier
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum QualifierError {
    #[error("llm error: {0}")]
    Llm(#[from] jervis_intelligence::llm::LlmError),
    #[error("could not parse qualifier response: {0}")]
    Parse(String),
}

/// Outcome of running a task through qualification.
#[derive(Debug, Clone)]
pub enum QualificationOutcome {
    /// The task needs a GPU execution pass.
    NeedsExecution,
    /// The task resolved without needing GPU execution; carries the summary
    /// to persist as `TaskMemory`.
    Trivial(String),
    /// The task is malformed or not actionable.
    Reject(String),
}

/// Decides whether a staged task needs a full GPU execution pass.
#[async_trait]
pub trait TaskQualifier: Send + Sync {
    async fn qualify(&self, task: &Task) -> Result<QualificationOutcome, QualifierError>;
}

/// LLM-backed qualifier. Asks a small/cheap model to classify the task as
/// one requiring GPU orchestration versus one it can answer directly.
pub struct LlmTaskQualifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmTaskQualifier {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    fn system_prompt() -> &'static str {
        "You triage background cognitive tasks. Reply with exactly one line: \
         either `EXECUTE` if the task requires running tools or a GPU-backed \
         orchestrator, `TRIVIAL: <answer>` if you can resolve it directly in \
         one or two sentences, or `REJECT: <reason>` if the task is malformed."
    }
}

#[async_trait]
impl TaskQualifier for LlmTaskQualifier {
    async fn qualify(&self, task: &Task) -> Result<QualificationOutcome, QualifierError> {
        let messages = vec![LlmMessage::user(format!(
            "task_type: {}\ncontent: {}",
            task.task_type, task.content
        ))];
        let config = LlmConfig {
            model: self.model.clone(),
            max_tokens: 512,
            temperature: 0.0,
            system_prompt: Some(Self::system_prompt().to_string()),
        };

        let response = self.provider.complete(&messages, &config).await?;
        let text = response.content.trim();

        if text.eq_ignore_ascii_case("EXECUTE") {
            Ok(QualificationOutcome::NeedsExecution)
        } else if let Some(rest) = text.strip_prefix("TRIVIAL:") {
            Ok(QualificationOutcome::Trivial(rest.trim().to_string()))
        } else if let Some(rest) = text.strip_prefix("REJECT:") {
            Ok(QualificationOutcome::Reject(rest.trim().to_string()))
        } else {
            Err(QualifierError::Parse(text.to_string()))
        }
    }
}

/// Drains `READY_FOR_QUALIFICATION` tasks with bounded concurrency.
pub struct QualificationLoop {
    store: Arc<StagingStore>,
    qualifier: Arc<dyn TaskQualifier>,
    concurrency: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl QualificationLoop {
    pub fn new(
        store: Arc<StagingStore>,
        qualifier: Arc<dyn TaskQualifier>,
        concurrency: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            store,
            qualifier,
            concurrency,
            initial_backoff,
            max_backoff,
        }
    }

    pub async fn run(&self, poll_interval: Duration, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(poll_interval);
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "qualification pass failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("qualification loop shutting down");
                    break;
                }
            }
        }
    }

    /// Runs one qualification pass immediately, without waiting on an
    /// interval tick. Exposed for integration tests exercising the pipeline
    /// end-to-end; the running daemon only ever calls this through `run`.
    pub async fn drain_once_for_test(&self) {
        if let Err(e) = self.drain_once().await {
            error!(error = %e, "qualification pass failed");
        }
    }

    async fn drain_once(&self) -> anyhow::Result<()> {
        let tasks = self
            .store
            .next_for_qualification(self.concurrency as i64)
            .await
            .map_err(|e| anyhow::anyhow!("next_for_qualification failed: {}", e))?;

        for task in tasks {
            if let Err(e) = self.qualify_one(task).await {
                error!(error = %e, "failed to process qualification outcome");
            }
        }
        Ok(())
    }

    async fn qualify_one(&self, mut task: Task) -> anyhow::Result<()> {
        if !self
            .store
            .cas_task_state(task.id, TaskState::ReadyForQualification, TaskState::Qualifying)
            .await
            .map_err(|e| anyhow::anyhow!("cas to QUALIFYING failed: {}", e))?
        {
            // Another worker claimed it first.
            return Ok(());
        }
        task.state = TaskState::Qualifying;

        match self.qualifier.qualify(&task).await {
            Ok(QualificationOutcome::NeedsExecution) => {
                self.store
                    .cas_task_state(task.id, TaskState::Qualifying, TaskState::ReadyForGpu)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas to READY_FOR_GPU failed: {}", e))?;
            }
            Ok(QualificationOutcome::Trivial(summary)) => {
                self.store
                    .insert_task_memory(&TaskMemory {
                        task_id: task.id,
                        summary: summary.clone(),
                        structured_result: serde_json::Value::Null,
                        created_at: chrono::Utc::now(),
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("insert_task_memory failed: {}", e))?;
                self.store
                    .cas_task_state(task.id, TaskState::Qualifying, TaskState::Done)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas to DONE failed: {}", e))?;
            }
            Ok(QualificationOutcome::Reject(reason)) => {
                task.state = TaskState::Qualifying;
                task.error_message = Some(reason.clone());
                self.store
                    .upsert_task(&task)
                    .await
                    .map_err(|e| anyhow::anyhow!("upsert_task failed: {}", e))?;
                self.store
                    .cas_task_state(task.id, TaskState::Qualifying, TaskState::Error)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas to ERROR failed: {}", e))?;
                warn!(task_id = %task.id, reason, "task rejected at qualification");
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "qualification call failed, scheduling retry");
                task.schedule_qualification_retry(self.initial_backoff, self.max_backoff);
                self.store
                    .upsert_task(&task)
                    .await
                    .map_err(|e| anyhow::anyhow!("upsert_task failed: {}", e))?;
                self.store
                    .cas_task_state(task.id, TaskState::Qualifying, TaskState::ReadyForQualification)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas back to READY_FOR_QUALIFICATION failed: {}", e))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("circuit open")]
    CircuitOpen,
    #[error("planner returned an error: {0}")]
    Planner(String),
}

impl From<CircuitBreakerError> for GatewayError {
    fn from(e: CircuitBreakerError) -> Self {
        match e {
            CircuitBreakerError::Open => GatewayError::CircuitOpen,
            other => GatewayError::Planner(other.to_string()),
        }
    }
}

/// Outcome of polling an in-flight orchestrator thread.
#[derive(Debug, Clone)]
pub enum OrchestratorPoll {
    Running,
    Completed { summary: String },
    Failed(String),
}

/// Provider-agnostic handle to an external task orchestrator (the "planner").
/// Dispatch hands a qualified task off for GPU-backed execution; poll checks
/// on a previously dispatched thread without blocking.
#[async_trait]
pub trait OrchestratorGateway: Send + Sync {
    async fn dispatch(&self, task: &Task) -> Result<String, GatewayError>;
    async fn poll(&self, thread_id: &str) -> Result<OrchestratorPoll, GatewayError>;
}

/// HTTP-backed gateway to a planner service, wrapped in a circuit breaker
/// tuned to tolerate transient planner outages without erroring in-flight
/// tasks (see [`CircuitBreakerConfig::for_planner`]).
pub struct HttpOrchestratorGateway {
    client: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
}

impl HttpOrchestratorGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::for_planner()),
        }
    }
}

#[async_trait]
impl OrchestratorGateway for HttpOrchestratorGateway {
    async fn dispatch(&self, task: &Task) -> Result<String, GatewayError> {
        let url = format!("{}/v1/threads", self.base_url);
        let client = self.client.clone();
        let body = serde_json::json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "content": task.content,
            "attachments": task.attachments,
        });

        #[derive(serde::Deserialize)]
        struct DispatchResponse {
            thread_id: String,
        }

        let resp: DispatchResponse = self
            .breaker
            .call(|| async {
                client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(GatewayError::Http)?
                    .json::<DispatchResponse>()
                    .await
                    .map_err(GatewayError::Http)
            })
            .await?;

        Ok(resp.thread_id)
    }

    async fn poll(&self, thread_id: &str) -> Result<OrchestratorPoll, GatewayError> {
        let url = format!("{}/v1/threads/{}", self.base_url, thread_id);
        let client = self.client.clone();

        #[derive(serde::Deserialize)]
        #[serde(tag = "status", rename_all = "snake_case")]
        enum PollResponse {
            Running,
            Completed { summary: String },
            Failed { reason: String },
        }

        let resp: PollResponse = self
            .breaker
            .call(|| async {
                client
                    .get(&url)
                    .send()
                    .await
                    .map_err(GatewayError::Http)?
                    .json::<PollResponse>()
                    .await
                    .map_err(GatewayError::Http)
            })
            .await?;

        Ok(match resp {
            PollResponse::Running => OrchestratorPoll::Running,
            PollResponse::Completed { summary } => OrchestratorPoll::Completed { summary },
            PollResponse::Failed { reason } => OrchestratorPoll::Failed(reason),
        })
    }
}

// ---------------------------------------------------------------------------
// Execution loop
// ---------------------------------------------------------------------------

/// Claims and dispatches exactly one task at a time. `next_for_execution`
/// already orders foreground tasks ahead of background ones, so preemption
/// falls naturally out of claim order: a newly-arrived foreground task wins
/// the next claim even while older background tasks wait. Mid-flight
/// cancellation of an already-dispatched background orchestrator call is not
/// modeled — the gateway has no cancel endpoint to call.
pub struct ExecutionLoop {
    store: Arc<StagingStore>,
    gateway: Arc<dyn OrchestratorGateway>,
}

impl ExecutionLoop {
    pub fn new(store: Arc<StagingStore>, gateway: Arc<dyn OrchestratorGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn run(&self, poll_interval: Duration, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(poll_interval);
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.claim_and_dispatch().await {
                        error!(error = %e, "execution claim failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("execution loop shutting down");
                    break;
                }
            }
        }
    }

    /// Claims and dispatches one task immediately. Exposed for integration
    /// tests exercising the pipeline end-to-end.
    pub async fn claim_and_dispatch_for_test(&self) {
        if let Err(e) = self.claim_and_dispatch().await {
            error!(error = %e, "execution claim failed");
        }
    }

    async fn claim_and_dispatch(&self) -> anyhow::Result<()> {
        let Some(mut task) = self
            .store
            .next_for_execution()
            .await
            .map_err(|e| anyhow::anyhow!("next_for_execution failed: {}", e))?
        else {
            return Ok(());
        };

        if !self
            .store
            .cas_task_state(task.id, TaskState::ReadyForGpu, TaskState::DispatchedGpu)
            .await
            .map_err(|e| anyhow::anyhow!("cas to DISPATCHED_GPU failed: {}", e))?
        {
            return Ok(());
        }
        task.state = TaskState::DispatchedGpu;

        match self.gateway.dispatch(&task).await {
            Ok(thread_id) => {
                task.orchestrator_thread_id = Some(thread_id);
                self.store
                    .upsert_task(&task)
                    .await
                    .map_err(|e| anyhow::anyhow!("upsert_task failed: {}", e))?;
                self.store
                    .cas_task_state(task.id, TaskState::DispatchedGpu, TaskState::PythonOrchestrating)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas to PYTHON_ORCHESTRATING failed: {}", e))?;
                info!(task_id = %task.id, "task dispatched to orchestrator");
            }
            Err(GatewayError::CircuitOpen) => {
                warn!(task_id = %task.id, "planner circuit open, rewinding to READY_FOR_GPU");
                self.store
                    .cas_task_state(task.id, TaskState::DispatchedGpu, TaskState::ReadyForGpu)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas rewind failed: {}", e))?;
            }
            Err(e) => {
                task.error_message = Some(e.to_string());
                self.store
                    .upsert_task(&task)
                    .await
                    .map_err(|e| anyhow::anyhow!("upsert_task failed: {}", e))?;
                self.store
                    .cas_task_state(task.id, TaskState::DispatchedGpu, TaskState::Error)
                    .await
                    .map_err(|e| anyhow::anyhow!("cas to ERROR failed: {}", e))?;
                error!(task_id = %task.id, error = %e, "dispatch failed");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator poll loop
// ---------------------------------------------------------------------------

/// Polls `PYTHON_ORCHESTRATING` tasks for completion. A planner outage
/// (circuit open) leaves tasks untouched rather than erroring them — the
/// stale-recovery sweep in [`crate::patrol`] is what eventually reclaims a
/// thread that never comes back.
pub struct OrchestratorPollLoop {
    store: Arc<StagingStore>,
    gateway: Arc<dyn OrchestratorGateway>,
}

impl OrchestratorPollLoop {
    pub fn new(store: Arc<StagingStore>, gateway: Arc<dyn OrchestratorGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn run(&self, poll_interval: Duration, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(poll_interval);
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "orchestrator poll pass failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("orchestrator poll loop shutting down");
                    break;
                }
            }
        }
    }

    /// Runs one orchestrator poll pass immediately. Exposed for integration
    /// tests exercising the pipeline end-to-end.
    pub async fn poll_once_for_test(&self) {
        if let Err(e) = self.poll_once().await {
            error!(error = %e, "orchestrator poll pass failed");
        }
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let tasks = self
            .store
            .tasks_in_state(TaskState::PythonOrchestrating)
            .await
            .map_err(|e| anyhow::anyhow!("tasks_in_state failed: {}", e))?;

        for mut task in tasks {
            let Some(thread_id) = task.orchestrator_thread_id.clone() else {
                continue;
            };

            match self.gateway.poll(&thread_id).await {
                Ok(OrchestratorPoll::Running) => {}
                Ok(OrchestratorPoll::Completed { summary }) => {
                    self.store
                        .insert_task_memory(&TaskMemory {
                            task_id: task.id,
                            summary,
                            structured_result: serde_json::Value::Null,
                            created_at: chrono::Utc::now(),
                        })
                        .await
                        .map_err(|e| anyhow::anyhow!("insert_task_memory failed: {}", e))?;
                    self.store
                        .cas_task_state(task.id, TaskState::PythonOrchestrating, TaskState::Done)
                        .await
                        .map_err(|e| anyhow::anyhow!("cas to DONE failed: {}", e))?;
                    info!(task_id = %task.id, "task completed by orchestrator");
                }
                Ok(OrchestratorPoll::Failed(reason)) => {
                    task.error_message = Some(reason.clone());
                    self.store
                        .upsert_task(&task)
                        .await
                        .map_err(|e| anyhow::anyhow!("upsert_task failed: {}", e))?;
                    self.store
                        .cas_task_state(task.id, TaskState::PythonOrchestrating, TaskState::Error)
                        .await
                        .map_err(|e| anyhow::anyhow!("cas to ERROR failed: {}", e))?;
                    warn!(task_id = %task.id, reason, "task failed in orchestrator");
                }
                Err(GatewayError::CircuitOpen) => {
                    // Transient planner outage; leave the task in place.
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "poll failed, will retry next tick");
                }
            }
        }
        Ok(())
    }
}
