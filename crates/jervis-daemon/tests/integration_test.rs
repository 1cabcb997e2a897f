//! End-to-end coverage of the task pipeline: a task staged as
//! `READY_FOR_QUALIFICATION` moves through qualification, GPU dispatch, and
//! orchestrator completion using the real staging store and task engine
//! loops, with an in-memory LLM provider and a stub orchestrator gateway
//! standing in for the external planner.

use std::sync::Arc;

use async_trait::async_trait;
use jervis_core::staging::StagingStore;
use jervis_core::types::{ProcessingMode, Task, TaskState};
use jervis_daemon::task_engine::{
    ExecutionLoop, GatewayError, LlmTaskQualifier, OrchestratorGateway, OrchestratorPoll,
    QualificationLoop,
};
use jervis_intelligence::llm::{LlmResponse, MockProvider};
use uuid::Uuid;

struct StubGateway;

#[async_trait]
impl OrchestratorGateway for StubGateway {
    async fn dispatch(&self, _task: &Task) -> Result<String, GatewayError> {
        Ok("thread-e2e".into())
    }
    async fn poll(&self, _thread_id: &str) -> Result<OrchestratorPoll, GatewayError> {
        Ok(OrchestratorPoll::Completed {
            summary: "ingested and indexed".into(),
        })
    }
}

fn mock_response(content: &str) -> LlmResponse {
    LlmResponse {
        content: content.to_string(),
        model: "mock-model".into(),
        input_tokens: 10,
        output_tokens: 5,
        finish_reason: "end_turn".into(),
    }
}

#[tokio::test]
async fn task_flows_from_qualification_through_orchestrator_completion() {
    let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
    let client_id = Uuid::new_v4();
    let task = Task::new(
        "INGEST_SUMMARY",
        "{\"artifact_id\": \"abc\"}",
        client_id,
        ProcessingMode::Background,
    );
    let task_id = task.id;
    store.upsert_task(&task).await.unwrap();

    let provider = Arc::new(MockProvider::new().with_response(mock_response("EXECUTE")));
    let qualifier = Arc::new(LlmTaskQualifier::new(provider, "mock-model"));
    let qualification_loop = QualificationLoop::new(
        store.clone(),
        qualifier,
        8,
        std::time::Duration::from_millis(100),
        std::time::Duration::from_secs(60),
    );
    qualification_loop.drain_once_for_test().await;

    let ready = store.tasks_in_state(TaskState::ReadyForGpu).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, task_id);

    let gateway = Arc::new(StubGateway);
    let execution_loop = ExecutionLoop::new(store.clone(), gateway.clone());
    execution_loop.claim_and_dispatch_for_test().await;

    let orchestrating = store
        .tasks_in_state(TaskState::PythonOrchestrating)
        .await
        .unwrap();
    assert_eq!(orchestrating.len(), 1);
    assert_eq!(
        orchestrating[0].orchestrator_thread_id.as_deref(),
        Some("thread-e2e")
    );

    let poll_loop = jervis_daemon::task_engine::OrchestratorPollLoop::new(store.clone(), gateway);
    poll_loop.poll_once_for_test().await;

    let done = store.tasks_in_state(TaskState::Done).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, task_id);
}

#[tokio::test]
async fn rejected_task_lands_in_error_state() {
    let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
    let client_id = Uuid::new_v4();
    let task = Task::new("INGEST_SUMMARY", "{}", client_id, ProcessingMode::Background);
    store.upsert_task(&task).await.unwrap();

    let provider = Arc::new(
        MockProvider::new().with_response(mock_response("REJECT: malformed content")),
    );
    let qualifier = Arc::new(LlmTaskQualifier::new(provider, "mock-model"));
    let qualification_loop = QualificationLoop::new(
        store.clone(),
        qualifier,
        8,
        std::time::Duration::from_millis(100),
        std::time::Duration::from_secs(60),
    );
    qualification_loop.drain_once_for_test().await;

    let errored = store.tasks_in_state(TaskState::Error).await.unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(
        errored[0].error_message.as_deref(),
        Some("malformed content")
    );
}
