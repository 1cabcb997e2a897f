use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unverified,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Basic,
    Bearer,
    ApiKey,
}

/// Polymorphic connection payload, persisted as a tagged variant rather than
/// through inheritance so the discriminator travels with the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionKind {
    Http {
        base_url: String,
        auth_type: AuthType,
        credentials: Option<String>,
        timeout_ms: u64,
    },
    Imap {
        host: String,
        port: u16,
        username: String,
        password: String,
        use_ssl: bool,
        folder_name: String,
    },
    Pop3 {
        host: String,
        port: u16,
        username: String,
        password: String,
        use_ssl: bool,
    },
    Oauth2 {
        provider: String,
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_second: Option<u32>,
    pub max_requests_per_minute: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: Some(5),
            max_requests_per_minute: Some(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub rate_limit: RateLimitConfig,
    pub state: ConnectionState,
    pub kind: ConnectionKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_invalid_reason: Option<String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, kind: ConnectionKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            rate_limit: RateLimitConfig::default(),
            state: ConnectionState::Unverified,
            kind,
            created_at: now,
            updated_at: now,
            last_invalid_reason: None,
        }
    }

    /// The domain key used by the rate limiter (host of an HTTP base_url, or
    /// the IMAP/POP3 host directly).
    pub fn rate_limit_domain(&self) -> String {
        match &self.kind {
            ConnectionKind::Http { base_url, .. } => base_url
                .split("://")
                .nth(1)
                .and_then(|rest| rest.split('/').next())
                .unwrap_or(base_url)
                .to_string(),
            ConnectionKind::Imap { host, .. } => host.clone(),
            ConnectionKind::Pop3 { host, .. } => host.clone(),
            ConnectionKind::Oauth2 { provider, .. } => provider.clone(),
        }
    }

    /// Only a `testConnection` call may set `state = Valid`.
    pub fn mark_valid(&mut self) {
        self.state = ConnectionState::Valid;
        self.last_invalid_reason = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.state = ConnectionState::Invalid;
        self.last_invalid_reason = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// ConnectionFilter / Client / Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionFilter {
    pub connection_id: Uuid,
    pub project_keys: Vec<String>,
    pub wiki_spaces: Vec<String>,
    pub mail_folders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub connection_ids: Vec<Uuid>,
    pub filters: Vec<ConnectionFilter>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub filters: Vec<ConnectionFilter>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Project-level filters override client-level filters for the same connection.
    pub fn effective_filter(&self, client: &Client, connection_id: Uuid) -> Option<ConnectionFilter> {
        self.filters
            .iter()
            .find(|f| f.connection_id == connection_id)
            .or_else(|| client.filters.iter().find(|f| f.connection_id == connection_id))
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Staged artifact lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    New,
    Indexing,
    Indexed,
    Failed,
}

impl ArtifactState {
    pub fn can_transition_to(&self, target: ArtifactState) -> bool {
        matches!(
            (self, target),
            (ArtifactState::New, ArtifactState::Indexing)
                | (ArtifactState::Indexing, ArtifactState::Indexed)
                | (ArtifactState::Indexing, ArtifactState::Failed)
                | (ArtifactState::Indexed, ArtifactState::New)
                | (ArtifactState::Failed, ArtifactState::New)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceKind {
    IssueTracker,
    Wiki,
    Email,
    Git,
}

/// A single ingested item, shared shape across all source kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedArtifact {
    pub id: Uuid,
    pub source: SourceKind,
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub connection_id: Uuid,
    pub source_key: String,
    pub full_content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub external_updated_at: DateTime<Utc>,
    pub state: ArtifactState,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub indexing_error: Option<String>,
    pub chunk_count: u32,
    pub main_doc_id: Option<String>,
}

impl StagedArtifact {
    pub fn new(
        source: SourceKind,
        client_id: Uuid,
        project_id: Option<Uuid>,
        connection_id: Uuid,
        source_key: impl Into<String>,
        full_content: serde_json::Value,
        external_updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            client_id,
            project_id,
            connection_id,
            source_key: source_key.into(),
            full_content,
            created_at: Utc::now(),
            external_updated_at,
            state: ArtifactState::New,
            last_indexed_at: None,
            indexing_error: None,
            chunk_count: 0,
            main_doc_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Polling cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollingCursor {
    pub connection_id: Uuid,
    pub last_fetched_uid: Option<u64>,
    pub last_etag: Option<String>,
    pub last_changelog_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Link safety
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkVerdict {
    Safe,
    Unsafe,
    Uncertain,
    /// Not evaluated at all: an ordinary (non-tracker) image URL. Distinct
    /// from `Uncertain` so callers never raise a review task for it.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkClassification {
    pub verdict: LinkVerdict,
    pub reason: String,
    pub suggested_pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsafeLink {
    pub url: String,
    pub reason: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: Uuid,
    pub pattern: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedLink {
    pub url: String,
    pub client_id: Uuid,
    pub indexed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    ReadyForQualification,
    Qualifying,
    ReadyForGpu,
    DispatchedGpu,
    PythonOrchestrating,
    Done,
    UserTask,
    Error,
}

impl TaskState {
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (ReadyForQualification, Qualifying)
                | (Qualifying, ReadyForQualification) // retry backoff
                | (Qualifying, ReadyForGpu)
                | (Qualifying, Done)
                | (ReadyForGpu, DispatchedGpu)
                | (DispatchedGpu, PythonOrchestrating)
                | (DispatchedGpu, ReadyForGpu) // stale recovery (background)
                | (PythonOrchestrating, ReadyForGpu) // stale recovery
                | (PythonOrchestrating, UserTask)
                | (PythonOrchestrating, DispatchedGpu)
                | (PythonOrchestrating, Error)
                | (_, UserTask)
                | (_, Error)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::UserTask | TaskState::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub content: String,
    pub client_id: Uuid,
    pub project_id: Option<Uuid>,
    pub processing_mode: ProcessingMode,
    pub state: TaskState,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub queue_position: Option<i64>,
    pub qualification_retries: u32,
    pub next_qualification_retry_at: Option<DateTime<Utc>>,
    pub orchestrator_thread_id: Option<String>,
    pub attachments: Vec<String>,
    pub error_message: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, content: impl Into<String>, client_id: Uuid, mode: ProcessingMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            content: content.into(),
            client_id,
            project_id: None,
            processing_mode: mode,
            state: TaskState::ReadyForQualification,
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
            queue_position: None,
            qualification_retries: 0,
            next_qualification_retry_at: None,
            orchestrator_thread_id: None,
            attachments: Vec::new(),
            error_message: None,
            scheduled_at: None,
        }
    }

    /// `nextQualificationRetryAt = now + min(initial * 2^(n-1), max)`, unbounded retries.
    pub fn schedule_qualification_retry(&mut self, initial: std::time::Duration, max: std::time::Duration) {
        self.qualification_retries += 1;
        let exp = initial.as_millis().saturating_mul(1u128 << (self.qualification_retries - 1).min(20));
        let wait_ms = exp.min(max.as_millis()) as i64;
        self.next_qualification_retry_at = Some(Utc::now() + chrono::Duration::milliseconds(wait_ms));
        self.state = TaskState::ReadyForQualification;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMemory {
    pub task_id: Uuid,
    pub summary: String,
    pub structured_result: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// KpiSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub artifacts_new: u64,
    pub artifacts_indexing: u64,
    pub artifacts_indexed: u64,
    pub artifacts_failed: u64,
    pub tasks_ready_for_qualification: u64,
    pub tasks_qualifying: u64,
    pub tasks_ready_for_gpu: u64,
    pub tasks_dispatched_gpu: u64,
    pub tasks_python_orchestrating: u64,
    pub tasks_done: u64,
    pub tasks_user_task: u64,
    pub tasks_error: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_state_transitions() {
        assert!(ArtifactState::New.can_transition_to(ArtifactState::Indexing));
        assert!(!ArtifactState::New.can_transition_to(ArtifactState::Indexed));
        assert!(ArtifactState::Indexing.can_transition_to(ArtifactState::Indexed));
        assert!(ArtifactState::Indexing.can_transition_to(ArtifactState::Failed));
    }

    #[test]
    fn task_state_transitions() {
        use TaskState::*;
        assert!(ReadyForQualification.can_transition_to(Qualifying));
        assert!(Qualifying.can_transition_to(ReadyForGpu));
        assert!(Qualifying.can_transition_to(Done));
        assert!(!Done.can_transition_to(ReadyForGpu));
        assert!(DispatchedGpu.can_transition_to(UserTask));
    }

    #[test]
    fn qualification_backoff_grows_then_caps() {
        let mut task = Task::new("test", "content", Uuid::new_v4(), ProcessingMode::Background);
        let initial = std::time::Duration::from_secs(5);
        let max = std::time::Duration::from_secs(300);
        task.schedule_qualification_retry(initial, max);
        assert_eq!(task.qualification_retries, 1);
        for _ in 0..10 {
            task.schedule_qualification_retry(initial, max);
        }
        let wait = task.next_qualification_retry_at.unwrap() - Utc::now();
        assert!(wait.num_seconds() <= 300);
    }

    #[test]
    fn connection_rate_limit_domain() {
        let c = Connection::new(
            "test",
            ConnectionKind::Http {
                base_url: "https://api.example.com/v2".into(),
                auth_type: AuthType::Bearer,
                credentials: Some("tok".into()),
                timeout_ms: 5000,
            },
        );
        assert_eq!(c.rate_limit_domain(), "api.example.com");
    }
}
