use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    ArtifactState, Client, Connection as JervisConnection, ConnectionState, IndexedLink,
    KpiSnapshot, LearnedPattern, PollingCursor, ProcessingMode, Project, SourceKind,
    StagedArtifact, Task, TaskMemory, TaskState, UnsafeLink,
};

/// Durable intermediate store between source APIs and the search index.
///
/// One logical collection per source type is modeled as a single `artifacts`
/// table discriminated by `source`, since every staged shape shares the same
/// lifecycle fields (`state`, `externalUpdatedAt`, chunk counters) and only
/// the `full_content` payload differs.
pub struct StagingStore {
    conn: Connection,
}

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).expect("valid date").with_timezone(&Utc)
}

impl StagingStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA cache_size=-64000;
                    PRAGMA mmap_size=268435456;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS connections (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL,
                        enabled     INTEGER NOT NULL,
                        rate_limit  TEXT NOT NULL,
                        state       TEXT NOT NULL,
                        kind        TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL,
                        last_invalid_reason TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_connections_enabled ON connections(enabled);

                    CREATE TABLE IF NOT EXISTS clients (
                        id         TEXT PRIMARY KEY,
                        name       TEXT NOT NULL,
                        connection_ids TEXT NOT NULL,
                        filters    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS projects (
                        id         TEXT PRIMARY KEY,
                        client_id  TEXT NOT NULL,
                        name       TEXT NOT NULL,
                        filters    TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_projects_client ON projects(client_id);

                    CREATE TABLE IF NOT EXISTS artifacts (
                        id                TEXT PRIMARY KEY,
                        source            TEXT NOT NULL,
                        client_id         TEXT NOT NULL,
                        project_id        TEXT,
                        connection_id     TEXT NOT NULL,
                        source_key        TEXT NOT NULL,
                        full_content      TEXT NOT NULL,
                        created_at        TEXT NOT NULL,
                        external_updated_at TEXT NOT NULL,
                        state             TEXT NOT NULL,
                        last_indexed_at   TEXT,
                        indexing_error    TEXT,
                        chunk_count       INTEGER NOT NULL DEFAULT 0,
                        main_doc_id       TEXT,
                        UNIQUE(connection_id, source_key)
                    );
                    CREATE INDEX IF NOT EXISTS idx_artifacts_state ON artifacts(state);
                    CREATE INDEX IF NOT EXISTS idx_artifacts_client ON artifacts(client_id);
                    CREATE INDEX IF NOT EXISTS idx_artifacts_project ON artifacts(project_id);
                    CREATE INDEX IF NOT EXISTS idx_artifacts_updated ON artifacts(external_updated_at);

                    CREATE TABLE IF NOT EXISTS polling_cursors (
                        connection_id      TEXT PRIMARY KEY,
                        last_fetched_uid   INTEGER,
                        last_etag          TEXT,
                        last_changelog_id  TEXT,
                        updated_at         TEXT
                    );

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                  TEXT PRIMARY KEY,
                        task_type           TEXT NOT NULL,
                        content             TEXT NOT NULL,
                        client_id           TEXT NOT NULL,
                        project_id          TEXT,
                        processing_mode     TEXT NOT NULL,
                        state               TEXT NOT NULL,
                        correlation_id      TEXT NOT NULL,
                        created_at          TEXT NOT NULL,
                        queue_position      INTEGER,
                        qualification_retries INTEGER NOT NULL DEFAULT 0,
                        next_qualification_retry_at TEXT,
                        orchestrator_thread_id TEXT,
                        attachments         TEXT NOT NULL,
                        error_message       TEXT,
                        scheduled_at        TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state);
                    CREATE INDEX IF NOT EXISTS idx_tasks_mode ON tasks(processing_mode);

                    CREATE TABLE IF NOT EXISTS task_memory (
                        task_id           TEXT PRIMARY KEY,
                        summary           TEXT NOT NULL,
                        structured_result TEXT NOT NULL,
                        created_at        TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS unsafe_links (
                        url       TEXT PRIMARY KEY,
                        reason    TEXT NOT NULL,
                        cached_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS unsafe_link_patterns (
                        id         TEXT PRIMARY KEY,
                        pattern    TEXT NOT NULL,
                        enabled    INTEGER NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS indexed_links (
                        url       TEXT NOT NULL,
                        client_id TEXT NOT NULL,
                        indexed_at TEXT NOT NULL,
                        PRIMARY KEY (url, client_id)
                    );
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    pub async fn upsert_connection(&self, c: &JervisConnection) -> Result<(), tokio_rusqlite::Error> {
        let id = c.id.to_string();
        let name = c.name.clone();
        let enabled = c.enabled as i64;
        let rate_limit = serde_json::to_string(&c.rate_limit).unwrap();
        let state = enum_to_sql(&c.state);
        let kind = serde_json::to_string(&c.kind).unwrap();
        let created_at = c.created_at.to_rfc3339();
        let updated_at = c.updated_at.to_rfc3339();
        let reason = c.last_invalid_reason.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO connections (id, name, enabled, rate_limit, state, kind, created_at, updated_at, last_invalid_reason)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, enabled=excluded.enabled, rate_limit=excluded.rate_limit,
                        state=excluded.state, kind=excluded.kind, updated_at=excluded.updated_at,
                        last_invalid_reason=excluded.last_invalid_reason",
                    rusqlite::params![id, name, enabled, rate_limit, state, kind, created_at, updated_at, reason],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_enabled_connections(&self) -> Result<Vec<JervisConnection>, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, enabled, rate_limit, state, kind, created_at, updated_at, last_invalid_reason
                     FROM connections WHERE enabled = 1",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_connection(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn get_connection(&self, id: Uuid) -> Result<Option<JervisConnection>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, enabled, rate_limit, state, kind, created_at, updated_at, last_invalid_reason
                     FROM connections WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_connection(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Only a successful `testConnection` probe may call this with `Valid`.
    pub async fn mark_connection_state(
        &self,
        id: Uuid,
        state: ConnectionState,
        reason: Option<String>,
    ) -> Result<(), tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let state_str = enum_to_sql(&state);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE connections SET state=?1, last_invalid_reason=?2, updated_at=?3 WHERE id=?4",
                    rusqlite::params![state_str, reason, now, id_str],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Clients / Projects
    // -----------------------------------------------------------------------

    pub async fn upsert_client(&self, client: &Client) -> Result<(), tokio_rusqlite::Error> {
        let id = client.id.to_string();
        let name = client.name.clone();
        let connection_ids = serde_json::to_string(&client.connection_ids).unwrap();
        let filters = serde_json::to_string(&client.filters).unwrap();
        let created_at = client.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO clients (id, name, connection_ids, filters, created_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, connection_ids=excluded.connection_ids, filters=excluded.filters",
                    rusqlite::params![id, name, connection_ids, filters, created_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn upsert_project(&self, project: &Project) -> Result<(), tokio_rusqlite::Error> {
        let id = project.id.to_string();
        let client_id = project.client_id.to_string();
        let name = project.name.clone();
        let filters = serde_json::to_string(&project.filters).unwrap();
        let created_at = project.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, client_id, name, filters, created_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, filters=excluded.filters",
                    rusqlite::params![id, client_id, name, filters, created_at],
                )?;
                Ok(())
            })
            .await
    }

    /// Clients that reference a given connection; the poller skips
    /// connections nobody references.
    pub async fn clients_for_connection(&self, connection_id: Uuid) -> Result<Vec<Client>, tokio_rusqlite::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, connection_ids, filters, created_at FROM clients",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    let connection_ids_raw: String = row.get(2)?;
                    let filters: String = row.get(3)?;
                    let created_at: String = row.get(4)?;
                    let connection_ids: Vec<Uuid> = serde_json::from_str(&connection_ids_raw).unwrap();
                    if connection_ids.contains(&connection_id) {
                        out.push(Client {
                            id: Uuid::parse_str(&id).unwrap(),
                            name,
                            connection_ids,
                            filters: serde_json::from_str(&filters).unwrap(),
                            created_at: parse_dt(&created_at),
                        });
                    }
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Artifacts / staging
    // -----------------------------------------------------------------------

    /// Insert if `(connectionId, sourceKey)` absent; replace and reset to
    /// `NEW` if the incoming item is strictly newer; no-op otherwise.
    /// Returns `true` if a row was inserted or replaced.
    pub async fn upsert_if_newer(&self, artifact: &StagedArtifact) -> Result<bool, tokio_rusqlite::Error> {
        let connection_id = artifact.connection_id.to_string();
        let source_key = artifact.source_key.clone();
        let id = artifact.id.to_string();
        let source = enum_to_sql(&artifact.source_kind_tag());
        let client_id = artifact.client_id.to_string();
        let project_id = artifact.project_id.map(|u| u.to_string());
        let full_content = artifact.full_content.to_string();
        let created_at = artifact.created_at.to_rfc3339();
        let external_updated_at = artifact.external_updated_at.to_rfc3339();
        let state = enum_to_sql(&ArtifactState::New);

        self.conn
            .call(move |conn| {
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT external_updated_at FROM artifacts WHERE connection_id=?1 AND source_key=?2",
                        rusqlite::params![connection_id, source_key],
                        |r| r.get(0),
                    )
                    .optional()?;

                match existing {
                    None => {
                        conn.execute(
                            "INSERT INTO artifacts (id, source, client_id, project_id, connection_id, source_key,
                                full_content, created_at, external_updated_at, state, last_indexed_at,
                                indexing_error, chunk_count, main_doc_id)
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,NULL,NULL,0,NULL)",
                            rusqlite::params![
                                id, source, client_id, project_id, connection_id, source_key,
                                full_content, created_at, external_updated_at, state
                            ],
                        )?;
                        Ok(true)
                    }
                    Some(stored) => {
                        if external_updated_at.as_str() > stored.as_str() {
                            conn.execute(
                                "UPDATE artifacts SET full_content=?1, external_updated_at=?2, state=?3,
                                    indexing_error=NULL WHERE connection_id=?4 AND source_key=?5",
                                rusqlite::params![full_content, external_updated_at, state, connection_id, source_key],
                            )?;
                            Ok(true)
                        } else {
                            Ok(false)
                        }
                    }
                }
            })
            .await
    }

    pub async fn list_new_artifacts(&self, limit: i64) -> Result<Vec<StagedArtifact>, tokio_rusqlite::Error> {
        let state = enum_to_sql(&ArtifactState::New);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, source, client_id, project_id, connection_id, source_key, full_content,
                            created_at, external_updated_at, state, last_indexed_at, indexing_error,
                            chunk_count, main_doc_id
                     FROM artifacts WHERE state = ?1 ORDER BY external_updated_at ASC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![state, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_artifact(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Atomic claim: `NEW -> INDEXING`. Returns `true` only if this call won the race.
    pub async fn claim_for_indexing(&self, id: Uuid) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let from = enum_to_sql(&ArtifactState::New);
        let to = enum_to_sql(&ArtifactState::Indexing);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE artifacts SET state=?1 WHERE id=?2 AND state=?3",
                    rusqlite::params![to, id_str, from],
                )?;
                Ok(n == 1)
            })
            .await
    }

    pub async fn mark_indexed(&self, id: Uuid, chunk_count: u32, main_doc_id: Option<String>) -> Result<(), tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let state = enum_to_sql(&ArtifactState::Indexed);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE artifacts SET state=?1, last_indexed_at=?2, chunk_count=?3, main_doc_id=?4 WHERE id=?5",
                    rusqlite::params![state, now, chunk_count, main_doc_id, id_str],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn mark_failed(&self, id: Uuid, reason: String) -> Result<(), tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let state = enum_to_sql(&ArtifactState::Failed);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE artifacts SET state=?1, indexing_error=?2 WHERE id=?3",
                    rusqlite::params![state, reason, id_str],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn count_artifacts_by_state(&self, state: ArtifactState) -> Result<u64, tokio_rusqlite::Error> {
        let state_str = enum_to_sql(&state);
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM artifacts WHERE state = ?1",
                    rusqlite::params![state_str],
                    |r| r.get(0),
                )
                .map_err(Into::into)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Polling cursors
    // -----------------------------------------------------------------------

    pub async fn get_cursor(&self, connection_id: Uuid) -> Result<PollingCursor, tokio_rusqlite::Error> {
        let id_str = connection_id.to_string();
        self.conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT connection_id, last_fetched_uid, last_etag, last_changelog_id, updated_at
                         FROM polling_cursors WHERE connection_id = ?1",
                        rusqlite::params![id_str],
                        |r| {
                            Ok(PollingCursor {
                                connection_id,
                                last_fetched_uid: r.get::<_, Option<i64>>(1)?.map(|v| v as u64),
                                last_etag: r.get(2)?,
                                last_changelog_id: r.get(3)?,
                                updated_at: r.get::<_, Option<String>>(4)?.map(|s| parse_dt(&s)),
                            })
                        },
                    )
                    .optional()?;
                Ok(row.unwrap_or(PollingCursor {
                    connection_id,
                    ..Default::default()
                }))
            })
            .await
    }

    pub async fn upsert_cursor(&self, cursor: &PollingCursor) -> Result<(), tokio_rusqlite::Error> {
        let connection_id = cursor.connection_id.to_string();
        let last_fetched_uid = cursor.last_fetched_uid.map(|v| v as i64);
        let last_etag = cursor.last_etag.clone();
        let last_changelog_id = cursor.last_changelog_id.clone();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO polling_cursors (connection_id, last_fetched_uid, last_etag, last_changelog_id, updated_at)
                     VALUES (?1,?2,?3,?4,?5)
                     ON CONFLICT(connection_id) DO UPDATE SET
                        last_fetched_uid=excluded.last_fetched_uid, last_etag=excluded.last_etag,
                        last_changelog_id=excluded.last_changelog_id, updated_at=excluded.updated_at",
                    rusqlite::params![connection_id, last_fetched_uid, last_etag, last_changelog_id, now],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn upsert_task(&self, task: &Task) -> Result<(), tokio_rusqlite::Error> {
        let id = task.id.to_string();
        let task_type = task.task_type.clone();
        let content = task.content.clone();
        let client_id = task.client_id.to_string();
        let project_id = task.project_id.map(|u| u.to_string());
        let processing_mode = enum_to_sql(&task.processing_mode);
        let state = enum_to_sql(&task.state);
        let correlation_id = task.correlation_id.to_string();
        let created_at = task.created_at.to_rfc3339();
        let queue_position = task.queue_position;
        let qualification_retries = task.qualification_retries;
        let next_retry = task.next_qualification_retry_at.map(|d| d.to_rfc3339());
        let thread_id = task.orchestrator_thread_id.clone();
        let attachments = serde_json::to_string(&task.attachments).unwrap();
        let error_message = task.error_message.clone();
        let scheduled_at = task.scheduled_at.map(|d| d.to_rfc3339());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, task_type, content, client_id, project_id, processing_mode, state,
                        correlation_id, created_at, queue_position, qualification_retries,
                        next_qualification_retry_at, orchestrator_thread_id, attachments, error_message, scheduled_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                     ON CONFLICT(id) DO UPDATE SET
                        state=excluded.state, queue_position=excluded.queue_position,
                        qualification_retries=excluded.qualification_retries,
                        next_qualification_retry_at=excluded.next_qualification_retry_at,
                        orchestrator_thread_id=excluded.orchestrator_thread_id,
                        error_message=excluded.error_message, scheduled_at=excluded.scheduled_at",
                    rusqlite::params![
                        id, task_type, content, client_id, project_id, processing_mode, state,
                        correlation_id, created_at, queue_position, qualification_retries,
                        next_retry, thread_id, attachments, error_message, scheduled_at
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Atomic find-and-modify claim keyed on expected state.
    pub async fn cas_task_state(&self, id: Uuid, from: TaskState, to: TaskState) -> Result<bool, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        let from_str = enum_to_sql(&from);
        let to_str = enum_to_sql(&to);
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET state=?1 WHERE id=?2 AND state=?3",
                    rusqlite::params![to_str, id_str, from_str],
                )?;
                Ok(n == 1)
            })
            .await
    }

    /// Next eligible tasks for qualification: `READY_FOR_QUALIFICATION` with
    /// no backoff pending.
    pub async fn next_for_qualification(&self, limit: i64) -> Result<Vec<Task>, tokio_rusqlite::Error> {
        let state = enum_to_sql(&TaskState::ReadyForQualification);
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_type, content, client_id, project_id, processing_mode, state, correlation_id,
                            created_at, queue_position, qualification_retries, next_qualification_retry_at,
                            orchestrator_thread_id, attachments, error_message, scheduled_at
                     FROM tasks
                     WHERE state = ?1 AND (next_qualification_retry_at IS NULL OR next_qualification_retry_at <= ?2)
                     ORDER BY created_at ASC LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![state, now, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Next foreground task ordered by `queuePosition`, else next background
    /// task ordered by `createdAt`.
    pub async fn next_for_execution(&self) -> Result<Option<Task>, tokio_rusqlite::Error> {
        let state = enum_to_sql(&TaskState::ReadyForGpu);
        let fg = enum_to_sql(&ProcessingMode::Foreground);
        let bg = enum_to_sql(&ProcessingMode::Background);
        self.conn
            .call(move |conn| {
                {
                    let mut stmt = conn.prepare(
                        "SELECT id, task_type, content, client_id, project_id, processing_mode, state, correlation_id,
                                created_at, queue_position, qualification_retries, next_qualification_retry_at,
                                orchestrator_thread_id, attachments, error_message, scheduled_at
                         FROM tasks WHERE state = ?1 AND processing_mode = ?2
                         ORDER BY queue_position ASC LIMIT 1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![state, fg])?;
                    if let Some(row) = rows.next()? {
                        return Ok(Some(row_to_task(row)?));
                    }
                }
                let mut stmt = conn.prepare(
                    "SELECT id, task_type, content, client_id, project_id, processing_mode, state, correlation_id,
                            created_at, queue_position, qualification_retries, next_qualification_retry_at,
                            orchestrator_thread_id, attachments, error_message, scheduled_at
                     FROM tasks WHERE state = ?1 AND processing_mode = ?2
                     ORDER BY created_at ASC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![state, bg])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<Task>, tokio_rusqlite::Error> {
        let state_str = enum_to_sql(&state);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_type, content, client_id, project_id, processing_mode, state, correlation_id,
                            created_at, queue_position, qualification_retries, next_qualification_retry_at,
                            orchestrator_thread_id, attachments, error_message, scheduled_at
                     FROM tasks WHERE state = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![state_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete_task(&self, id: Uuid) -> Result<(), tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id=?1", rusqlite::params![id_str])?;
                Ok(())
            })
            .await
    }

    pub async fn insert_task_memory(&self, memory: &TaskMemory) -> Result<(), tokio_rusqlite::Error> {
        let task_id = memory.task_id.to_string();
        let summary = memory.summary.clone();
        let structured = memory.structured_result.to_string();
        let created_at = memory.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_memory (task_id, summary, structured_result, created_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(task_id) DO UPDATE SET summary=excluded.summary, structured_result=excluded.structured_result",
                    rusqlite::params![task_id, summary, structured, created_at],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Link safety
    // -----------------------------------------------------------------------

    pub async fn get_unsafe_link(&self, url: &str) -> Result<Option<UnsafeLink>, tokio_rusqlite::Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT url, reason, cached_at FROM unsafe_links WHERE url=?1",
                    rusqlite::params![url],
                    |r| {
                        let cached_at: String = r.get(2)?;
                        Ok(UnsafeLink {
                            url: r.get(0)?,
                            reason: r.get(1)?,
                            cached_at: parse_dt(&cached_at),
                        })
                    },
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn cache_unsafe_link(&self, link: &UnsafeLink) -> Result<(), tokio_rusqlite::Error> {
        let url = link.url.clone();
        let reason = link.reason.clone();
        let cached_at = link.cached_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO unsafe_links (url, reason, cached_at) VALUES (?1,?2,?3)
                     ON CONFLICT(url) DO UPDATE SET reason=excluded.reason, cached_at=excluded.cached_at",
                    rusqlite::params![url, reason, cached_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_enabled_patterns(&self) -> Result<Vec<LearnedPattern>, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, pattern, enabled, created_at FROM unsafe_link_patterns WHERE enabled = 1",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let created_at: String = row.get(3)?;
                    out.push(LearnedPattern {
                        id: Uuid::parse_str(&id).unwrap(),
                        pattern: row.get(1)?,
                        enabled: row.get::<_, i64>(2)? != 0,
                        created_at: parse_dt(&created_at),
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn add_pattern(&self, pattern: &LearnedPattern) -> Result<(), tokio_rusqlite::Error> {
        let id = pattern.id.to_string();
        let p = pattern.pattern.clone();
        let enabled = pattern.enabled as i64;
        let created_at = pattern.created_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO unsafe_link_patterns (id, pattern, enabled, created_at) VALUES (?1,?2,?3,?4)",
                    rusqlite::params![id, p, enabled, created_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn is_indexed_link(&self, url: &str, client_id: Uuid) -> Result<bool, tokio_rusqlite::Error> {
        let url = url.to_string();
        let client_id = client_id.to_string();
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM indexed_links WHERE url=?1 AND client_id=?2",
                    rusqlite::params![url, client_id],
                    |r| r.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn mark_link_indexed(&self, link: &IndexedLink) -> Result<(), tokio_rusqlite::Error> {
        let url = link.url.clone();
        let client_id = link.client_id.to_string();
        let indexed_at = link.indexed_at.to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO indexed_links (url, client_id, indexed_at) VALUES (?1,?2,?3)",
                    rusqlite::params![url, client_id, indexed_at],
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // KPI
    // -----------------------------------------------------------------------

    pub async fn compute_kpi_snapshot(&self) -> Result<KpiSnapshot, tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                let artifact_count = |state: &str| -> rusqlite::Result<u64> {
                    conn.query_row(
                        "SELECT COUNT(*) FROM artifacts WHERE state = ?1",
                        rusqlite::params![state],
                        |r| r.get(0),
                    )
                };
                let task_count = |state: &str| -> rusqlite::Result<u64> {
                    conn.query_row(
                        "SELECT COUNT(*) FROM tasks WHERE state = ?1",
                        rusqlite::params![state],
                        |r| r.get(0),
                    )
                };
                Ok(KpiSnapshot {
                    artifacts_new: artifact_count("new")?,
                    artifacts_indexing: artifact_count("indexing")?,
                    artifacts_indexed: artifact_count("indexed")?,
                    artifacts_failed: artifact_count("failed")?,
                    tasks_ready_for_qualification: task_count("ready_for_qualification")?,
                    tasks_qualifying: task_count("qualifying")?,
                    tasks_ready_for_gpu: task_count("ready_for_gpu")?,
                    tasks_dispatched_gpu: task_count("dispatched_gpu")?,
                    tasks_python_orchestrating: task_count("python_orchestrating")?,
                    tasks_done: task_count("done")?,
                    tasks_user_task: task_count("user_task")?,
                    tasks_error: task_count("error")?,
                    timestamp: Utc::now(),
                })
            })
            .await
    }
}

use rusqlite::OptionalExtension;

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<JervisConnection> {
    let id: String = row.get(0)?;
    let enabled: i64 = row.get(2)?;
    let rate_limit: String = row.get(3)?;
    let state: String = row.get(4)?;
    let kind: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(JervisConnection {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        name: row.get(1)?,
        enabled: enabled != 0,
        rate_limit: serde_json::from_str(&rate_limit).expect("valid json"),
        state: enum_from_sql(&state),
        kind: serde_json::from_str(&kind).expect("valid json"),
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
        last_invalid_reason: row.get(8)?,
    })
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<StagedArtifact> {
    let id: String = row.get(0)?;
    let source: String = row.get(1)?;
    let client_id: String = row.get(2)?;
    let project_id: Option<String> = row.get(3)?;
    let connection_id: String = row.get(4)?;
    let full_content: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let external_updated_at: String = row.get(8)?;
    let state: String = row.get(9)?;
    let last_indexed_at: Option<String> = row.get(10)?;

    let source_kind: SourceKindTag = enum_from_sql(&source);
    Ok(StagedArtifact {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        source: source_kind.into(),
        client_id: Uuid::parse_str(&client_id).expect("valid uuid"),
        project_id: project_id.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        connection_id: Uuid::parse_str(&connection_id).expect("valid uuid"),
        source_key: row.get(5)?,
        full_content: serde_json::from_str(&full_content).expect("valid json"),
        created_at: parse_dt(&created_at),
        external_updated_at: parse_dt(&external_updated_at),
        state: enum_from_sql(&state),
        last_indexed_at: last_indexed_at.map(|s| parse_dt(&s)),
        indexing_error: row.get(11)?,
        chunk_count: row.get(12)?,
        main_doc_id: row.get(13)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let client_id: String = row.get(3)?;
    let project_id: Option<String> = row.get(4)?;
    let processing_mode: String = row.get(5)?;
    let state: String = row.get(6)?;
    let correlation_id: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let next_retry: Option<String> = row.get(11)?;
    let attachments: String = row.get(13)?;
    let scheduled_at: Option<String> = row.get(15)?;

    Ok(Task {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        task_type: row.get(1)?,
        content: row.get(2)?,
        client_id: Uuid::parse_str(&client_id).expect("valid uuid"),
        project_id: project_id.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        processing_mode: enum_from_sql(&processing_mode),
        state: enum_from_sql(&state),
        correlation_id: Uuid::parse_str(&correlation_id).expect("valid uuid"),
        created_at: parse_dt(&created_at),
        queue_position: row.get(9)?,
        qualification_retries: row.get(10)?,
        next_qualification_retry_at: next_retry.map(|s| parse_dt(&s)),
        orchestrator_thread_id: row.get(12)?,
        attachments: serde_json::from_str(&attachments).expect("valid json"),
        error_message: row.get(14)?,
        scheduled_at: scheduled_at.map(|s| parse_dt(&s)),
    })
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum SourceKindTag {
    IssueTracker,
    Wiki,
    Email,
    Git,
}

impl From<SourceKind> for SourceKindTag {
    fn from(s: SourceKind) -> Self {
        match s {
            SourceKind::IssueTracker => SourceKindTag::IssueTracker,
            SourceKind::Wiki => SourceKindTag::Wiki,
            SourceKind::Email => SourceKindTag::Email,
            SourceKind::Git => SourceKindTag::Git,
        }
    }
}

impl From<SourceKindTag> for SourceKind {
    fn from(s: SourceKindTag) -> Self {
        match s {
            SourceKindTag::IssueTracker => SourceKind::IssueTracker,
            SourceKindTag::Wiki => SourceKind::Wiki,
            SourceKindTag::Email => SourceKind::Email,
            SourceKindTag::Git => SourceKind::Git,
        }
    }
}

impl StagedArtifact {
    fn source_kind_tag(&self) -> SourceKindTag {
        self.source.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthType, ConnectionKind};

    fn sample_artifact(connection_id: Uuid, key: &str, updated_at: DateTime<Utc>) -> StagedArtifact {
        StagedArtifact::new(
            SourceKind::IssueTracker,
            Uuid::new_v4(),
            None,
            connection_id,
            key,
            serde_json::json!({"summary": "test"}),
            updated_at,
        )
    }

    #[tokio::test]
    async fn upsert_if_newer_is_idempotent() {
        let store = StagingStore::new_in_memory().await.unwrap();
        let conn_id = Uuid::new_v4();
        let a = sample_artifact(conn_id, "ISSUE-1", Utc::now());

        assert!(store.upsert_if_newer(&a).await.unwrap());
        assert!(!store.upsert_if_newer(&a).await.unwrap());

        let rows = store.list_new_artifacts(10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn upsert_if_newer_resets_state_to_new_on_update() {
        let store = StagingStore::new_in_memory().await.unwrap();
        let conn_id = Uuid::new_v4();
        let a = sample_artifact(conn_id, "ISSUE-1", Utc::now());
        store.upsert_if_newer(&a).await.unwrap();

        let claimed = store.claim_for_indexing(a.id).await.unwrap();
        assert!(claimed);
        store.mark_indexed(a.id, 3, Some("doc-1".into())).await.unwrap();

        let mut newer = sample_artifact(conn_id, "ISSUE-1", Utc::now() + chrono::Duration::seconds(10));
        newer.id = a.id;
        store.upsert_if_newer(&newer).await.unwrap();

        let new_rows = store.list_new_artifacts(10).await.unwrap();
        assert_eq!(new_rows.len(), 1);
    }

    #[tokio::test]
    async fn claim_for_indexing_exactly_one_winner() {
        let store = std::sync::Arc::new(StagingStore::new_in_memory().await.unwrap());
        let conn_id = Uuid::new_v4();
        let a = sample_artifact(conn_id, "ISSUE-RACE", Utc::now());
        store.upsert_if_newer(&a).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = a.id;
            handles.push(tokio::spawn(async move { store.claim_for_indexing(id).await.unwrap() }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn connection_state_only_set_explicitly() {
        let store = StagingStore::new_in_memory().await.unwrap();
        let conn = crate::types::Connection::new(
            "github",
            ConnectionKind::Http {
                base_url: "https://api.github.com".into(),
                auth_type: AuthType::Bearer,
                credentials: Some("tok".into()),
                timeout_ms: 5000,
            },
        );
        store.upsert_connection(&conn).await.unwrap();
        let fetched = store.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, crate::types::ConnectionState::Unverified);

        store
            .mark_connection_state(conn.id, crate::types::ConnectionState::Valid, None)
            .await
            .unwrap();
        let fetched = store.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(fetched.state, crate::types::ConnectionState::Valid);
    }

    #[tokio::test]
    async fn task_cas_claim_race() {
        let store = std::sync::Arc::new(StagingStore::new_in_memory().await.unwrap());
        let mut task = Task::new("link_safety_review", "content", Uuid::new_v4(), ProcessingMode::Background);
        task.state = TaskState::ReadyForGpu;
        store.upsert_task(&task).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            let id = task.id;
            handles.push(tokio::spawn(async move {
                store.cas_task_state(id, TaskState::ReadyForGpu, TaskState::DispatchedGpu).await.unwrap()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn kpi_snapshot_counts_by_state() {
        let store = StagingStore::new_in_memory().await.unwrap();
        let conn_id = Uuid::new_v4();
        store.upsert_if_newer(&sample_artifact(conn_id, "A", Utc::now())).await.unwrap();
        store.upsert_if_newer(&sample_artifact(conn_id, "B", Utc::now())).await.unwrap();

        let snap = store.compute_kpi_snapshot().await.unwrap();
        assert_eq!(snap.artifacts_new, 2);
    }
}
