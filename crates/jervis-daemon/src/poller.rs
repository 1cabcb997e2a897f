//! Central Poller (§4.6): a single long-running loop that sweeps every
//! enabled connection, resolves the one [`PollingHandler`] willing to handle
//! it, and dispatches a bounded number of polls concurrently. The poller
//! owns no per-artifact state beyond the cursor each handler updates — all
//! artifact state lives in the staging store (§4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Client, Connection, ConnectionKind, ConnectionState, ProcessingMode, Task};
use jervis_harness::rate_limiter::{RateLimitConfig, RateLimiter};
use jervis_harness::shutdown::ShutdownSignal;
use jervis_integrations::error::SourceError;
use jervis_integrations::handler::PollingHandler;
use jervis_integrations::types::PollOutcome;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// User task raised when a handler's poll fails with an authentication
/// error, so an operator knows a connection needs re-authorizing (§7).
const CONNECTION_AUTH_FAILURE_TASK: &str = "CONNECTION_AUTH_FAILURE";

/// How often the supervising loop wakes to check which connections are due.
/// Individual connections are only actually polled once their own
/// type-specific interval has elapsed (checked against the connection's
/// cursor), so this just bounds how promptly a newly-due connection is
/// noticed.
const SWEEP_TICK: Duration = Duration::from_secs(15);

pub struct CentralPoller {
    store: Arc<StagingStore>,
    handlers: Vec<Box<dyn PollingHandler>>,
    rate_limiter: Arc<RateLimiter>,
    concurrency: Arc<Semaphore>,
    http_interval: Duration,
    imap_interval: Duration,
    pop3_interval: Duration,
}

impl CentralPoller {
    pub fn new(
        store: Arc<StagingStore>,
        handlers: Vec<Box<dyn PollingHandler>>,
        max_concurrent_polls: usize,
        http_interval: Duration,
        imap_interval: Duration,
        pop3_interval: Duration,
    ) -> Self {
        Self {
            store,
            handlers,
            rate_limiter: Arc::new(RateLimiter::new(RateLimitConfig::per_second(5))),
            concurrency: Arc::new(Semaphore::new(max_concurrent_polls.max(1))),
            http_interval,
            imap_interval,
            pop3_interval,
        }
    }

    fn interval_for(&self, kind: &ConnectionKind) -> Duration {
        match kind {
            ConnectionKind::Http { .. } | ConnectionKind::Oauth2 { .. } => self.http_interval,
            ConnectionKind::Imap { .. } => self.imap_interval,
            ConnectionKind::Pop3 { .. } => self.pop3_interval,
        }
    }

    fn resolve_handler(&self, connection: &Connection) -> Option<&dyn PollingHandler> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(connection))
            .map(|h| h.as_ref())
    }

    async fn is_due(&self, connection: &Connection) -> bool {
        match self.store.get_cursor(connection.id).await {
            Ok(cursor) => match cursor.updated_at {
                Some(last) => Utc::now() - last >= chrono::Duration::from_std(self.interval_for(&connection.kind)).unwrap_or_default(),
                None => true,
            },
            Err(e) => {
                warn!(connection = %connection.id, error = %e, "failed to read polling cursor, treating as due");
                true
            }
        }
    }

    /// One sweep: enumerate enabled connections, skip those with no
    /// referencing client or no matching handler, poll the rest concurrently
    /// up to `max_concurrent_polls`. Errors in one connection never stop the
    /// sweep (§4.6).
    pub async fn run_once(&self) -> PollOutcome {
        let mut total = PollOutcome::default();

        let connections = match self.store.list_enabled_connections().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "failed to list enabled connections");
                return total;
            }
        };

        let mut tasks = Vec::new();
        for connection in connections {
            if connection.state != ConnectionState::Valid {
                continue;
            }
            if !self.is_due(&connection).await {
                continue;
            }
            let Some(handler_ref) = self.resolve_handler(&connection) else {
                continue;
            };
            // handler_ref borrows from self; re-resolve by index inside the
            // spawned task instead of trying to carry the borrow across await.
            let handler_idx = self
                .handlers
                .iter()
                .position(|h| std::ptr::eq(h.as_ref(), handler_ref))
                .expect("handler resolved above must be in the list");

            let clients = match self.store.clients_for_connection(connection.id).await {
                Ok(c) => c,
                Err(e) => {
                    error!(connection = %connection.id, error = %e, "failed to load clients for connection");
                    continue;
                }
            };
            if clients.is_empty() {
                continue;
            }

            let permit = self.concurrency.clone().acquire_owned().await.expect("semaphore not closed");
            let domain = connection.rate_limit_domain();
            self.rate_limiter
                .configure_domain(&domain, RateLimitConfig::from_connection_limits(
                    connection.rate_limit.max_requests_per_second,
                    connection.rate_limit.max_requests_per_minute,
                ));
            self.rate_limiter.acquire(&domain).await;

            let store = self.store.clone();
            let handler = &self.handlers[handler_idx];
            let outcome = handler.poll(&store, &connection, &clients).await;
            drop(permit);

            match outcome {
                Ok(o) => {
                    info!(
                        connection = %connection.id,
                        discovered = o.discovered,
                        created = o.created,
                        skipped = o.skipped,
                        errors = o.errors,
                        "connection polled"
                    );
                    tasks.push(o);
                }
                Err(e) => {
                    error!(connection = %connection.id, error = %e, "poll failed");
                    if e.is_auth() {
                        self.handle_auth_failure(&connection, &clients, &e).await;
                    }
                    tasks.push(PollOutcome {
                        errors: 1,
                        ..Default::default()
                    });
                }
            }
        }

        for outcome in tasks {
            total.merge(outcome);
        }
        total
    }

    /// Auth failures from a handler's `poll()` route through here rather
    /// than a plain log line (§7): the connection is flipped to `Invalid` so
    /// the next sweep skips it, and an operator user task is raised naming
    /// the connection and the reason. `markInvalid` is the only place a
    /// connection may leave `Valid` outside of an explicit `testConnection`.
    async fn handle_auth_failure(&self, connection: &Connection, clients: &[Client], error: &SourceError) {
        let reason = error.to_string();
        if let Err(e) = self
            .store
            .mark_connection_state(connection.id, ConnectionState::Invalid, Some(reason.clone()))
            .await
        {
            error!(connection = %connection.id, error = %e, "failed to mark connection invalid after auth failure");
        }

        let Some(client) = clients.first() else {
            warn!(connection = %connection.id, "auth failure on connection with no referencing client, no user task raised");
            return;
        };
        let content = serde_json::json!({
            "connectionId": connection.id,
            "connectionName": connection.name,
            "reason": reason,
            "remediation": "re-authorize this connection with valid credentials, then re-run testConnection",
        })
        .to_string();
        let task = Task::new(CONNECTION_AUTH_FAILURE_TASK, content, client.id, ProcessingMode::Background);
        if let Err(e) = self.store.upsert_task(&task).await {
            error!(connection = %connection.id, error = %e, "failed to raise connection auth failure task");
        }
    }

    /// `testConnection` (§4.1): probe a single connection out-of-band from
    /// the sweep loop, writing `Valid` or `Invalid` + reason as its result.
    /// This is the only path allowed to set `state = Valid`.
    pub async fn test_connection(&self, connection_id: uuid::Uuid) -> Result<(), String> {
        let connection = self
            .store
            .get_connection(connection_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "connection not found".to_string())?;

        let Some(handler) = self.resolve_handler(&connection) else {
            return Err("no handler registered for this connection kind".to_string());
        };

        match handler.test_connection(&connection).await {
            Ok(()) => self
                .store
                .mark_connection_state(connection.id, ConnectionState::Valid, None)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => {
                let reason = e.to_string();
                self.store
                    .mark_connection_state(connection.id, ConnectionState::Invalid, Some(reason.clone()))
                    .await
                    .map_err(|e| e.to_string())?;
                Err(reason)
            }
        }
    }

    /// Run the sweep loop forever, honoring `startup_delay` before the first
    /// sweep and `shutdown` to stop between sweeps.
    pub async fn run(&self, startup_delay: Duration, shutdown: ShutdownSignal) {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(startup_delay) => {}
            _ = shutdown_rx.recv() => return,
        }
        let mut interval = tokio::time::interval(SWEEP_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jervis_core::types::{AuthType, Client, ConnectionState, RateLimitConfig as ConnRateLimitConfig, TaskState};
    use jervis_integrations::error::Result as HandlerResult;

    struct AlwaysHandler;

    #[async_trait]
    impl PollingHandler for AlwaysHandler {
        fn can_handle(&self, _connection: &Connection) -> bool {
            true
        }

        async fn poll(&self, _store: &StagingStore, _connection: &Connection, _clients: &[Client]) -> HandlerResult<PollOutcome> {
            Ok(PollOutcome {
                discovered: 1,
                created: 1,
                ..Default::default()
            })
        }

        async fn test_connection(&self, _connection: &Connection) -> HandlerResult<()> {
            Ok(())
        }
    }

    struct AuthFailingHandler;

    #[async_trait]
    impl PollingHandler for AuthFailingHandler {
        fn can_handle(&self, _connection: &Connection) -> bool {
            true
        }

        async fn poll(&self, _store: &StagingStore, _connection: &Connection, _clients: &[Client]) -> HandlerResult<PollOutcome> {
            Err(SourceError::Auth("token revoked".to_string()))
        }

        async fn test_connection(&self, _connection: &Connection) -> HandlerResult<()> {
            Err(SourceError::Auth("token revoked".to_string()))
        }
    }

    fn http_connection() -> Connection {
        Connection {
            rate_limit: ConnRateLimitConfig::default(),
            ..Connection::new(
                "test",
                ConnectionKind::Http {
                    base_url: "https://api.example.com".into(),
                    auth_type: AuthType::None,
                    credentials: None,
                    timeout_ms: 5000,
                },
            )
        }
    }

    #[tokio::test]
    async fn skips_connection_with_no_referencing_client() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let mut conn = http_connection();
        conn.state = ConnectionState::Valid;
        store.upsert_connection(&conn).await.unwrap();

        let poller = CentralPoller::new(
            store,
            vec![Box::new(AlwaysHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let outcome = poller.run_once().await;
        assert_eq!(outcome.discovered, 0);
    }

    #[tokio::test]
    async fn polls_connection_with_a_referencing_client() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let mut conn = http_connection();
        conn.state = ConnectionState::Valid;
        store.upsert_connection(&conn).await.unwrap();

        let client = Client {
            id: uuid::Uuid::new_v4(),
            name: "client".into(),
            connection_ids: vec![conn.id],
            filters: vec![],
            created_at: Utc::now(),
        };
        store.upsert_client(&client).await.unwrap();

        let poller = CentralPoller::new(
            store,
            vec![Box::new(AlwaysHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let outcome = poller.run_once().await;
        assert_eq!(outcome.discovered, 1);
        assert_eq!(outcome.created, 1);
    }

    #[tokio::test]
    async fn unverified_connection_is_never_polled_even_with_a_client() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let conn = http_connection();
        assert_eq!(conn.state, ConnectionState::Unverified);
        store.upsert_connection(&conn).await.unwrap();

        let client = Client {
            id: uuid::Uuid::new_v4(),
            name: "client".into(),
            connection_ids: vec![conn.id],
            filters: vec![],
            created_at: Utc::now(),
        };
        store.upsert_client(&client).await.unwrap();

        let poller = CentralPoller::new(
            store,
            vec![Box::new(AlwaysHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let outcome = poller.run_once().await;
        assert_eq!(outcome.discovered, 0);
    }

    #[tokio::test]
    async fn auth_failure_marks_connection_invalid_and_raises_a_user_task() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let mut conn = http_connection();
        conn.state = ConnectionState::Valid;
        store.upsert_connection(&conn).await.unwrap();

        let client = Client {
            id: uuid::Uuid::new_v4(),
            name: "client".into(),
            connection_ids: vec![conn.id],
            filters: vec![],
            created_at: Utc::now(),
        };
        store.upsert_client(&client).await.unwrap();

        let poller = CentralPoller::new(
            store.clone(),
            vec![Box::new(AuthFailingHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let outcome = poller.run_once().await;
        assert_eq!(outcome.errors, 1);

        let reloaded = store.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, ConnectionState::Invalid);
        assert_eq!(reloaded.last_invalid_reason.as_deref(), Some("authentication error: token revoked"));

        let tasks = store.tasks_in_state(TaskState::ReadyForQualification).await.unwrap();
        assert!(tasks.iter().any(|t| t.task_type == CONNECTION_AUTH_FAILURE_TASK));
    }

    #[tokio::test]
    async fn test_connection_marks_valid_on_success() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let conn = http_connection();
        store.upsert_connection(&conn).await.unwrap();

        let poller = CentralPoller::new(
            store.clone(),
            vec![Box::new(AlwaysHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        poller.test_connection(conn.id).await.unwrap();

        let reloaded = store.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, ConnectionState::Valid);
    }

    #[tokio::test]
    async fn test_connection_marks_invalid_with_reason_on_failure() {
        let store = Arc::new(StagingStore::new_in_memory().await.unwrap());
        let conn = http_connection();
        store.upsert_connection(&conn).await.unwrap();

        let poller = CentralPoller::new(
            store.clone(),
            vec![Box::new(AuthFailingHandler)],
            4,
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let err = poller.test_connection(conn.id).await.unwrap_err();
        assert!(err.contains("token revoked"));

        let reloaded = store.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(reloaded.state, ConnectionState::Invalid);
    }
}
