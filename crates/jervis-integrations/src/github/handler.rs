use async_trait::async_trait;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Client, Connection, ConnectionKind, PollingCursor};

use crate::error::Result;
use crate::handler::PollingHandler;
use crate::types::PollOutcome;

use super::client::GitHubClient;
use super::issues;

/// Issue-tracker polling handler for GitHub-hosted repositories (§4.7
/// "IssueTracker"). One connection maps to one repository; each client
/// referencing it may narrow ingestion to a label subset via
/// `ConnectionFilter::project_keys`.
pub struct GitHubIssueHandler;

#[async_trait]
impl PollingHandler for GitHubIssueHandler {
    fn can_handle(&self, connection: &Connection) -> bool {
        matches!(&connection.kind, ConnectionKind::Http { base_url, .. } if base_url.contains("github.com"))
    }

    async fn poll(&self, store: &StagingStore, connection: &Connection, clients: &[Client]) -> Result<PollOutcome> {
        let client = GitHubClient::from_connection(connection)?;
        let cursor = store.get_cursor(connection.id).await?;
        let issues = issues::search_full(&client, cursor.updated_at).await?;

        let mut outcome = PollOutcome {
            discovered: issues.len() as u64,
            ..Default::default()
        };

        for c in clients {
            let label_filter = c
                .filters
                .iter()
                .find(|f| f.connection_id == connection.id)
                .map(|f| f.project_keys.clone())
                .unwrap_or_default();

            for issue in &issues {
                if !label_filter.is_empty() && !issue.labels.iter().any(|l| label_filter.contains(&l.name)) {
                    outcome.skipped += 1;
                    continue;
                }

                let artifact =
                    issues::issue_to_artifact(connection.id, c.id, None, client.owner(), client.repo(), issue);
                match store.upsert_if_newer(&artifact).await {
                    Ok(true) => outcome.created += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(_) => outcome.errors += 1,
                }
            }
        }

        if let Some(max_updated) = issues.iter().map(|i| i.updated_at).max() {
            store
                .upsert_cursor(&PollingCursor {
                    connection_id: connection.id,
                    last_fetched_uid: None,
                    last_etag: None,
                    last_changelog_id: None,
                    updated_at: Some(max_updated),
                })
                .await?;
        }

        Ok(outcome)
    }

    async fn test_connection(&self, connection: &Connection) -> Result<()> {
        let client = GitHubClient::from_connection(connection)?;
        client.octocrab.current().user().await.map_err(crate::error::SourceError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jervis_core::types::AuthType;

    #[test]
    fn can_handle_matches_github_http_connections() {
        let handler = GitHubIssueHandler;
        let github = Connection::new(
            "github".to_string(),
            ConnectionKind::Http {
                base_url: "https://github.com/acme/widgets".to_string(),
                auth_type: AuthType::Bearer,
                credentials: Some("token".to_string()),
                timeout_ms: 10_000,
            },
        );
        let other = Connection::new(
            "jira".to_string(),
            ConnectionKind::Http {
                base_url: "https://acme.atlassian.net".to_string(),
                auth_type: AuthType::Basic,
                credentials: Some("token".to_string()),
                timeout_ms: 10_000,
            },
        );
        assert!(handler.can_handle(&github));
        assert!(!handler.can_handle(&other));
    }
}
