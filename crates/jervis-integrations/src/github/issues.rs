use chrono::{DateTime, Utc};
use jervis_core::types::{SourceKind, StagedArtifact};
use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{GitHubComment, GitHubIssue, GitHubLabel, IssueState};

use super::client::GitHubClient;

/// Full-content issue search (§4.3 `IssueTrackerClient.searchFull`): pages
/// through every issue, optionally filtered to those updated since `since`,
/// and fetches each issue's complete comment thread. Never truncates —
/// issues with long comment threads still return in full.
pub async fn search_full(client: &GitHubClient, since: Option<DateTime<Utc>>) -> Result<Vec<GitHubIssue>> {
    let issue_handler = client.octocrab.issues(&client.owner, &client.repo);
    let mut page_num: u32 = 1;
    let mut out = Vec::new();

    loop {
        let mut handler = issue_handler.list().state(octocrab::params::State::All).page(page_num).per_page(100);
        if let Some(since) = since {
            handler = handler.since(since);
        }
        let page = handler.send().await?;
        if page.items.is_empty() {
            break;
        }

        for issue in &page.items {
            let comments = if issue.comments > 0 {
                fetch_comments(client, issue.number).await?
            } else {
                Vec::new()
            };
            out.push(octocrab_issue_to_github_issue(issue.clone(), comments));
        }

        if page.next.is_none() {
            break;
        }
        page_num += 1;
    }

    Ok(out)
}

pub async fn fetch_comments(client: &GitHubClient, issue_number: u64) -> Result<Vec<GitHubComment>> {
    let comments = client
        .octocrab
        .issues(&client.owner, &client.repo)
        .list_comments(issue_number)
        .per_page(100)
        .send()
        .await?;

    Ok(comments
        .items
        .into_iter()
        .map(|c| GitHubComment {
            author: c.user.login,
            body: c.body.unwrap_or_default(),
            created_at: c.created_at,
        })
        .collect())
}

/// Stage a fetched issue as a `StagedArtifact`, keyed by its issue number so
/// re-fetches land on the same row via `upsertIfNewer`.
pub fn issue_to_artifact(
    connection_id: Uuid,
    client_id: Uuid,
    project_id: Option<Uuid>,
    owner: &str,
    repo: &str,
    issue: &GitHubIssue,
) -> StagedArtifact {
    let source_key = format!("{owner}/{repo}#{}", issue.number);
    let full_content = json!({
        "number": issue.number,
        "title": issue.title,
        "body": issue.body,
        "state": issue.state,
        "labels": issue.labels,
        "assignees": issue.assignees,
        "author": issue.author,
        "comments": issue.comments,
        "html_url": issue.html_url,
    });

    StagedArtifact::new(
        SourceKind::IssueTracker,
        client_id,
        project_id,
        connection_id,
        source_key,
        full_content,
        issue.updated_at,
    )
}

fn octocrab_issue_to_github_issue(
    issue: octocrab::models::issues::Issue,
    comments: Vec<GitHubComment>,
) -> GitHubIssue {
    let state = match issue.state {
        octocrab::models::IssueState::Open => IssueState::Open,
        octocrab::models::IssueState::Closed => IssueState::Closed,
        _ => IssueState::Open,
    };

    let labels = issue
        .labels
        .iter()
        .map(|l| GitHubLabel {
            name: l.name.clone(),
            color: l.color.clone(),
            description: l.description.clone(),
        })
        .collect();

    let assignees = issue.assignees.iter().map(|a| a.login.clone()).collect();

    GitHubIssue {
        number: issue.number,
        title: issue.title,
        body: issue.body,
        state,
        labels,
        assignees,
        author: issue.user.login,
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        comments,
        html_url: issue.html_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_issue() -> GitHubIssue {
        let now = Utc::now();
        GitHubIssue {
            number: 7,
            title: "Add logging".to_string(),
            body: Some("We need better logging".to_string()),
            state: IssueState::Open,
            labels: vec![GitHubLabel {
                name: "enhancement".to_string(),
                color: "a2eeef".to_string(),
                description: None,
            }],
            assignees: vec![],
            author: "dev".to_string(),
            created_at: now,
            updated_at: now,
            comments: vec![GitHubComment {
                author: "reviewer".to_string(),
                body: "looks good".to_string(),
                created_at: now,
            }],
            html_url: "https://github.com/owner/repo/issues/7".to_string(),
        }
    }

    #[test]
    fn issue_to_artifact_keys_by_owner_repo_number() {
        let issue = sample_issue();
        let connection_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let artifact = issue_to_artifact(connection_id, client_id, None, "acme", "widgets", &issue);

        assert_eq!(artifact.source_key, "acme/widgets#7");
        assert_eq!(artifact.connection_id, connection_id);
        assert_eq!(artifact.full_content["title"], "Add logging");
        assert_eq!(artifact.full_content["comments"][0]["author"], "reviewer");
    }
}
