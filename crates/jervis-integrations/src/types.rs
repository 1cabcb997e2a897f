use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A GitHub issue as fetched by [`crate::github::issues::search_full`],
/// including its full comment thread — the issue-tracker source shape
/// staged into `StagedArtifact::full_content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubIssue {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: IssueState,
    pub labels: Vec<GitHubLabel>,
    pub assignees: Vec<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub comments: Vec<GitHubComment>,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubLabel {
    pub name: String,
    pub color: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubComment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A wiki page fetched by [`crate::wiki::WikiClient`], staged as one
/// artifact per page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPage {
    pub id: String,
    pub space: String,
    pub title: String,
    pub body: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub url: String,
}

/// A single fetched mailbox message, staged as one artifact keyed by its
/// protocol-appropriate `sourceKey` (IMAP UID or `Message-ID`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub uid: u64,
    pub message_id: String,
    pub folder: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub attachments: Vec<MailAttachment>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Outcome of a single polling pass over one connection (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollOutcome {
    pub discovered: u64,
    pub created: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl PollOutcome {
    pub fn merge(&mut self, other: PollOutcome) {
        self.discovered += other.discovered;
        self.created += other.created;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}
