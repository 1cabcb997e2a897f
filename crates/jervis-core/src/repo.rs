use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("git operation failed: {0}")]
    Git(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("path not found: {0}")]
    PathNotFound(String),
}

pub type Result<T> = std::result::Result<T, RepoError>;

// ---------------------------------------------------------------------------
// CommitRecord — the shape staged for a git remote source
// ---------------------------------------------------------------------------

/// A single commit, as staged for indexing. `diff` holds the unified patch
/// text against the commit's first parent (empty for the initial commit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub oid: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub diff: String,
}
