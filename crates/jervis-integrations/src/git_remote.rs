//! Git source client and polling handler (§4.3 `GitRemote`, §4.7 "Git").
//!
//! Clone/fetch happen in-process via `git2` — no `git` subprocess is ever
//! spawned. Commit listing itself is delegated to
//! [`jervis_core::git2_ops::GitRemote`] once a local checkout exists, so the
//! walk/diff logic lives in exactly one place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use jervis_core::git2_ops::GitRemote as LocalGitRemote;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Client, Connection, ConnectionKind, PollingCursor, SourceKind, StagedArtifact};
use serde_json::json;

use crate::error::{Result, SourceError};
use crate::handler::PollingHandler;
use crate::types::PollOutcome;

const BRANCH_CANDIDATES: &[&str] = &["main", "master", "trunk"];
const BACKFILL_LIMIT: usize = 500;

/// Clones or fetches a remote into a per-connection working directory under
/// `workspace_root`, then stages its commit history.
pub struct GitPollingHandler {
    workspace_root: PathBuf,
}

impl GitPollingHandler {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn workdir(&self, connection: &Connection) -> PathBuf {
        self.workspace_root.join(connection.id.to_string())
    }
}

#[async_trait]
impl PollingHandler for GitPollingHandler {
    fn can_handle(&self, connection: &Connection) -> bool {
        matches!(&connection.kind, ConnectionKind::Http { base_url, .. } if base_url.ends_with(".git"))
    }

    async fn poll(&self, store: &StagingStore, connection: &Connection, clients: &[Client]) -> Result<PollOutcome> {
        let ConnectionKind::Http {
            base_url,
            credentials,
            ..
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not a git http connection".to_string()));
        };

        let workdir = self.workdir(connection);
        let cursor = store.get_cursor(connection.id).await?;
        let since_oid = cursor.last_changelog_id.clone();

        let (commits, branch_used) = {
            let workdir = workdir.clone();
            let since_oid = since_oid.clone();
            tokio::task::spawn_blocking(move || clone_or_fetch_and_list(&workdir, &base_url, credentials.as_deref(), since_oid.as_deref()))
                .await
                .map_err(|e| SourceError::Transient(e.to_string()))??
        };

        let mut outcome = PollOutcome {
            discovered: commits.len() as u64,
            ..Default::default()
        };

        for c in clients {
            for commit in &commits {
                let artifact = StagedArtifact::new(
                    SourceKind::Git,
                    c.id,
                    None,
                    connection.id,
                    commit.oid.clone(),
                    json!({
                        "message": commit.message,
                        "author_name": commit.author_name,
                        "author_email": commit.author_email,
                        "diff": commit.diff,
                        "branch": branch_used,
                    }),
                    commit.timestamp,
                );
                match store.upsert_if_newer(&artifact).await {
                    Ok(true) => outcome.created += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(_) => outcome.errors += 1,
                }
            }
        }

        if let Some(newest) = commits.first() {
            store
                .upsert_cursor(&PollingCursor {
                    connection_id: connection.id,
                    last_fetched_uid: None,
                    last_etag: None,
                    last_changelog_id: Some(newest.oid.clone()),
                    updated_at: Some(Utc::now()),
                })
                .await?;
        }

        Ok(outcome)
    }

    async fn test_connection(&self, connection: &Connection) -> Result<()> {
        let ConnectionKind::Http {
            base_url,
            credentials,
            ..
        } = connection.kind.clone()
        else {
            return Err(SourceError::Permanent("not a git http connection".to_string()));
        };

        tokio::task::spawn_blocking(move || probe_remote(&base_url, credentials.as_deref()))
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?
    }
}

/// `testConnection` probe (§4.1): connect to the remote and list its refs
/// without cloning or fetching anything to disk.
fn probe_remote(remote_url: &str, credentials: Option<&str>) -> std::result::Result<(), SourceError> {
    let mut remote = git2::Remote::create_detached(remote_url).map_err(|e| SourceError::Permanent(e.message().to_string()))?;
    remote
        .connect_auth(git2::Direction::Fetch, Some(remote_callbacks(credentials)), None)
        .map_err(|e| SourceError::Auth(e.message().to_string()))?;
    let _ = remote.disconnect();
    Ok(())
}

fn clone_or_fetch_and_list(
    workdir: &Path,
    remote_url: &str,
    credentials: Option<&str>,
    since_oid: Option<&str>,
) -> std::result::Result<(Vec<jervis_core::repo::CommitRecord>, String), SourceError> {
    let branch_used = if LocalGitRemote::is_repo(workdir) {
        fetch(workdir, remote_url, credentials)?
    } else {
        std::fs::create_dir_all(workdir).map_err(|e| SourceError::Permanent(e.to_string()))?;
        clone_with_branch_fallback(workdir, remote_url, credentials)?
    };

    let remote = LocalGitRemote::open(workdir).map_err(|e| SourceError::Permanent(e.to_string()))?;
    let commits = remote
        .list_commits_since(since_oid, BACKFILL_LIMIT)
        .map_err(|e| SourceError::Permanent(e.to_string()))?;

    Ok((commits, branch_used))
}

fn remote_callbacks(credentials: Option<&str>) -> git2::RemoteCallbacks<'static> {
    let credentials = credentials.map(|s| s.to_string());
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, _allowed| {
        if let Some(token) = &credentials {
            git2::Cred::userpass_plaintext(token, "")
        } else {
            git2::Cred::default().or_else(|_| git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git")))
        }
    });
    callbacks
}

fn fetch(workdir: &Path, remote_url: &str, credentials: Option<&str>) -> std::result::Result<String, SourceError> {
    let repo = git2::Repository::open(workdir).map_err(|e| SourceError::Permanent(e.message().to_string()))?;
    let mut remote = repo
        .find_remote("origin")
        .or_else(|_| repo.remote("origin", remote_url))
        .map_err(|e| SourceError::Permanent(e.message().to_string()))?;

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(credentials));
    remote
        .fetch(&[] as &[&str], Some(&mut fetch_options), None)
        .map_err(|e| SourceError::Transient(e.message().to_string()))?;

    discover_branch(&repo)
}

fn clone_with_branch_fallback(workdir: &Path, remote_url: &str, credentials: Option<&str>) -> std::result::Result<String, SourceError> {
    let mut last_err = None;
    for branch in BRANCH_CANDIDATES {
        let mut fetch_options = git2::FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks(credentials));
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_options);
        builder.branch(branch);

        match builder.clone(remote_url, workdir) {
            Ok(_) => return Ok(branch.to_string()),
            Err(e) => last_err = Some(e),
        }
    }

    // Final attempt without pinning a branch, to pick up whatever the
    // remote's default is when none of the candidates exist.
    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(remote_callbacks(credentials));
    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_options);
    match builder.clone(remote_url, workdir) {
        Ok(repo) => discover_branch(&repo),
        Err(_) => Err(SourceError::Permanent(
            last_err.map(|e| e.message().to_string()).unwrap_or_else(|| "clone failed".to_string()),
        )),
    }
}

fn discover_branch(repo: &git2::Repository) -> std::result::Result<String, SourceError> {
    let head = repo.head().map_err(|e| SourceError::Permanent(e.message().to_string()))?;
    Ok(head.shorthand().unwrap_or("HEAD").to_string())
}
