//! In-process git read access via libgit2 (the `git2` crate).
//!
//! Jervis ingests commit history as staged artifacts. It never shells out to
//! `git` and never writes to a repository — `GitRemote` only opens, walks,
//! and diffs.
//!
//! # Feature gated
//!
//! Only available with the `libgit2` feature flag (enabled by default).

use std::path::{Path, PathBuf};

use crate::repo::{CommitRecord, RepoError};

impl From<git2::Error> for RepoError {
    fn from(e: git2::Error) -> Self {
        RepoError::Git(e.message().to_string())
    }
}

/// A read-only handle onto a local git checkout, used by the git source
/// client to pull incremental commit history.
///
/// Stateless beyond the open handle — each call walks fresh from HEAD so a
/// long-lived `GitRemote` never serves a stale view of the repository.
pub struct GitRemote {
    repo: git2::Repository,
    path: PathBuf,
}

impl GitRemote {
    pub fn open(workdir: impl AsRef<Path>) -> Result<Self, RepoError> {
        let workdir = workdir.as_ref();
        let repo = git2::Repository::discover(workdir)
            .map_err(|_| RepoError::NotARepo(workdir.display().to_string()))?;
        Ok(Self {
            repo,
            path: workdir.to_path_buf(),
        })
    }

    pub fn is_repo(workdir: impl AsRef<Path>) -> bool {
        git2::Repository::discover(workdir.as_ref()).is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk commits reachable from HEAD, newest first, stopping once
    /// `since_oid` is reached (exclusive). With `since_oid: None`, returns up
    /// to `limit` commits from HEAD — used for the initial backfill.
    pub fn list_commits_since(
        &self,
        since_oid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitRecord>, RepoError> {
        let mut revwalk = self.repo.revwalk().map_err(RepoError::from)?;
        revwalk.push_head().map_err(RepoError::from)?;
        revwalk.set_sorting(git2::Sort::TIME).map_err(RepoError::from)?;

        let mut commits = Vec::new();
        for oid_result in revwalk {
            let oid = oid_result.map_err(RepoError::from)?;
            let oid_str = oid.to_string();
            if Some(oid_str.as_str()) == since_oid {
                break;
            }
            if commits.len() >= limit {
                break;
            }

            let commit = self.repo.find_commit(oid).map_err(RepoError::from)?;
            let diff = self.diff_against_first_parent(&commit)?;
            commits.push(self.to_record(&commit, diff));
        }

        Ok(commits)
    }

    fn diff_against_first_parent(&self, commit: &git2::Commit<'_>) -> Result<String, RepoError> {
        let tree = commit.tree().map_err(RepoError::from)?;
        let parent_tree = commit
            .parent(0)
            .ok()
            .and_then(|p| p.tree().ok());

        let diff = self
            .repo
            .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
            .map_err(RepoError::from)?;

        let mut patch = String::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            if let Ok(content) = std::str::from_utf8(line.content()) {
                match line.origin() {
                    '+' | '-' | ' ' => patch.push(line.origin()),
                    _ => {}
                }
                patch.push_str(content);
            }
            true
        })
        .map_err(RepoError::from)?;

        Ok(patch)
    }

    fn to_record(&self, commit: &git2::Commit<'_>, diff: String) -> CommitRecord {
        let author = commit.author();
        let timestamp = chrono::DateTime::from_timestamp(commit.time().seconds(), 0)
            .unwrap_or_else(chrono::Utc::now);

        CommitRecord {
            oid: commit.id().to_string(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("unknown").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            timestamp,
            diff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        let manifest = env!("CARGO_MANIFEST_DIR");
        PathBuf::from(manifest)
            .parent()
            .and_then(|p| p.parent())
            .expect("workspace root")
            .to_path_buf()
    }

    #[test]
    fn is_repo_detects_git() {
        let root = workspace_root();
        assert!(GitRemote::is_repo(&root));
        assert!(!GitRemote::is_repo(Path::new("/nonexistent/path")));
    }

    #[test]
    fn list_commits_since_none_returns_up_to_limit() {
        let root = workspace_root();
        let remote = GitRemote::open(&root).unwrap();
        let commits = remote.list_commits_since(None, 5).unwrap();
        assert!(commits.len() <= 5);
        if let Some(first) = commits.first() {
            assert!(!first.oid.is_empty());
            assert!(!first.author_name.is_empty());
        }
    }

    #[test]
    fn list_commits_since_oid_excludes_that_commit() {
        let root = workspace_root();
        let remote = GitRemote::open(&root).unwrap();
        let all = remote.list_commits_since(None, 3).unwrap();
        if all.len() >= 2 {
            let cutoff = &all[1].oid;
            let since = remote.list_commits_since(Some(cutoff), 10).unwrap();
            assert!(since.iter().all(|c| &c.oid != cutoff));
        }
    }
}
