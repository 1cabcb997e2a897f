use octocrab::Octocrab;

use jervis_core::types::{AuthType, Connection, ConnectionKind};

use crate::error::{Result, SourceError};

/// Issue-tracker façade over a single GitHub repository, built from a
/// `Connection` of kind `Http` whose `base_url` identifies `owner/repo`
/// (e.g. `https://github.com/owner/repo`) and whose `credentials` carry a
/// personal access token.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    pub(crate) octocrab: Octocrab,
    pub(crate) owner: String,
    pub(crate) repo: String,
}

impl GitHubClient {
    /// Build a client from a registered connection. Returns `SourceError::Auth`
    /// if the connection carries no credentials — callers should route that
    /// into the connection registry's `markInvalid`.
    pub fn from_connection(connection: &Connection) -> Result<Self> {
        let ConnectionKind::Http {
            base_url,
            auth_type,
            credentials,
            ..
        } = &connection.kind
        else {
            return Err(SourceError::Permanent(
                "github connection must be of kind Http".to_string(),
            ));
        };

        if *auth_type != AuthType::Bearer && *auth_type != AuthType::ApiKey {
            return Err(SourceError::Permanent(
                "github connection must use bearer or api-key auth".to_string(),
            ));
        }

        let token = credentials
            .clone()
            .ok_or_else(|| SourceError::Auth("missing GitHub token".to_string()))?;

        let (owner, repo) = parse_owner_repo(base_url)
            .ok_or_else(|| SourceError::Permanent(format!("cannot parse owner/repo from {base_url}")))?;

        let octocrab = Octocrab::builder()
            .personal_token(token)
            .build()
            .map_err(|e| SourceError::Permanent(e.to_string()))?;

        Ok(Self { octocrab, owner, repo })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }
}

fn parse_owner_repo(base_url: &str) -> Option<(String, String)> {
    let trimmed = base_url.trim_end_matches('/');
    let path = trimmed.split("github.com/").nth(1)?;
    let mut parts = path.splitn(2, '/');
    let owner = parts.next()?.to_string();
    let repo = parts.next()?.trim_end_matches(".git").to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_owner_repo_from_https_url() {
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widgets"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(
            parse_owner_repo("https://github.com/acme/widgets.git"),
            Some(("acme".to_string(), "widgets".to_string()))
        );
        assert_eq!(parse_owner_repo("https://example.com/acme/widgets"), None);
    }

    #[test]
    fn from_connection_rejects_missing_credentials() {
        let connection = Connection::new(
            "github".to_string(),
            ConnectionKind::Http {
                base_url: "https://github.com/acme/widgets".to_string(),
                auth_type: AuthType::Bearer,
                credentials: None,
                timeout_ms: 10_000,
            },
        );
        let result = GitHubClient::from_connection(&connection);
        assert!(matches!(result, Err(SourceError::Auth(_))));
    }
}
