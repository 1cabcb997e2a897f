//! Wiki source client and polling handler (§4.3 `WikiClient`, §4.7 "Wiki").
//!
//! Targets a Confluence-shaped REST API (`/rest/api/content`) — the most
//! common self-hosted wiki surface — behind the same `Connection::Http`
//! variant the issue-tracker client uses, distinguished by `can_handle`
//! matching the configured `wiki_spaces` filter rather than the host name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jervis_core::staging::StagingStore;
use jervis_core::types::{AuthType, Client, Connection, ConnectionKind, PollingCursor, SourceKind, StagedArtifact};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Result, SourceError};
use crate::handler::PollingHandler;
use crate::types::{PollOutcome, WikiPage};

pub struct WikiClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: Option<HeaderValue>,
}

impl WikiClient {
    pub fn from_connection(connection: &Connection) -> Result<Self> {
        let ConnectionKind::Http {
            base_url,
            auth_type,
            credentials,
            timeout_ms,
        } = &connection.kind
        else {
            return Err(SourceError::Permanent("wiki connection must be of kind Http".to_string()));
        };

        let auth_header = match auth_type {
            AuthType::None => None,
            AuthType::Bearer | AuthType::ApiKey => {
                let token = credentials.clone().ok_or_else(|| SourceError::Auth("missing wiki token".to_string()))?;
                Some(
                    HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|e| SourceError::Permanent(e.to_string()))?,
                )
            }
            AuthType::Basic => {
                let credentials = credentials.clone().ok_or_else(|| SourceError::Auth("missing wiki credentials".to_string()))?;
                Some(
                    HeaderValue::from_str(&format!("Basic {credentials}"))
                        .map_err(|e| SourceError::Permanent(e.to_string()))?,
                )
            }
        };

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(*timeout_ms))
            .build()
            .map_err(SourceError::from)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = &self.auth_header {
            headers.insert(AUTHORIZATION, value.clone());
        }
        headers
    }

    /// `WikiClient.searchPages` — one space, full content per page.
    pub async fn search_pages(&self, space: &str, since: Option<DateTime<Utc>>) -> Result<Vec<WikiPage>> {
        let mut pages = Vec::new();
        let mut start = 0u32;
        loop {
            let url = format!(
                "{}/rest/api/content?spaceKey={}&expand=body.storage,version&limit=50&start={}",
                self.base_url, space, start
            );
            let resp: ContentPage = self
                .http
                .get(&url)
                .headers(self.headers())
                .send()
                .await
                .map_err(SourceError::from)?
                .error_for_status()
                .map_err(SourceError::from)?
                .json()
                .await
                .map_err(SourceError::from)?;

            let fetched = resp.results.len();
            for result in resp.results {
                let page = content_to_page(result, space);
                if since.map(|s| page.updated_at > s).unwrap_or(true) {
                    pages.push(page);
                }
            }

            if fetched < 50 {
                break;
            }
            start += 50;
        }
        Ok(pages)
    }

    /// `testConnection` probe (§4.1): list the first page of content without
    /// pulling any body text, just enough to prove the credentials work.
    pub async fn ping(&self) -> Result<()> {
        let url = format!("{}/rest/api/content?limit=1", self.base_url);
        self.http
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(SourceError::from)?
            .error_for_status()
            .map_err(SourceError::from)?;
        Ok(())
    }

    pub async fn get_page(&self, space: &str, id: &str) -> Result<WikiPage> {
        let url = format!("{}/rest/api/content/{}?expand=body.storage,version", self.base_url, id);
        let result: Content = self
            .http
            .get(&url)
            .headers(self.headers())
            .send()
            .await
            .map_err(SourceError::from)?
            .error_for_status()
            .map_err(SourceError::from)?
            .json()
            .await
            .map_err(SourceError::from)?;
        Ok(content_to_page(result, space))
    }
}

#[derive(Deserialize)]
struct ContentPage {
    results: Vec<Content>,
}

#[derive(Deserialize)]
struct Content {
    id: String,
    title: String,
    body: ContentBody,
    version: ContentVersion,
    #[serde(rename = "_links")]
    links: ContentLinks,
}

#[derive(Deserialize)]
struct ContentBody {
    storage: ContentStorage,
}

#[derive(Deserialize)]
struct ContentStorage {
    value: String,
}

#[derive(Deserialize)]
struct ContentVersion {
    number: u64,
    when: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ContentLinks {
    webui: String,
}

fn content_to_page(content: Content, space: &str) -> WikiPage {
    WikiPage {
        id: content.id,
        space: space.to_string(),
        title: content.title,
        body: content.body.storage.value,
        version: content.version.number,
        updated_at: content.version.when,
        url: content.links.webui,
    }
}

pub struct WikiPollingHandler;

#[async_trait]
impl PollingHandler for WikiPollingHandler {
    fn can_handle(&self, connection: &Connection) -> bool {
        matches!(&connection.kind, ConnectionKind::Http { base_url, .. } if base_url.contains("/wiki") || base_url.contains("atlassian.net"))
    }

    async fn poll(&self, store: &StagingStore, connection: &Connection, clients: &[Client]) -> Result<PollOutcome> {
        let client = WikiClient::from_connection(connection)?;
        let cursor = store.get_cursor(connection.id).await?;
        let mut outcome = PollOutcome::default();
        let mut max_updated = cursor.updated_at;

        for c in clients {
            let spaces: Vec<String> = c
                .filters
                .iter()
                .find(|f| f.connection_id == connection.id)
                .map(|f| f.wiki_spaces.clone())
                .unwrap_or_default();

            for space in &spaces {
                let pages = client.search_pages(space, cursor.updated_at).await?;
                outcome.discovered += pages.len() as u64;
                for page in pages {
                    max_updated = Some(max_updated.map_or(page.updated_at, |m| m.max(page.updated_at)));
                    let artifact = StagedArtifact::new(
                        SourceKind::Wiki,
                        c.id,
                        None,
                        connection.id,
                        format!("{space}/{}", page.id),
                        json!({
                            "title": page.title,
                            "body": page.body,
                            "version": page.version,
                            "url": page.url,
                        }),
                        page.updated_at,
                    );
                    match store.upsert_if_newer(&artifact).await {
                        Ok(true) => outcome.created += 1,
                        Ok(false) => outcome.skipped += 1,
                        Err(_) => outcome.errors += 1,
                    }
                }
            }
        }

        store
            .upsert_cursor(&PollingCursor {
                connection_id: connection.id,
                last_fetched_uid: None,
                last_etag: None,
                last_changelog_id: None,
                updated_at: max_updated,
            })
            .await?;

        Ok(outcome)
    }

    async fn test_connection(&self, connection: &Connection) -> Result<()> {
        WikiClient::from_connection(connection)?.ping().await
    }
}
