use chrono::Utc;
use jervis_core::staging::StagingStore;
use jervis_core::types::{LearnedPattern, LinkClassification, LinkVerdict, Task, UnsafeLink};
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QualifierError {
    #[error("staging store error: {0}")]
    Store(String),
    #[error("qualifier model error: {0}")]
    Model(String),
}

impl From<tokio_rusqlite::Error> for QualifierError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        QualifierError::Store(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Static pattern / domain lists
// ---------------------------------------------------------------------------

/// Query-string / path fragments that identify a one-click action link.
/// Matching any of these is an automatic UNSAFE regardless of domain.
const STATIC_PATH_BLACKLIST: &[&str] = &[
    "unsubscribe",
    "rsvp",
    "/accept",
    "/decline",
    "calendar/accept",
    "calendar/decline",
    "login",
    "verify",
    "confirm-email",
];

/// Known tracking query parameters. Any one present is enough to flag the
/// link as a tracking pixel or click-through redirector.
const TRACKING_PARAMS: &[&str] = &["utm_source", "utm_medium", "utm_campaign", "fbclid", "gclid"];

const DOMAIN_BLACKLIST: &[&str] = &[
    "mailchimp.com",
    "sendgrid.net",
    "constantcontact.com",
    "calendly.com",
    "doodle.com",
    "outlook.office365.com",
    "bit.ly",
    "tinyurl.com",
    "t.co",
    "google-analytics.com",
    "mixpanel.com",
];

const DOMAIN_WHITELIST: &[&str] = &[
    "github.com",
    "gitlab.com",
    "docs.rs",
    "crates.io",
    "developer.mozilla.org",
    "stackoverflow.com",
    "wikipedia.org",
];

const TRACKER_IMAGE_NAMES: &[&str] = &["pixel.gif", "open.png", "track.gif", "beacon.png"];

fn path_without_query(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase()
}

fn is_image_url(url: &str) -> bool {
    let path = path_without_query(url);
    path.ends_with(".gif") || path.ends_with(".png") || path.ends_with(".jpg") || path.ends_with(".jpeg")
}

fn is_tracker_image(url: &str) -> bool {
    let path = path_without_query(url);
    TRACKER_IMAGE_NAMES.iter().any(|name| path.ends_with(name))
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host = without_scheme.split(['/', '?', '#']).next()?;
    Some(host.trim_start_matches("www.").to_ascii_lowercase())
}

fn matches_static_blacklist(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    STATIC_PATH_BLACKLIST.iter().any(|needle| lower.contains(needle))
        || TRACKING_PARAMS.iter().any(|param| lower.contains(param))
}

fn matches_domain_list(host: &str, list: &[&str]) -> bool {
    list.iter().any(|d| host == *d || host.ends_with(&format!(".{d}")))
}

/// Heuristic signal for "looks like it needs a qualifier opinion": a long
/// opaque token in the query string, or a monitoring-shaped domain carrying
/// a `token=` parameter.
fn looks_uncertain(url: &str, host: &str) -> bool {
    let has_long_token = url
        .split(['?', '&'])
        .any(|part| part.len() > 40 && part.chars().any(|c| c.is_ascii_hexdigit()));
    let monitoring_domain = host.contains("status") || host.contains("monitor") || host.contains("alert");
    has_long_token || (monitoring_domain && url.contains("token="))
}

// ---------------------------------------------------------------------------
// LinkSafetyQualifier (C4)
// ---------------------------------------------------------------------------

/// Minimal qualifier-model client abstraction so the link classifier doesn't
/// depend directly on a specific LLM integration crate.
#[async_trait::async_trait]
pub trait QualifierModel: Send + Sync {
    async fn classify(&self, url: &str, surrounding_text: &str) -> Result<LinkClassification, QualifierError>;
}

/// Pessimistic link classifier. Never fetches a URL itself — only decides
/// whether the indexer is allowed to.
pub struct LinkSafetyQualifier {
    learned: Vec<(Uuid, Regex)>,
    model: Option<Box<dyn QualifierModel>>,
}

impl LinkSafetyQualifier {
    pub fn new(learned_patterns: &[LearnedPattern]) -> Self {
        let learned = learned_patterns
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| Regex::new(&p.pattern).ok().map(|re| (p.id, re)))
            .collect();
        Self { learned, model: None }
    }

    pub fn with_model(mut self, model: Box<dyn QualifierModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Evaluate a single URL against the static rule set only (steps 4-8 of
    /// the evaluation order). Store-backed steps live in
    /// [`LinkSafetyEvaluator`].
    pub async fn classify(&self, url: &str, surrounding_text: &str) -> LinkClassification {
        if is_image_url(url) {
            if is_tracker_image(url) {
                return LinkClassification {
                    verdict: LinkVerdict::Unsafe,
                    reason: "tracker image".into(),
                    suggested_pattern: None,
                };
            }
            return LinkClassification {
                verdict: LinkVerdict::Skip,
                reason: "ordinary image url, silently skipped".into(),
                suggested_pattern: None,
            };
        }

        if matches_static_blacklist(url) {
            return LinkClassification {
                verdict: LinkVerdict::Unsafe,
                reason: "matches static action/tracking pattern".into(),
                suggested_pattern: None,
            };
        }

        let host = host_of(url).unwrap_or_default();
        if matches_domain_list(&host, DOMAIN_BLACKLIST) {
            return LinkClassification {
                verdict: LinkVerdict::Unsafe,
                reason: format!("domain blacklisted: {host}"),
                suggested_pattern: None,
            };
        }
        if matches_domain_list(&host, DOMAIN_WHITELIST) {
            return LinkClassification {
                verdict: LinkVerdict::Safe,
                reason: format!("domain whitelisted: {host}"),
                suggested_pattern: None,
            };
        }

        if looks_uncertain(url, &host) {
            if let Some(model) = &self.model {
                match model.classify(url, surrounding_text).await {
                    Ok(classification) => return classification,
                    Err(e) => {
                        warn!(error = %e, url, "qualifier model unreachable, defaulting to uncertain");
                    }
                }
            }
            return LinkClassification {
                verdict: LinkVerdict::Uncertain,
                reason: "heuristic match, no model verdict available".into(),
                suggested_pattern: None,
            };
        }

        LinkClassification {
            verdict: LinkVerdict::Uncertain,
            reason: "no rule matched".into(),
            suggested_pattern: None,
        }
    }

    /// Check learned regexes before the rest of the pipeline runs; kept
    /// separate since it needs the staging-loaded pattern set, not the
    /// static tables above.
    pub fn matches_learned(&self, url: &str) -> Option<&Uuid> {
        self.learned.iter().find(|(_, re)| re.is_match(url)).map(|(id, _)| id)
    }
}

/// Orchestrates the full evaluation order from the store: indexed-link
/// short-circuit, unsafe-link cache, learned patterns, then the static
/// qualifier above, persisting side effects as it goes.
pub struct LinkSafetyEvaluator<'a> {
    store: &'a StagingStore,
    qualifier: LinkSafetyQualifier,
}

impl<'a> LinkSafetyEvaluator<'a> {
    pub fn new(store: &'a StagingStore, qualifier: LinkSafetyQualifier) -> Self {
        Self { store, qualifier }
    }

    pub async fn evaluate(
        &self,
        url: &str,
        client_id: Uuid,
        surrounding_text: &str,
    ) -> Result<LinkClassification, QualifierError> {
        if self.store.is_indexed_link(url, client_id).await? {
            return Ok(LinkClassification {
                verdict: LinkVerdict::Safe,
                reason: "already indexed".into(),
                suggested_pattern: None,
            });
        }

        if let Some(cached) = self.store.get_unsafe_link(url).await? {
            return Ok(LinkClassification {
                verdict: LinkVerdict::Unsafe,
                reason: cached.reason,
                suggested_pattern: None,
            });
        }

        if self.qualifier.matches_learned(url).is_some() {
            let classification = LinkClassification {
                verdict: LinkVerdict::Unsafe,
                reason: "matches learned pattern".into(),
                suggested_pattern: None,
            };
            self.cache_unsafe(url, &classification).await?;
            return Ok(classification);
        }

        let classification = self.qualifier.classify(url, surrounding_text).await;

        match classification.verdict {
            LinkVerdict::Unsafe => {
                self.cache_unsafe(url, &classification).await?;
            }
            LinkVerdict::Uncertain => {
                debug!(url, "link uncertain, review task would be raised by caller");
            }
            LinkVerdict::Safe | LinkVerdict::Skip => {}
        }

        Ok(classification)
    }

    async fn cache_unsafe(&self, url: &str, classification: &LinkClassification) -> Result<(), QualifierError> {
        self.store
            .cache_unsafe_link(&UnsafeLink {
                url: url.to_string(),
                reason: classification.reason.clone(),
                cached_at: Utc::now(),
            })
            .await?;
        if let Some(pattern) = &classification.suggested_pattern {
            self.store
                .add_pattern(&LearnedPattern {
                    id: Uuid::new_v4(),
                    pattern: pattern.clone(),
                    enabled: true,
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }
}

/// Builds the `LINK_SAFETY_REVIEW` task raised for an `UNCERTAIN` verdict,
/// carrying the surrounding text window (±150 chars) for a human or the
/// planner to judge.
pub fn build_review_task(url: &str, surrounding_text: &str, client_id: Uuid, project_id: Option<Uuid>) -> Task {
    const CONTEXT_RADIUS: usize = 150;
    let idx = surrounding_text.find(url).unwrap_or(0);
    let start = idx.saturating_sub(CONTEXT_RADIUS);
    let end = (idx + url.len() + CONTEXT_RADIUS).min(surrounding_text.len());
    let window = &surrounding_text[start.min(surrounding_text.len())..end.max(start)];

    let content = serde_json::json!({ "url": url, "context": window }).to_string();
    let mut task = Task::new(
        "LINK_SAFETY_REVIEW",
        content,
        client_id,
        jervis_core::types::ProcessingMode::Background,
    );
    task.project_id = project_id;
    task
}
