//! API Profiles — multi-provider endpoint configuration and failover.
//!
//! Supports:
//! - **Anthropic** (direct API)
//! - **OpenRouter** (400+ models, unified API)
//! - **Custom** (any Anthropic-compatible endpoint)
//! - **Account failover**: Automatic switching on rate limits or errors
//! - **Cost tracking**: Per-profile usage and spend tracking

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::llm::{AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LocalProvider, OpenAiProvider};

// ---------------------------------------------------------------------------
// ApiProfile — a configured API endpoint
// ---------------------------------------------------------------------------

/// A configured API profile for an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiProfile {
    pub id: Uuid,
    pub name: String,
    pub provider: ProviderKind,
    /// Base URL for the API (e.g., "https://api.anthropic.com").
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Default model ID to use with this profile.
    pub default_model: String,
    /// Maximum requests per minute.
    pub rate_limit_rpm: Option<u32>,
    /// Maximum tokens per minute.
    pub rate_limit_tpm: Option<u32>,
    /// Priority for failover (lower = higher priority).
    pub priority: u32,
    /// Whether this profile is enabled.
    pub enabled: bool,
    /// Custom headers to send with requests.
    pub custom_headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    OpenRouter,
    OpenAi,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenRouter => "https://openrouter.ai/api",
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::Custom => "http://localhost:8080",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::OpenRouter => "OPENROUTER_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Custom => "CUSTOM_API_KEY",
        }
    }
}

impl ApiProfile {
    pub fn new(name: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider,
            base_url: provider.default_base_url().into(),
            api_key_env: provider.default_api_key_env().into(),
            default_model: default_model_for(provider),
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            priority: 0,
            enabled: true,
            custom_headers: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Check if an API key is available in the environment.
    pub fn has_api_key(&self) -> bool {
        std::env::var(&self.api_key_env).is_ok()
    }
}

fn default_model_for(provider: ProviderKind) -> String {
    match provider {
        ProviderKind::Anthropic => "claude-sonnet-4-20250514".into(),
        ProviderKind::OpenRouter => "anthropic/claude-sonnet-4-20250514".into(),
        ProviderKind::OpenAi => "gpt-4o".into(),
        ProviderKind::Custom => "default".into(),
    }
}

// ---------------------------------------------------------------------------
// ProfileUsage — per-profile usage tracking
// ---------------------------------------------------------------------------

/// Usage metrics for an API profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileUsage {
    pub profile_id: Uuid,
    pub total_requests: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_errors: u64,
    pub total_rate_limits: u64,
    /// Estimated spend in USD.
    pub estimated_spend_usd: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProfileUsage {
    pub fn new(profile_id: Uuid) -> Self {
        Self {
            profile_id,
            total_requests: 0,
            total_tokens_in: 0,
            total_tokens_out: 0,
            total_errors: 0,
            total_rate_limits: 0,
            estimated_spend_usd: 0.0,
            last_used: None,
            last_error: None,
        }
    }

    /// Record a successful request.
    pub fn record_success(&mut self, tokens_in: u64, tokens_out: u64, cost_usd: f64) {
        self.total_requests += 1;
        self.total_tokens_in += tokens_in;
        self.total_tokens_out += tokens_out;
        self.estimated_spend_usd += cost_usd;
        self.last_used = Some(Utc::now());
    }

    /// Record an error (counts as a request for error-rate purposes).
    pub fn record_error(&mut self, error: impl Into<String>) {
        self.total_requests += 1;
        self.total_errors += 1;
        self.last_error = Some(error.into());
    }

    /// Record a rate limit hit.
    pub fn record_rate_limit(&mut self) {
        self.total_rate_limits += 1;
    }

    /// Error rate as a fraction.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_requests as f64
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileRegistry — manages API profiles with failover
// ---------------------------------------------------------------------------

/// Registry of API profiles with automatic failover.
pub struct ProfileRegistry {
    profiles: HashMap<Uuid, ApiProfile>,
    usage: HashMap<Uuid, ProfileUsage>,
    /// Profiles sorted by priority for failover.
    priority_order: Vec<Uuid>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            usage: HashMap::new(),
            priority_order: Vec::new(),
        }
    }

    /// Add a profile.
    pub fn add_profile(&mut self, profile: ApiProfile) -> Uuid {
        let id = profile.id;
        self.usage.insert(id, ProfileUsage::new(id));
        self.profiles.insert(id, profile);
        self.rebuild_priority_order();
        id
    }

    /// Get a profile by ID.
    pub fn get_profile(&self, id: &Uuid) -> Option<&ApiProfile> {
        self.profiles.get(id)
    }

    /// Get a profile by name.
    pub fn get_by_name(&self, name: &str) -> Option<&ApiProfile> {
        self.profiles.values().find(|p| p.name == name)
    }

    /// Get usage for a profile.
    pub fn get_usage(&self, id: &Uuid) -> Option<&ProfileUsage> {
        self.usage.get(id)
    }

    /// Get mutable usage for a profile.
    pub fn get_usage_mut(&mut self, id: &Uuid) -> Option<&mut ProfileUsage> {
        self.usage.get_mut(id)
    }

    /// List all profiles ordered by priority.
    pub fn list_profiles(&self) -> Vec<&ApiProfile> {
        self.priority_order
            .iter()
            .filter_map(|id| self.profiles.get(id))
            .collect()
    }

    /// Get the best available profile (enabled, has API key, lowest error rate).
    pub fn best_available(&self) -> Option<&ApiProfile> {
        for id in &self.priority_order {
            if let Some(profile) = self.profiles.get(id) {
                if profile.enabled && profile.has_api_key() {
                    // Check error rate isn't too high
                    if let Some(usage) = self.usage.get(id) {
                        if usage.error_rate() < 0.5 || usage.total_requests < 5 {
                            return Some(profile);
                        }
                    } else {
                        return Some(profile);
                    }
                }
            }
        }
        None
    }

    /// Get the next failover profile (skip the given profile).
    pub fn failover_for(&self, current_id: &Uuid) -> Option<&ApiProfile> {
        let mut found_current = false;
        for id in &self.priority_order {
            if id == current_id {
                found_current = true;
                continue;
            }
            if found_current {
                if let Some(profile) = self.profiles.get(id) {
                    if profile.enabled && profile.has_api_key() {
                        return Some(profile);
                    }
                }
            }
        }
        None
    }

    /// Remove a profile.
    pub fn remove_profile(&mut self, id: &Uuid) -> Option<ApiProfile> {
        self.usage.remove(id);
        let result = self.profiles.remove(id);
        if result.is_some() {
            self.rebuild_priority_order();
        }
        result
    }

    /// Number of profiles.
    pub fn count(&self) -> usize {
        self.profiles.len()
    }

    /// Enable or disable a profile.
    pub fn set_enabled(&mut self, id: &Uuid, enabled: bool) -> bool {
        if let Some(profile) = self.profiles.get_mut(id) {
            profile.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Profile ids in priority order, filtered to enabled profiles that have
    /// a usable API key. Used to build a failover chain: the qualifier tries
    /// each in order until one succeeds.
    pub fn ordered_candidates(&self) -> Vec<Uuid> {
        self.priority_order
            .iter()
            .filter(|id| {
                self.profiles
                    .get(*id)
                    .is_some_and(|p| p.enabled && p.has_api_key())
            })
            .copied()
            .collect()
    }

    fn rebuild_priority_order(&mut self) {
        let mut entries: Vec<(Uuid, u32)> = self
            .profiles
            .values()
            .map(|p| (p.id, p.priority))
            .collect();
        entries.sort_by_key(|(_, priority)| *priority);
        self.priority_order = entries.into_iter().map(|(id, _)| id).collect();
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// FailoverLlmProvider — registry-backed provider selection (§4.10)
// ---------------------------------------------------------------------------

fn build_provider(profile: &ApiProfile, api_key: String) -> Box<dyn LlmProvider> {
    match profile.provider {
        ProviderKind::Anthropic => {
            Box::new(AnthropicProvider::new(api_key).with_base_url(profile.base_url.clone()))
        }
        ProviderKind::OpenRouter | ProviderKind::OpenAi => {
            Box::new(OpenAiProvider::new(api_key).with_base_url(profile.base_url.clone()))
        }
        ProviderKind::Custom => Box::new(LocalProvider::new(profile.base_url.clone(), Some(api_key))),
    }
}

/// An [`LlmProvider`] that dispatches through a [`ProfileRegistry`],
/// trying each enabled profile in priority order and failing over to the
/// next on error. Usage and error counts feed back into the registry so
/// `best_available` routes around profiles with a high recent error rate.
pub struct FailoverLlmProvider {
    registry: Mutex<ProfileRegistry>,
}

impl FailoverLlmProvider {
    pub fn new(registry: ProfileRegistry) -> Self {
        Self {
            registry: Mutex::new(registry),
        }
    }

    /// Run a closure with exclusive access to the underlying registry, e.g.
    /// to inspect per-profile usage for observability.
    pub async fn with_registry<R>(&self, f: impl FnOnce(&ProfileRegistry) -> R) -> R {
        f(&*self.registry.lock().await)
    }
}

#[async_trait]
impl LlmProvider for FailoverLlmProvider {
    async fn complete(&self, messages: &[LlmMessage], config: &LlmConfig) -> Result<LlmResponse, LlmError> {
        let (candidates, profiles): (Vec<Uuid>, HashMap<Uuid, ApiProfile>) = {
            let reg = self.registry.lock().await;
            let ids = reg.ordered_candidates();
            let profiles = ids
                .iter()
                .filter_map(|id| reg.get_profile(id).map(|p| (*id, p.clone())))
                .collect();
            (ids, profiles)
        };

        if candidates.is_empty() {
            return Err(LlmError::Unsupported(
                "no enabled API profile has a usable key".to_string(),
            ));
        }

        let mut last_err = None;
        for id in candidates {
            let Some(profile) = profiles.get(&id) else {
                continue;
            };
            let api_key = match std::env::var(&profile.api_key_env) {
                Ok(k) => k,
                Err(_) => continue,
            };

            let provider = build_provider(profile, api_key);
            let profile_config = LlmConfig {
                model: profile.default_model.clone(),
                ..config.clone()
            };

            match provider.complete(messages, &profile_config).await {
                Ok(resp) => {
                    let mut reg = self.registry.lock().await;
                    if let Some(usage) = reg.get_usage_mut(&id) {
                        usage.record_success(resp.input_tokens, resp.output_tokens, 0.0);
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    let mut reg = self.registry.lock().await;
                    if let Some(usage) = reg.get_usage_mut(&id) {
                        if matches!(e, LlmError::RateLimited { .. }) {
                            usage.record_rate_limit();
                        } else {
                            usage.record_error(e.to_string());
                        }
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(LlmError::Unsupported("no candidate profile available".to_string())))
    }

    async fn stream(
        &self,
        _messages: &[LlmMessage],
        _config: &LlmConfig,
    ) -> Result<std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        Err(LlmError::Unsupported(
            "streaming not supported through FailoverLlmProvider".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
