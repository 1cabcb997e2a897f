//! Qualifier LLM and provider registry (§4.10): a provider-agnostic
//! [`llm::LlmProvider`] trait driving Anthropic, OpenAI, or a local
//! OpenAI-compatible server, plus an [`api_profiles::ProfileRegistry`] that
//! tracks per-profile health and fails over to the next-best profile. Also
//! home to [`embedding::Embedder`], the indexer's vectorization seam (§4.8).

pub mod api_profiles;
pub mod embedding;
pub mod llm;

pub use llm::{
    AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole,
    LlmUsageTracker, LocalProvider, MockProvider, OpenAiProvider,
};

pub use api_profiles::{ApiProfile, FailoverLlmProvider, ProfileRegistry, ProfileUsage, ProviderKind};

pub use embedding::{EmbedError, Embedder, EmbeddingKind, HttpEmbedder, MockEmbedder};
