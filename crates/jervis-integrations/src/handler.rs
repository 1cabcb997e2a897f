//! Polling handler contract (§4.7): the central poller resolves one handler
//! per connection and hands it the connection plus the clients that
//! reference it. Handlers only stage artifacts — they never write to the
//! search store and never compute embeddings (that is the indexer's job,
//! §4.8).

use async_trait::async_trait;
use jervis_core::staging::StagingStore;
use jervis_core::types::{Client, Connection};

use crate::error::Result;
use crate::types::PollOutcome;

#[async_trait]
pub trait PollingHandler: Send + Sync {
    /// Whether this handler knows how to poll the given connection kind.
    fn can_handle(&self, connection: &Connection) -> bool;

    /// Poll once. Errors in a single connection must not stop the central
    /// poller's loop — callers log and continue rather than propagating.
    async fn poll(
        &self,
        store: &StagingStore,
        connection: &Connection,
        clients: &[Client],
    ) -> Result<PollOutcome>;

    /// `testConnection` (§4.1): a lightweight, side-effect-free probe that
    /// proves the connection's credentials actually work (e.g. "who am I",
    /// list the first page of spaces, open the configured mail folder). Does
    /// not stage any artifacts. The caller, not the handler, decides what to
    /// do with the result — flip the connection to `Valid` or `Invalid`.
    async fn test_connection(&self, connection: &Connection) -> Result<()>;
}
